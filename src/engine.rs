//! Training engine
//!
//! [`TrainingEngine`] owns every tensor of the fixed network (parameters,
//! activations, gradients, moment accumulators, moving statistics) and drives
//! the epoch loop:
//!
//! ```text
//! generate batch -> conv_bn_relu -> max_pool -> dense -> softmax_cross_entropy
//!                <- conv_bn_relu <- max_pool <- dense <-
//! Adam step over dense weights, conv weights, conv bias, gamma, beta
//! ```
//!
//! A run ends when the moving average of the recent losses drops below the
//! threshold (`Converged`) or when the epoch budget is spent (`ExhaustedEpochs`).
//! Either way a final inference-mode pass over a fresh batch reports accuracy.

use std::fmt;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::data::{BatchSource, SyntheticDigits};
use crate::error::{EngineError, Result};
use crate::kernels::conv::ConvGeometry;
use crate::kernels::fused::FusedGeometry;
use crate::kernels::pool::PoolGeometry;
use crate::layers::{
    DenseLayer, FusedConvBatchNormLayer, Layer, MaxPoolLayer, Mode, SoftmaxCrossEntropyLoss,
};
use crate::optimizers::{Adam, Moments, Optimizer, ParameterUpdate};
use crate::tensor::{Shape, Tensor};
use crate::utils::{argmax, LRScheduler, MilestoneDecay, SimpleRng};

/// Where the training loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Running,
    /// The moving-average loss dropped below the threshold.
    Converged,
    /// The epoch budget ran out first. Not an error.
    ExhaustedEpochs,
}

impl TrainingState {
    pub fn is_terminal(self) -> bool {
        self != TrainingState::Running
    }
}

impl fmt::Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainingState::Running => "running",
            TrainingState::Converged => "converged",
            TrainingState::ExhaustedEpochs => "exhausted epochs",
        };
        f.write_str(name)
    }
}

/// Fixed-size circular buffer of the most recent losses.
#[derive(Debug, Clone)]
pub struct LossWindow {
    values: Vec<f32>,
    capacity: usize,
    next: usize,
}

impl LossWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    /// Record a loss, evicting the oldest once full.
    pub fn push(&mut self, loss: f32) {
        if self.capacity == 0 {
            return;
        }
        if self.values.len() < self.capacity {
            self.values.push(loss);
        } else {
            self.values[self.next] = loss;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.values.len() == self.capacity
    }

    /// Arithmetic mean of the window, once it is full.
    pub fn average(&self) -> Option<f32> {
        if !self.is_full() {
            return None;
        }
        Some(self.values.iter().sum::<f32>() / self.capacity as f32)
    }
}

/// Outcome of an inference-mode pass over one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Percentage of samples whose predicted class equals the label, in `[0, 100]`.
    pub accuracy: f32,
    /// `(label, prediction)` per sample.
    pub predictions: Vec<(usize, usize)>,
}

/// Numbers reported after each completed epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    /// Completed epochs so far (1 after the first epoch).
    pub epoch: usize,
    pub loss: f32,
    pub moving_average: Option<f32>,
    pub learning_rate: f32,
    pub state: TrainingState,
}

/// Summary of a whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub state: TrainingState,
    pub epochs: usize,
    pub final_loss: f32,
    pub moving_average: Option<f32>,
    pub learning_rate: f32,
    pub evaluation: Evaluation,
}

impl TrainingReport {
    pub fn accuracy(&self) -> f32 {
        self.evaluation.accuracy
    }
}

/// `(label, prediction)` for the first `batch_size` rows of `logits` and
/// one-hot `labels`. Both are row-major `batch_size x classes`.
pub fn predictions(
    logits: &[f32],
    labels: &[f32],
    batch_size: usize,
    classes: usize,
) -> Vec<(usize, usize)> {
    if classes == 0 {
        return Vec::new();
    }
    logits
        .chunks_exact(classes)
        .zip(labels.chunks_exact(classes))
        .take(batch_size)
        .map(|(row, label)| (argmax(label), argmax(row)))
        .collect()
}

/// Percentage of rows whose logits arg-max equals the label arg-max.
pub fn accuracy(logits: &[f32], labels: &[f32], batch_size: usize, classes: usize) -> f32 {
    let pairs = predictions(logits, labels, batch_size, classes);
    percent_correct(&pairs)
}

fn percent_correct(pairs: &[(usize, usize)]) -> f32 {
    if pairs.is_empty() {
        return 0.0;
    }
    let correct = pairs.iter().filter(|(label, pred)| label == pred).count();
    correct as f32 * 100.0 / pairs.len() as f32
}

/// Caller-owned activation buffers, allocated once at the configured batch size.
#[derive(Debug)]
struct Activations {
    input: Tensor,
    labels: Tensor,
    conv: Tensor,
    pool: Tensor,
    logits: Tensor,
}

/// Gradient buffers matching [`Activations`].
#[derive(Debug)]
struct Gradients {
    logits: Tensor,
    pool: Tensor,
    conv: Tensor,
    input: Tensor,
}

/// Owns the network and runs the training loop.
pub struct TrainingEngine {
    config: EngineConfig,
    fused: FusedConvBatchNormLayer,
    pool: MaxPoolLayer,
    dense: DenseLayer,
    loss: SoftmaxCrossEntropyLoss,
    optimizer: Adam,
    moments: Vec<Moments>,
    scheduler: MilestoneDecay,
    source: Box<dyn BatchSource + Send>,
    activations: Activations,
    gradients: Gradients,
    window: LossWindow,
    epoch: usize,
    state: TrainingState,
    last_loss: Option<f32>,
}

impl fmt::Debug for TrainingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainingEngine")
            .field("epoch", &self.epoch)
            .field("state", &self.state)
            .field("learning_rate", &self.optimizer.learning_rate())
            .field("last_loss", &self.last_loss)
            .finish_non_exhaustive()
    }
}

impl TrainingEngine {
    /// Build an engine fed by the synthetic digit generator.
    ///
    /// One seed (or the clock) drives both weight initialisation and data.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let net = &config.network;
        if net.input_channels != 1 {
            return Err(EngineError::InvalidConfig(format!(
                "the digit generator draws single-channel images, got {} channels",
                net.input_channels
            )));
        }
        let mut rng = SimpleRng::from_seed_or_time(config.training.seed);
        let init_rng = rng.split();
        let source = SyntheticDigits::new(net.input_height, net.input_width, rng.split())?;
        if source.classes() != net.classes {
            return Err(EngineError::InvalidConfig(format!(
                "the digit generator labels {} classes, network has {}",
                source.classes(),
                net.classes
            )));
        }
        Self::build(config, Box::new(source), init_rng)
    }

    /// Build an engine fed by a custom batch source.
    pub fn with_source(
        config: EngineConfig,
        source: Box<dyn BatchSource + Send>,
        init_rng: SimpleRng,
    ) -> Result<Self> {
        config.validate()?;
        Self::build(config, source, init_rng)
    }

    fn build(
        config: EngineConfig,
        source: Box<dyn BatchSource + Send>,
        mut rng: SimpleRng,
    ) -> Result<Self> {
        let net = &config.network;
        let batch = net.batch_size;

        let conv = ConvGeometry {
            in_channels: net.input_channels,
            out_channels: net.conv_channels,
            height: net.input_height,
            width: net.input_width,
            kernel_size: net.kernel_size,
            padding: net.padding,
        };
        let mut fused = FusedConvBatchNormLayer::new(
            FusedGeometry {
                conv,
                momentum: net.bn_momentum,
                epsilon: net.bn_epsilon,
            },
            net.init_range,
            batch,
            &mut rng,
        )?;
        let pool = MaxPoolLayer::new(
            PoolGeometry {
                channels: conv.out_channels,
                height: conv.output_height(),
                width: conv.output_width(),
                window: net.pool_size,
            },
            batch,
        )?;
        let mut dense = DenseLayer::new(pool.output_shape(), net.classes, net.init_range, &mut rng)?;
        let loss = SoftmaxCrossEntropyLoss::new(net.classes);

        let activations = Activations {
            input: Tensor::zeros(fused.input_shape(), batch)?,
            labels: Tensor::zeros(loss.input_shape(), batch)?,
            conv: Tensor::zeros(fused.output_shape(), batch)?,
            pool: Tensor::zeros(pool.output_shape(), batch)?,
            logits: Tensor::zeros(dense.output_shape(), batch)?,
        };
        let gradients = Gradients {
            logits: Tensor::zeros(dense.output_shape(), batch)?,
            pool: Tensor::zeros(pool.output_shape(), batch)?,
            conv: Tensor::zeros(fused.output_shape(), batch)?,
            input: Tensor::zeros(fused.input_shape(), batch)?,
        };

        // Same order as every optimizer step: dense first, then the fused layer.
        let moments = dense
            .parameters()
            .into_iter()
            .chain(fused.parameters())
            .map(|p| Moments::for_parameter(p.value))
            .collect::<Result<Vec<_>>>()?;

        let optimizer = Adam::from_config(&config.optimizer);
        let scheduler = MilestoneDecay::new(
            config.optimizer.learning_rate,
            config.training.decay_epoch,
            config.training.decay_factor,
        );
        let window = LossWindow::new(config.training.recent_losses);

        info!(
            conv_channels = net.conv_channels,
            dense_inputs = dense.input_size(),
            parameters = fused.parameter_count() + dense.parameter_count(),
            batch_size = batch,
            "network allocated"
        );

        Ok(Self {
            config,
            fused,
            pool,
            dense,
            loss,
            optimizer,
            moments,
            scheduler,
            source,
            activations,
            gradients,
            window,
            epoch: 0,
            state: TrainingState::Running,
            last_loss: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Learning rate the optimizer will use for its next step.
    pub fn learning_rate(&self) -> f32 {
        self.scheduler.get_lr()
    }

    pub fn moving_average(&self) -> Option<f32> {
        self.window.average()
    }

    pub fn last_loss(&self) -> Option<f32> {
        self.last_loss
    }

    pub fn parameter_count(&self) -> usize {
        self.fused.parameter_count() + self.dense.parameter_count()
    }

    pub fn fused_layer(&self) -> &FusedConvBatchNormLayer {
        &self.fused
    }

    /// One training step on a fresh batch: forward, loss, backward, optimizer
    /// step. Returns the batch loss and advances the state machine.
    ///
    /// Fails with [`EngineError::TrainingFinished`] once the engine has
    /// converged or spent its epoch budget; nothing is touched in that case.
    pub fn train_one_epoch(&mut self) -> Result<f32> {
        self.advance().map(|record| record.loss)
    }

    /// Whether the epoch about to run is the first one at the decayed rate.
    fn decay_starts_now(&self) -> bool {
        self.scheduler.has_decayed()
            && self.scheduler.current_epoch() == self.config.training.decay_epoch
    }

    fn advance(&mut self) -> Result<EpochRecord> {
        if self.state.is_terminal() {
            return Err(EngineError::TrainingFinished { state: self.state });
        }
        let batch = self.config.network.batch_size;
        let learning_rate = self.scheduler.get_lr();

        if self.decay_starts_now() {
            info!(epoch = self.epoch + 1, learning_rate, "learning rate decayed");
        }
        self.optimizer.set_learning_rate(learning_rate);

        self.source.generate_batch(
            batch,
            &mut self.activations.input,
            &mut self.activations.labels,
        )?;
        self.forward(batch, Mode::Training)?;
        let loss = self.loss.forward(
            batch,
            &self.activations.logits,
            &self.activations.labels,
            &mut self.gradients.logits,
        )?;
        self.backward(batch)?;
        self.step()?;

        self.epoch += 1;
        self.scheduler.step();
        self.last_loss = Some(loss);
        self.window.push(loss);
        let moving_average = self.window.average();

        let interval = self.config.training.log_interval;
        if interval > 0 && self.epoch % interval == 0 {
            info!(epoch = self.epoch, loss, moving_average = ?moving_average, "training progress");
        }

        match moving_average {
            Some(avg) if avg < self.config.training.loss_threshold => {
                info!(epoch = self.epoch, moving_average = avg, "converged");
                self.state = TrainingState::Converged;
            }
            _ if self.epoch >= self.config.training.max_epochs => {
                info!(epoch = self.epoch, "epoch budget exhausted");
                self.state = TrainingState::ExhaustedEpochs;
            }
            _ => {}
        }

        Ok(EpochRecord {
            epoch: self.epoch,
            loss,
            moving_average,
            learning_rate,
            state: self.state,
        })
    }

    fn forward(&mut self, batch: usize, mode: Mode) -> Result<()> {
        let acts = &mut self.activations;
        self.fused.forward(batch, &acts.input, &mut acts.conv, mode)?;
        self.pool.forward(batch, &acts.conv, &mut acts.pool, mode)?;
        self.dense.forward(batch, &acts.pool, &mut acts.logits, mode)?;
        Ok(())
    }

    fn backward(&mut self, batch: usize) -> Result<()> {
        let acts = &self.activations;
        let grads = &mut self.gradients;
        self.dense.backward(
            batch,
            &acts.pool,
            &acts.logits,
            &grads.logits,
            &mut grads.pool,
        )?;
        self.pool.backward(
            batch,
            &acts.conv,
            &acts.pool,
            &grads.pool,
            &mut grads.conv,
        )?;
        self.fused.backward(
            batch,
            &acts.input,
            &acts.conv,
            &grads.conv,
            &mut grads.input,
        )?;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let mut updates: Vec<ParameterUpdate<'_>> = self
            .dense
            .parameters()
            .into_iter()
            .chain(self.fused.parameters())
            .zip(self.moments.iter_mut())
            .map(|(p, moments)| ParameterUpdate {
                name: p.name,
                parameter: p.value,
                gradient: p.gradient,
                moments,
            })
            .collect();
        self.optimizer.step(&mut updates)
    }

    /// Inference-mode pass over a fresh batch. Moving statistics are used as-is
    /// and no parameter or statistic changes.
    pub fn evaluate(&mut self) -> Result<Evaluation> {
        let batch = self.config.network.batch_size;
        self.source.generate_batch(
            batch,
            &mut self.activations.input,
            &mut self.activations.labels,
        )?;
        self.forward(batch, Mode::Inference)?;

        let classes = self.config.network.classes;
        let pairs = predictions(
            self.activations.logits.as_slice(),
            self.activations.labels.as_slice(),
            batch,
            classes,
        );
        for (sample, (label, prediction)) in pairs.iter().enumerate() {
            debug!(sample, label, prediction, "evaluation");
        }
        Ok(Evaluation {
            accuracy: percent_correct(&pairs),
            predictions: pairs,
        })
    }

    /// Train until a terminal state, calling `on_epoch` after every epoch, then
    /// evaluate.
    pub fn run_training_with<F>(&mut self, mut on_epoch: F) -> Result<TrainingReport>
    where
        F: FnMut(&EpochRecord) -> Result<()>,
    {
        info!(
            max_epochs = self.config.training.max_epochs,
            threshold = self.config.training.loss_threshold,
            learning_rate = self.scheduler.get_lr(),
            "training started"
        );
        while !self.state.is_terminal() {
            let record = self.advance()?;
            on_epoch(&record)?;
        }

        let evaluation = self.evaluate()?;
        let report = TrainingReport {
            state: self.state,
            epochs: self.epoch,
            final_loss: self.last_loss.unwrap_or(f32::NAN),
            moving_average: self.window.average(),
            learning_rate: self.optimizer.learning_rate(),
            evaluation,
        };
        info!(
            state = %report.state,
            epochs = report.epochs,
            final_loss = report.final_loss,
            moving_average = ?report.moving_average,
            accuracy = report.evaluation.accuracy,
            "training finished"
        );
        Ok(report)
    }

    /// Train until converged or out of epochs, then report accuracy on a fresh batch.
    pub fn run_training_example(&mut self) -> Result<TrainingReport> {
        self.run_training_with(|_| Ok(()))
    }
}

/// Per-sample shape of the images the engine expects from its batch source.
pub fn input_shape(config: &EngineConfig) -> Shape {
    Shape::ImageChw {
        channels: config.network.input_channels,
        height: config.network.input_height,
        width: config.network.input_width,
    }
}
