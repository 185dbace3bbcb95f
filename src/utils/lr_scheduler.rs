//! Learning rate schedules
//!
//! The training loop owns the schedule and pushes its value into the optimizer.
//! The optimizer's step logic never looks at the epoch counter.

/// Core trait for learning rate schedulers.
///
/// # Example
///
/// ```ignore
/// let mut scheduler = MilestoneDecay::new(0.01, 500, 10.0);
/// for epoch in 0..max_epochs {
///     optimizer.set_learning_rate(scheduler.get_lr());
///     // ... train one epoch ...
///     scheduler.step();
/// }
/// ```
pub trait LRScheduler {
    /// Learning rate for the current epoch.
    fn get_lr(&self) -> f32;

    /// Advance to the next epoch.
    fn step(&mut self);
}

/// One-time decay: the learning rate is divided by `factor` when the epoch counter
/// reaches `milestone`, and never changes again.
///
/// Division is applied to the initial rate directly, so the decayed value is exactly
/// `initial_lr / factor`.
#[derive(Debug, Clone)]
pub struct MilestoneDecay {
    initial_lr: f32,
    milestone: usize,
    factor: f32,
    current_epoch: usize,
    current_lr: f32,
}

impl MilestoneDecay {
    /// # Arguments
    ///
    /// * `initial_lr` - Learning rate for epochs `0..milestone`
    /// * `milestone` - First epoch that uses the decayed rate
    /// * `factor` - Divisor applied once (must be positive)
    pub fn new(initial_lr: f32, milestone: usize, factor: f32) -> Self {
        let mut scheduler = Self {
            initial_lr,
            milestone,
            factor,
            current_epoch: 0,
            current_lr: initial_lr,
        };
        scheduler.recompute();
        scheduler
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Whether the decay has been applied.
    pub fn has_decayed(&self) -> bool {
        self.current_epoch >= self.milestone
    }

    fn recompute(&mut self) {
        self.current_lr = if self.has_decayed() {
            self.initial_lr / self.factor
        } else {
            self.initial_lr
        };
    }
}

impl LRScheduler for MilestoneDecay {
    fn get_lr(&self) -> f32 {
        self.current_lr
    }

    fn step(&mut self) {
        self.current_epoch += 1;
        self.recompute();
    }

}
