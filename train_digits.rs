// Train the fused conv/batch-norm digit classifier on synthetic 20x20 images.
//
// Usage: train_digits [config.json]
//
// Outputs:
//   - progress and summary on the console (RUST_LOG controls verbosity)
//   - optional CSV loss log (epoch,loss,moving_average,seconds) when
//     `training.loss_log_path` is set in the config

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process;
use std::time::Instant;

use digit_trainer::config::{load_config, EngineConfig};
use digit_trainer::engine::{EpochRecord, TrainingEngine, TrainingReport};
use digit_trainer::error::{EngineError, Result};
use tracing_subscriber::EnvFilter;

/// Config from the first CLI argument, or the defaults when none is given.
fn config_from_args(args: &[String]) -> Result<EngineConfig> {
    match args.get(1) {
        Some(path) => load_config(path),
        None => {
            let config = EngineConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Create the CSV loss log (and its parent directory) and write the header.
fn open_loss_log(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut log = BufWriter::new(File::create(path)?);
    writeln!(log, "epoch,loss,moving_average,seconds")?;
    Ok(log)
}

fn write_record<W: Write>(log: &mut W, record: &EpochRecord, seconds: f32) -> Result<()> {
    let moving = record
        .moving_average
        .map(|m| m.to_string())
        .unwrap_or_default();
    writeln!(log, "{},{},{},{}", record.epoch, record.loss, moving, seconds)?;
    Ok(())
}

fn summary_lines(report: &TrainingReport) -> Vec<String> {
    let moving = report
        .moving_average
        .map(|m| format!("{:.6}", m))
        .unwrap_or_else(|| "n/a".to_string());
    vec![
        format!("State: {}", report.state),
        format!("Epochs: {}", report.epochs),
        format!("Final loss: {:.6}", report.final_loss),
        format!("Moving average: {}", moving),
        format!("Learning rate: {}", report.learning_rate),
        format!("Accuracy: {:.2}%", report.accuracy()),
    ]
}

fn run(args: &[String]) -> Result<TrainingReport> {
    let config = config_from_args(args)?;
    let mut log = match &config.training.loss_log_path {
        Some(path) => Some(open_loss_log(path)?),
        None => None,
    };

    let mut engine = TrainingEngine::new(config)?;
    let mut epoch_start = Instant::now();
    let report = engine.run_training_with(|record| {
        let secs = epoch_start.elapsed().as_secs_f32();
        epoch_start = Instant::now();
        if let Some(log) = log.as_mut() {
            write_record(log, record, secs)?;
        }
        Ok(())
    })?;

    if let Some(mut log) = log {
        log.flush()?;
    }
    Ok(report)
}

fn failure_message(err: &EngineError) -> String {
    match err.phase() {
        Some(phase) => format!("Training aborted in {} phase: {}", phase, err),
        None => format!("Training aborted: {}", err),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    match run(&args) {
        Ok(report) => {
            for line in summary_lines(&report) {
                println!("{}", line);
            }
        }
        Err(err) => {
            eprintln!("{}", failure_message(&err));
            process::exit(1);
        }
    }
}
