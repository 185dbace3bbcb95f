//! Tests for configuration loading
//!
//! - The bundled config file matches the defaults
//! - Partial files fall back to defaults
//! - Invalid JSON, invalid values and missing files

use digit_trainer::optimizers::Regularization;
use digit_trainer::{load_config, EngineConfig, EngineError};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn write_temp_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp config");
    file.write_all(contents.as_bytes())
        .expect("failed to write temp config");
    file
}

// ============================================================================
// Valid Config Loading Tests
// ============================================================================

mod valid_config_tests {
    use super::*;

    #[test]
    fn test_bundled_config_matches_defaults() {
        let config = load_config("config/digits.json").expect("Failed to load bundled config");

        let mut expected = EngineConfig::default();
        expected.training.loss_log_path = Some(PathBuf::from("logs/training_loss_digits.csv"));
        assert_eq!(config, expected);
    }

    #[test]
    fn test_empty_object_is_default() {
        let temp = write_temp_config("{}");
        let config = load_config(temp.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let temp = write_temp_config(
            r#"{
  "optimizer": { "regularization": "l1", "learning_rate": 0.005 },
  "training": { "seed": 1234 }
}"#,
        );
        let config = load_config(temp.path()).unwrap();

        assert_eq!(config.optimizer.regularization, Regularization::L1);
        assert_eq!(config.optimizer.learning_rate, 0.005);
        assert_eq!(config.optimizer.clip_max, 0.5);
        assert_eq!(config.training.seed, Some(1234));
        assert_eq!(config.training.max_epochs, 1000);
        assert_eq!(config.network.batch_size, 32);
    }

    #[test]
    fn test_regularization_none() {
        let temp = write_temp_config(r#"{ "optimizer": { "regularization": "none" } }"#);
        let config = load_config(temp.path()).unwrap();
        assert_eq!(config.optimizer.regularization, Regularization::None);
    }
}

// ============================================================================
// Error Handling Tests
// ============================================================================

mod error_tests {
    use super::*;

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config("config/does_not_exist.json").unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let temp = write_temp_config(r#"{ "network": { "batch_size": 32, }"#);
        assert!(matches!(
            load_config(temp.path()),
            Err(EngineError::Json(_))
        ));
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let temp = write_temp_config(r#"{ "network": { "batch_size": "large" } }"#);
        assert!(matches!(
            load_config(temp.path()),
            Err(EngineError::Json(_))
        ));
    }

    #[test]
    fn test_unknown_regularization_is_parse_error() {
        let temp = write_temp_config(r#"{ "optimizer": { "regularization": "l3" } }"#);
        assert!(load_config(temp.path()).is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected_after_parsing() {
        for contents in [
            r#"{ "network": { "batch_size": 0 } }"#,
            r#"{ "network": { "kernel_size": 2 } }"#,
            r#"{ "optimizer": { "beta1": 1.0 } }"#,
            r#"{ "optimizer": { "learning_rate": -0.1 } }"#,
            r#"{ "training": { "recent_losses": 0 } }"#,
            r#"{ "training": { "decay_factor": 0.0 } }"#,
        ] {
            let temp = write_temp_config(contents);
            let err = load_config(temp.path()).unwrap_err();
            assert!(
                matches!(err, EngineError::InvalidConfig(_)),
                "{contents} gave {err}"
            );
        }
    }
}
