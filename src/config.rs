//! Configuration management
//!
//! One TOML file with `[rehearsal]`, `[model]`, `[training]` and `[logging]`
//! sections. The dataset name and save directory come from `[training]` and
//! are copied into the rehearsal settings by [`Config::rehearsal_config`].

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::model::ModelConfig;
use crate::rehearsal::RehearsalConfig;
use crate::training::TrainerConfig;
use crate::{RehearsalError, Result};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub rehearsal: RehearsalConfig,
    pub model: ModelConfig,
    pub training: TrainerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            RehearsalError::Persistence {
                path: path.to_path_buf(),
                source,
            }
        })?;
        toml::from_str(&content)
            .map_err(|e| RehearsalError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    /// Load configuration from file or use default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| RehearsalError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, content).map_err(|source| RehearsalError::Persistence {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Create default configuration file
    pub fn create_default<P: AsRef<Path>>(path: P) -> Result<()> {
        Config::default().save(path)
    }

    /// Rehearsal settings keyed by the training dataset and save directory.
    pub fn rehearsal_config(&self) -> RehearsalConfig {
        RehearsalConfig {
            dataset_name: self.training.dataset_name.clone(),
            save_dir: self.training.save_dir.clone(),
            ..self.rehearsal.clone()
        }
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        self.rehearsal_config().validate()?;
        self.model.validate()?;
        self.training.validate()?;
        if self.model.initial_classes != self.training.base_increment {
            return Err(RehearsalError::InvalidConfig(format!(
                "model.initial_classes ({}) must equal training.base_increment ({})",
                self.model.initial_classes, self.training.base_increment
            )));
        }
        if self.model.batch_size != self.training.batch_size {
            tracing::warn!(
                "model.batch_size {} differs from training.batch_size {}",
                self.model.batch_size,
                self.training.batch_size
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OptimizerKind;
    use crate::rehearsal::RehearsalKind;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.rehearsal.num_samples_per_class, 10);
        assert_eq!(config.rehearsal.components_range, vec![2, 3, 4]);
        assert_eq!(config.training.optimizer.kind, OptimizerKind::Adam);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.rehearsal.kind = RehearsalKind::GaussianDistribution;
        config.rehearsal.seed = Some(11);
        config.training.shuffle_seed = Some(3);
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let toml_str = r#"
            [rehearsal]
            kind = "GaussianDistribution"
            num_samples_per_class = 50

            [training]
            dataset_name = "har"
            save_dir = "runs"

            [training.optimizer]
            kind = "SGD"
            learning_rate = 0.01
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.rehearsal.num_samples_per_class, 50);
        assert_eq!(config.training.optimizer.kind, OptimizerKind::Sgd);
        assert_eq!(config.training.n_epochs, 10);

        let rehearsal = config.rehearsal_config();
        assert_eq!(
            rehearsal.save_path(),
            std::path::PathBuf::from("runs/har/rehearsal_data.json")
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.rehearsal.components_range = vec![];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.base_increment = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = Config::load_or_default("/definitely/not/here.toml");
        assert_eq!(config, Config::default());
    }
}
