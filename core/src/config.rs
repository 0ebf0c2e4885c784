//! Run configuration.
//!
//! Values come from, in increasing priority: built-in defaults, a TOML file, `MESHTRAIN_*`
//! environment variables, and explicit overrides from the command line. [`RunConfig::validate`]
//! runs last and checks that the pieces fit together (mesh size, batch and model splits).
//!
//! ```toml
//! [mesh]
//! dims = [{ name = "batch", size = 4 }, { name = "model", size = 2 }]
//! device_type = "CPU"
//! num_global_devices = 8
//! num_clients = 2
//!
//! [train]
//! num_epochs = 3
//! learning_rate = 0.001
//! ```

use crate::data::SyntheticConfig;
use crate::mesh::{DeviceType, MeshDim};
use crate::models::BertConfig;
use crate::optim::OptimizerKind;
use crate::train::TrainOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value {value:?} for {var}")]
    Env { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    pub dims: Vec<MeshDim>,
    pub batch_dim: String,
    pub model_dim: String,
    pub device_type: DeviceType,
    pub num_global_devices: usize,
    pub num_clients: usize,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            dims: vec![MeshDim::new("batch", 4), MeshDim::new("model", 2)],
            batch_dim: "batch".into(),
            model_dim: "model".into(),
            device_type: DeviceType::Cpu,
            num_global_devices: 8,
            num_clients: 2,
        }
    }
}

impl MeshSettings {
    pub fn dim_size(&self, name: &str) -> Option<usize> {
        self.dims.iter().find(|d| d.name == name).map(|d| d.size)
    }

    pub fn devices_per_client(&self) -> usize {
        self.num_global_devices / self.num_clients.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSettings {
    #[serde(flatten)]
    pub options: TrainOptions,
    pub learning_rate: f32,
    pub optimizer: OptimizerKind,
    /// Seed shared by every client for parameter initialisation.
    pub seed: u64,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            options: TrainOptions::default(),
            learning_rate: 0.001,
            optimizer: OptimizerKind::Adam,
            seed: 1337,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Storage location, e.g. a directory, `file://...` or `mem://bucket`.
    pub prefix: String,
    /// Path of the checkpoint below `prefix`; saves append `-<n>`.
    pub name: String,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            prefix: "checkpoints".into(),
            name: "bert-checkpoint-1/cpt".into(),
        }
    }
}

impl CheckpointSettings {
    pub fn location(&self) -> String {
        crate::checkpoint::join_key(&self.prefix, &self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub mesh: MeshSettings,
    pub model: BertConfig,
    pub data: SyntheticConfig,
    pub train: TrainSettings,
    pub checkpoint: CheckpointSettings,
}

fn parse<T: FromStr>(var: &str, value: String) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value,
    })
}

impl RunConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Applies `MESHTRAIN_*` variables from the process environment.
    pub fn from_env(self) -> Result<Self> {
        self.from_env_with(|var| std::env::var(var).ok())
    }

    /// Applies `MESHTRAIN_*` variables looked up through `lookup`.
    pub fn from_env_with(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("MESHTRAIN_NUM_CLIENTS") {
            self.mesh.num_clients = parse("MESHTRAIN_NUM_CLIENTS", v)?;
        }
        if let Some(v) = lookup("MESHTRAIN_NUM_GLOBAL_DEVICES") {
            self.mesh.num_global_devices = parse("MESHTRAIN_NUM_GLOBAL_DEVICES", v)?;
        }
        if let Some(v) = lookup("MESHTRAIN_DEVICE_TYPE") {
            self.mesh.device_type = parse("MESHTRAIN_DEVICE_TYPE", v)?;
        }
        if let Some(v) = lookup("MESHTRAIN_BATCH_SIZE") {
            self.data.batch_size = parse("MESHTRAIN_BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("MESHTRAIN_EPOCHS") {
            self.train.options.num_epochs = parse("MESHTRAIN_EPOCHS", v)?;
        }
        if let Some(v) = lookup("MESHTRAIN_STEPS_PER_EPOCH") {
            self.train.options.steps_per_epoch = parse("MESHTRAIN_STEPS_PER_EPOCH", v)?;
        }
        if let Some(v) = lookup("MESHTRAIN_LEARNING_RATE") {
            self.train.learning_rate = parse("MESHTRAIN_LEARNING_RATE", v)?;
        }
        if let Some(v) = lookup("MESHTRAIN_SEED") {
            self.train.seed = parse("MESHTRAIN_SEED", v)?;
        }
        if let Some(v) = lookup("MESHTRAIN_CHECKPOINT_PREFIX") {
            self.checkpoint.prefix = v;
        }
        Ok(self)
    }

    /// Checks that the mesh, data and model settings fit together.
    pub fn validate(self) -> Result<Self> {
        let mesh = &self.mesh;
        let product: usize = mesh.dims.iter().map(|d| d.size).product();
        if product != mesh.num_global_devices {
            return Err(ConfigError::Invalid(format!(
                "mesh dims multiply to {product} devices but num_global_devices is {}",
                mesh.num_global_devices
            )));
        }
        if mesh.num_clients == 0 || mesh.num_global_devices % mesh.num_clients != 0 {
            return Err(ConfigError::Invalid(format!(
                "{} devices cannot be split evenly over {} clients",
                mesh.num_global_devices, mesh.num_clients
            )));
        }
        let batch = mesh.dim_size(&mesh.batch_dim).ok_or_else(|| {
            ConfigError::Invalid(format!("batch dimension `{}` is not a mesh dimension", mesh.batch_dim))
        })?;
        let model = mesh.dim_size(&mesh.model_dim).ok_or_else(|| {
            ConfigError::Invalid(format!("model dimension `{}` is not a mesh dimension", mesh.model_dim))
        })?;
        if self.data.batch_size % batch != 0 {
            return Err(ConfigError::Invalid(format!(
                "batch size {} is not divisible by the {batch} batch replicas",
                self.data.batch_size
            )));
        }
        for (name, size) in [
            ("hidden_size", self.model.hidden_size),
            ("intermediate_size", self.model.intermediate_size),
        ] {
            if size % model != 0 {
                return Err(ConfigError::Invalid(format!(
                    "model {name} {size} is not divisible by the {model} model shards"
                )));
            }
        }
        if self.model.vocab_size < self.data.vocab_size
            || self.model.type_vocab_size < self.data.num_classes
            || self.model.num_classes < self.data.num_classes
        {
            return Err(ConfigError::Invalid(
                "model vocabularies must cover the generated ids and labels".into(),
            ));
        }
        if !self.train.learning_rate.is_finite() || self.train.learning_rate <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "learning rate must be positive, got {}",
                self.train.learning_rate
            )));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = RunConfig::default().validate().unwrap();
        assert_eq!(config.mesh.devices_per_client(), 4);
        assert_eq!(config.checkpoint.location(), "checkpoints/bert-checkpoint-1/cpt");
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = RunConfig::from_toml_str(
            r#"
            [mesh]
            dims = [{ name = "batch", size = 2 }, { name = "model", size = 2 }]
            num_global_devices = 4
            num_clients = 4
            device_type = "GPU"

            [train]
            num_epochs = 5
            optimizer = "sgd"
            "#,
        )
        .unwrap();
        assert_eq!(config.mesh.dims[0], MeshDim::new("batch", 2));
        assert_eq!(config.mesh.device_type, DeviceType::Gpu);
        assert_eq!(config.train.options.num_epochs, 5);
        assert_eq!(config.train.options.steps_per_epoch, 10);
        assert_eq!(config.train.optimizer, OptimizerKind::Sgd);
        assert_eq!(config.data.batch_size, 32);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MESHTRAIN_NUM_CLIENTS", "4"),
            ("MESHTRAIN_DEVICE_TYPE", "gpu"),
            ("MESHTRAIN_LEARNING_RATE", "0.01"),
            ("MESHTRAIN_CHECKPOINT_PREFIX", "mem://bucket"),
        ]);
        let config = RunConfig::default()
            .from_env_with(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.mesh.num_clients, 4);
        assert_eq!(config.mesh.device_type, DeviceType::Gpu);
        assert_eq!(config.train.learning_rate, 0.01);
        assert_eq!(config.checkpoint.prefix, "mem://bucket");
    }

    #[test]
    fn test_bad_env_value() {
        let err = RunConfig::default()
            .from_env_with(|k| (k == "MESHTRAIN_EPOCHS").then(|| "three".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = RunConfig::default();
        config.mesh.num_global_devices = 6;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.data.batch_size = 30;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.model.hidden_size = 63;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.mesh.num_clients = 3;
        assert!(config.validate().is_err());
    }
}
