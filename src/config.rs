// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Configuration structs for training and conversion.
//!
//! Architecture dimensions, solver settings and converter paths all live
//! here, together with the device selection that is threaded through the
//! solver and converter constructors.

use crate::error::{Result, VcError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::Device;

/// Architecture record stored alongside generator weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hyperparams {
    /// Width of the content-code bottleneck
    #[serde(default = "default_dim_neck")]
    pub dim_neck: i64,

    /// Speaker embedding dimension
    #[serde(default = "default_dim_emb")]
    pub dim_emb: i64,

    /// Decoder pre-net width
    #[serde(default = "default_dim_pre")]
    pub dim_pre: i64,

    /// Content-code down-sampling factor (frames per code)
    #[serde(default = "default_freq")]
    pub freq: i64,
}

fn default_dim_neck() -> i64 {
    32
}
fn default_dim_emb() -> i64 {
    256
}
fn default_dim_pre() -> i64 {
    512
}
fn default_freq() -> i64 {
    32
}

impl Hyperparams {
    /// Used when a checkpoint carries no architecture record.
    pub const FALLBACK: Hyperparams = Hyperparams {
        dim_neck: 32,
        dim_emb: 256,
        dim_pre: 512,
        freq: 32,
    };

    /// Create a new architecture record.
    pub fn new(dim_neck: i64, dim_emb: i64, dim_pre: i64, freq: i64) -> Self {
        Self {
            dim_neck,
            dim_emb,
            dim_pre,
            freq,
        }
    }

    /// Pack as `[dim_neck, dim_emb, dim_pre, freq]`.
    pub fn to_array(&self) -> [i64; 4] {
        [self.dim_neck, self.dim_emb, self.dim_pre, self.freq]
    }

    /// Unpack from `[dim_neck, dim_emb, dim_pre, freq]`.
    pub fn from_slice(values: &[i64]) -> Option<Self> {
        match values {
            [neck, emb, pre, freq] => Some(Self::new(*neck, *emb, *pre, *freq)),
            _ => None,
        }
    }

    /// Check that every dimension is positive.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("dim_neck", self.dim_neck),
            ("dim_emb", self.dim_emb),
            ("dim_pre", self.dim_pre),
            ("freq", self.freq),
        ] {
            if value <= 0 {
                return Err(VcError::Config(format!("{name} must be positive, got {value}")));
            }
        }
        Ok(())
    }
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self::FALLBACK
    }
}

/// What the solver does with its state on an interrupt signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    /// Write a checkpoint to the autosave path before stopping
    Autosave,
    /// Stop without saving
    Manual,
}

impl std::str::FromStr for CheckpointMode {
    type Err = VcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "autosave" => Ok(CheckpointMode::Autosave),
            "manual" => Ok(CheckpointMode::Manual),
            other => Err(VcError::Config(format!(
                "unknown checkpoint mode '{other}' (expected autosave or manual)"
            ))),
        }
    }
}

/// Configuration for the training solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // === Loss ===
    /// Weight of the content-code consistency term (default: 1.0)
    pub lambda_cd: f64,

    // === Model ===
    /// Generator architecture
    #[serde(flatten)]
    pub hyperparams: Hyperparams,

    /// Full checkpoint to resume from
    pub init_model: Option<PathBuf>,

    // === Data ===
    /// Batch size (default: 2)
    pub batch_size: usize,

    /// Frames per training crop (default: 128)
    pub len_crop: i64,

    // === Schedule ===
    /// Iterations to run in this session (default: 1000000)
    pub num_iters: usize,

    // === Optimization ===
    /// Adam learning rate (default: 1e-4)
    pub learning_rate: f64,

    /// Adam beta1 (default: 0.9)
    pub beta1: f64,

    /// Adam beta2 (default: 0.999)
    pub beta2: f64,

    /// Adam epsilon (default: 1e-8)
    pub epsilon: f64,

    // === Checkpointing ===
    /// Save on interrupt or not (default: autosave)
    pub checkpoint_mode: CheckpointMode,

    /// Save a full checkpoint every N iterations, 0 disables (default: 0)
    pub save_every_n_iter: usize,

    /// File name prefix for periodic checkpoints (default: "autovc")
    pub save_path: String,

    /// Directory for periodic checkpoints (default: "trained_models")
    pub checkpoint_dir: PathBuf,

    /// Where the interrupt autosave goes (default: "autovc_autosave.ckpt")
    pub autosave_path: PathBuf,

    // === Logging ===
    /// Log losses every N iterations (default: 10)
    pub log_step: usize,

    // === Circular variant ===
    /// Penalize speaker drift of the converted spectrogram (default: false)
    pub use_speaker_loss: bool,

    /// TorchScript speaker encoder used by the speaker loss
    pub speaker_encoder: Option<PathBuf>,

    // === Runtime ===
    /// Compute device: "cpu", "cuda", "cuda:N" or "auto" (default: "auto")
    pub device: String,

    /// Random seed for batch shuffling and crops
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lambda_cd: 1.0,
            hyperparams: Hyperparams::default(),
            init_model: None,
            batch_size: 2,
            len_crop: 128,
            num_iters: 1_000_000,
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            checkpoint_mode: CheckpointMode::Autosave,
            save_every_n_iter: 0,
            save_path: "autovc".to_string(),
            checkpoint_dir: PathBuf::from("trained_models"),
            autosave_path: PathBuf::from("autovc_autosave.ckpt"),
            log_step: 10,
            use_speaker_loss: false,
            speaker_encoder: None,
            device: "auto".to_string(),
            seed: 1234,
        }
    }
}

impl TrainingConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set generator architecture
    pub fn with_hyperparams(mut self, hyperparams: Hyperparams) -> Self {
        self.hyperparams = hyperparams;
        self
    }

    /// Set the code-consistency loss weight
    pub fn with_lambda_cd(mut self, lambda_cd: f64) -> Self {
        self.lambda_cd = lambda_cd;
        self
    }

    /// Set learning rate
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set iteration count
    pub fn with_num_iters(mut self, num_iters: usize) -> Self {
        self.num_iters = num_iters;
        self
    }

    /// Set log interval
    pub fn with_log_step(mut self, steps: usize) -> Self {
        self.log_step = steps;
        self
    }

    /// Set checkpoint interval and prefix
    pub fn with_checkpoints(mut self, every_n_iter: usize, prefix: impl Into<String>) -> Self {
        self.save_every_n_iter = every_n_iter;
        self.save_path = prefix.into();
        self
    }

    /// Set checkpoint directory
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    /// Set interrupt behaviour and autosave target
    pub fn with_checkpoint_mode(mut self, mode: CheckpointMode) -> Self {
        self.checkpoint_mode = mode;
        self
    }

    /// Set autosave path
    pub fn with_autosave_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.autosave_path = path.into();
        self
    }

    /// Set checkpoint to resume from
    pub fn with_init_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.init_model = Some(path.into());
        self
    }

    /// Enable the speaker-consistency loss of the circular solver
    pub fn with_speaker_loss(mut self, encoder: impl Into<PathBuf>) -> Self {
        self.use_speaker_loss = true;
        self.speaker_encoder = Some(encoder.into());
        self
    }

    /// Set compute device
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    /// Whether an interrupt should trigger a save
    pub fn autosave(&self) -> bool {
        self.checkpoint_mode == CheckpointMode::Autosave
    }

    /// Load config from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VcError::not_found("training config", path));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save config to a JSON file
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.hyperparams.validate()?;
        if self.learning_rate <= 0.0 {
            return Err(VcError::Config("learning_rate must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(VcError::Config("batch_size must be at least 1".to_string()));
        }
        if self.log_step == 0 {
            return Err(VcError::Config("log_step must be at least 1".to_string()));
        }
        if self.len_crop <= 0 || self.len_crop % self.hyperparams.freq != 0 {
            return Err(VcError::Config(format!(
                "len_crop ({}) must be a positive multiple of freq ({})",
                self.len_crop, self.hyperparams.freq
            )));
        }
        if self.use_speaker_loss && self.speaker_encoder.is_none() {
            return Err(VcError::Config(
                "use_speaker_loss requires a speaker_encoder path".to_string(),
            ));
        }
        parse_device(&self.device)?;
        Ok(())
    }
}

/// Configuration for the conversion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Generator checkpoint (default: "autovc.ckpt")
    pub model: PathBuf,

    /// Spectrogram cache root (default: "./training_set/spmel")
    pub spectrogram_dir: PathBuf,

    /// Waveform root the sources are named against (default: "./training_set/wavs")
    pub wav_dir: PathBuf,

    /// Speaker metadata, relative to `spectrogram_dir` unless absolute (default: "train.json")
    pub metadata: PathBuf,

    /// TorchScript vocoder (default: "checkpoint_step001000000_ema.pt")
    pub vocoder: PathBuf,

    /// Where converted waveforms go (default: "results")
    pub output_dir: PathBuf,

    /// Compute device (default: "auto")
    pub device: String,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("autovc.ckpt"),
            spectrogram_dir: PathBuf::from("./training_set/spmel"),
            wav_dir: PathBuf::from("./training_set/wavs"),
            metadata: PathBuf::from("train.json"),
            vocoder: PathBuf::from("checkpoint_step001000000_ema.pt"),
            output_dir: PathBuf::from("results"),
            device: "auto".to_string(),
        }
    }
}

impl ConverterConfig {
    /// Resolved path of the speaker metadata file.
    pub fn metadata_path(&self) -> PathBuf {
        self.spectrogram_dir.join(&self.metadata)
    }
}

/// Parse a device string into a torch device.
///
/// Accepts `cpu`, `cuda`, `cuda:N` and `auto` (CUDA when available).
pub fn parse_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_lowercase();
    match spec.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => Ok(Device::Cuda(0)),
        "auto" => Ok(Device::cuda_if_available()),
        other => {
            let index = other
                .strip_prefix("cuda:")
                .and_then(|i| i.parse::<usize>().ok())
                .ok_or_else(|| VcError::Config(format!("unknown device '{other}'")))?;
            Ok(Device::Cuda(index))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_hyperparams() {
        let hp = Hyperparams::default();
        assert_eq!(hp.to_array(), [32, 256, 512, 32]);
        assert_eq!(Hyperparams::from_slice(&[32, 256, 512, 32]), Some(hp));
        assert_eq!(Hyperparams::from_slice(&[32, 256]), None);
    }

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.autosave());
        assert_eq!(config.checkpoint_dir, PathBuf::from("trained_models"));
    }

    #[test]
    fn test_builder_pattern() {
        let config = TrainingConfig::new()
            .with_learning_rate(5e-5)
            .with_batch_size(8)
            .with_num_iters(500)
            .with_checkpoints(100, "run1")
            .with_checkpoint_mode(CheckpointMode::Manual);

        assert_eq!(config.learning_rate, 5e-5);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.num_iters, 500);
        assert_eq!(config.save_every_n_iter, 100);
        assert_eq!(config.save_path, "run1");
        assert!(!config.autosave());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(TrainingConfig::new().with_batch_size(0).validate().is_err());
        assert!(TrainingConfig::new().with_learning_rate(0.0).validate().is_err());

        let mut config = TrainingConfig::new();
        config.len_crop = 100;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::new();
        config.use_speaker_loss = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_flattens_hyperparams() {
        let json = r#"{"dim_neck": 16, "freq": 16, "checkpoint_mode": "manual", "num_iters": 7}"#;
        let config: TrainingConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.hyperparams, Hyperparams::new(16, 256, 512, 16));
        assert_eq!(config.checkpoint_mode, CheckpointMode::Manual);
        assert_eq!(config.num_iters, 7);
        assert_eq!(config.batch_size, 2);
    }

    #[test]
    fn test_checkpoint_mode_from_str() {
        assert_eq!("autosave".parse::<CheckpointMode>().unwrap(), CheckpointMode::Autosave);
        assert_eq!("Manual".parse::<CheckpointMode>().unwrap(), CheckpointMode::Manual);
        assert!("sometimes".parse::<CheckpointMode>().is_err());
    }

    #[test]
    fn test_parse_device() {
        assert_eq!(parse_device("cpu").unwrap(), Device::Cpu);
        assert_eq!(parse_device("cuda").unwrap(), Device::Cuda(0));
        assert_eq!(parse_device("cuda:2").unwrap(), Device::Cuda(2));
        assert!(parse_device("tpu").is_err());
    }

    #[test]
    fn test_metadata_path_resolution() {
        let config = ConverterConfig::default();
        assert_eq!(
            config.metadata_path(),
            PathBuf::from("./training_set/spmel/train.json")
        );

        let config = ConverterConfig {
            metadata: PathBuf::from("/data/meta.json"),
            ..ConverterConfig::default()
        };
        assert_eq!(config.metadata_path(), PathBuf::from("/data/meta.json"));
    }
}
