// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! # autovc
//!
//! Training and inference orchestration for AutoVC-style voice conversion
//! on libtorch.
//!
//! The crate covers the control layer around a speaker-conditioned
//! spectrogram autoencoder:
//!
//! - **Training**: a resumable [`Solver`] with an identity-mapping and a
//!   circular (round-trip) objective, periodic checkpoints and autosave on
//!   interrupt.
//! - **Conversion**: a [`Converter`] that turns cached source spectrograms
//!   into a target speaker's voice and renders them with a vocoder.
//! - **Checkpoints**: safetensors bundles holding weights, architecture,
//!   optimizer state and loss history.
//!
//! ## Training
//!
//! ```ignore
//! use autovc::{IdentityLoader, IdentitySolver, IdentityMapping, SpeakerDataset, SpeakerTable};
//! use autovc::config::TrainingConfig;
//!
//! let config = TrainingConfig::from_json_file("train.json")?;
//! let table = SpeakerTable::load("spmel/train.json")?;
//! let dataset = SpeakerDataset::load(&table, "spmel")?;
//! let mut loader = IdentityLoader::new(dataset, config.batch_size, config.len_crop, config.seed, tch::Device::Cpu)?;
//!
//! let mut solver = IdentitySolver::new(config, IdentityMapping)?;
//! solver.train(&mut loader)?;
//! ```
//!
//! ## Conversion
//!
//! ```ignore
//! use autovc::{ConversionJob, Converter, TorchScriptVocoder};
//! use autovc::config::ConverterConfig;
//!
//! let converter: Converter = Converter::new(ConverterConfig::default())?;
//! let written = converter.convert(
//!     &ConversionJob::new("p225/p225_003.wav", "p226"),
//!     &TorchScriptVocoder::load,
//! )?;
//! ```

#![warn(missing_docs)]

pub mod audio;
pub mod checkpoint;
pub mod config;
pub mod converter;
pub mod data;
pub mod embedding;
pub mod error;
pub mod model;
pub mod optim;
pub mod padding;
pub mod solver;
pub mod speaker;
pub mod vocoder;

pub use checkpoint::{CheckpointBundle, OptimizerState, WeightState};
pub use config::{CheckpointMode, ConverterConfig, Hyperparams, TrainingConfig};
pub use converter::{ConversionJob, ConvertedUtterance, Converter};
pub use data::{
    BatchSource, CircularBatch, CircularLoader, IdentityBatch, IdentityLoader, SpeakerDataset,
    TrainingBatch,
};
pub use embedding::{resolve, resolve_tensor, SpeakerTable};
pub use error::{Result, VcError};
pub use model::{ConversionNetwork, Generator, GeneratorOutput, MEL_CHANNELS};
pub use padding::{pad_to_block, trim_padding};
pub use solver::{
    CircularMapping, CircularSolver, IdentityMapping, IdentitySolver, InterruptFlag, LossTerms,
    Solver, SolverState, TrainingObjective,
};
pub use speaker::{SpeakerEmbedder, TorchScriptSpeakerEmbedder};
pub use vocoder::{TorchScriptVocoder, Vocoder, VocoderLoader};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sample rate of every synthesized waveform.
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
