// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the autovc library.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the autovc library.
#[derive(Error, Debug)]
pub enum VcError {
    /// A file, checkpoint or directory that must exist is missing
    #[error("{kind} not found: {}", .path.display())]
    NotFound {
        /// What was being looked up ("checkpoint", "metadata", ...)
        kind: &'static str,
        /// The missing path
        path: PathBuf,
    },

    /// A file exists but could not be decoded
    #[error("Corrupt file {}: {reason}", .path.display())]
    Corrupt {
        /// The offending file
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// A checkpoint does not fit the architecture it is loaded into
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Speaker absent from the metadata table
    #[error("Embedding was not found for speaker {speaker}")]
    EmbeddingNotFound {
        /// Requested speaker id
        speaker: String,
    },

    /// No cached spectrogram for an utterance
    #[error(
        "The spectrogram for {} does not exist, auto-convert is not supported",
        .utterance.display()
    )]
    SpectrogramNotFound {
        /// Utterance path relative to the waveform directory
        utterance: PathBuf,
    },

    /// Conversion source is neither a file nor a directory
    #[error("Wrong path: {}", .0.display())]
    InvalidPath(PathBuf),

    /// Training loop stopped by an interrupt signal
    #[error("KeyboardInterrupt: {}", autosave_note(.autosaved))]
    InterruptedTraining {
        /// Whether the autosave checkpoint was written before stopping
        autosaved: bool,
    },

    /// Resuming from a checkpoint failed
    #[error("Could not load model at {}", .path.display())]
    ResumeFailed {
        /// Checkpoint that failed to load
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: Box<VcError>,
    },

    /// Data loader has nothing to yield
    #[error("Data source yielded no batches")]
    EmptyDataset,

    /// Error during configuration parsing or validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error during audio processing
    #[error("Audio processing error: {0}")]
    Audio(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Torch tensor error
    #[error("Torch error: {0}")]
    Torch(#[from] tch::TchError),
}

impl VcError {
    /// Create a not-found error for the given kind of resource.
    pub fn not_found(kind: &'static str, path: impl Into<PathBuf>) -> Self {
        Self::NotFound {
            kind,
            path: path.into(),
        }
    }

    /// Create a corrupt-file error.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

fn autosave_note(autosaved: impl std::borrow::Borrow<bool>) -> &'static str {
    if *autosaved.borrow() {
        "autosave done."
    } else {
        "no autosave."
    }
}

/// Result type alias for autovc operations.
pub type Result<T> = std::result::Result<T, VcError>;
