// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Speaker metadata table and embedding lookup.
//!
//! The metadata file is a JSON array of `[speaker_id, embedding]` pairs
//! produced by the embedding-extraction step. Lookups scan the table in
//! order and the first matching speaker wins.

use crate::error::{Result, VcError};
use std::path::Path;
use tch::{Device, Tensor};

/// One row of the metadata table.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerEntry {
    /// Speaker identifier (the speaker's directory name)
    pub speaker: String,
    /// Fixed-length speaker embedding
    pub embedding: Vec<f32>,
}

/// Ordered speaker metadata table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeakerTable {
    entries: Vec<SpeakerEntry>,
}

impl SpeakerTable {
    /// Build a table from `(speaker, embedding)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<f32>)>,
        S: Into<String>,
    {
        let entries: Vec<SpeakerEntry> = pairs
            .into_iter()
            .map(|(speaker, embedding)| SpeakerEntry {
                speaker: speaker.into(),
                embedding,
            })
            .collect();

        if let Some(first) = entries.first() {
            let dim = first.embedding.len();
            if let Some(bad) = entries.iter().find(|e| e.embedding.len() != dim) {
                return Err(VcError::Config(format!(
                    "embedding for speaker {} has {} values, expected {}",
                    bad.speaker,
                    bad.embedding.len(),
                    dim
                )));
            }
        }

        Ok(Self { entries })
    }

    /// Load the table from a JSON metadata file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VcError::not_found("speaker metadata", path));
        }
        let content = std::fs::read_to_string(path)?;
        let pairs: Vec<(String, Vec<f32>)> = serde_json::from_str(&content)
            .map_err(|e| VcError::corrupt(path, e.to_string()))?;
        Self::from_pairs(pairs).map_err(|e| VcError::corrupt(path, e.to_string()))
    }

    /// Write the table as a JSON metadata file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let pairs: Vec<(&str, &[f32])> = self
            .entries
            .iter()
            .map(|e| (e.speaker.as_str(), e.embedding.as_slice()))
            .collect();
        std::fs::write(path, serde_json::to_string(&pairs)?)?;
        Ok(())
    }

    /// Rows in file order.
    pub fn entries(&self) -> &[SpeakerEntry] {
        &self.entries
    }

    /// Number of speakers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no speakers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding length shared by every row, if any.
    pub fn embedding_dim(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.len())
    }
}

/// Return the embedding of the first row whose id equals `speaker`.
pub fn resolve<'a>(table: &'a SpeakerTable, speaker: &str) -> Result<&'a [f32]> {
    table
        .entries
        .iter()
        .find(|e| e.speaker == speaker)
        .map(|e| e.embedding.as_slice())
        .ok_or_else(|| VcError::EmbeddingNotFound {
            speaker: speaker.to_string(),
        })
}

/// Resolve a speaker and return the embedding as a `[1, dim]` tensor.
pub fn resolve_tensor(table: &SpeakerTable, speaker: &str, device: Device) -> Result<Tensor> {
    let embedding = resolve(table, speaker)?;
    Ok(Tensor::from_slice(embedding)
        .unsqueeze(0)
        .to_device(device))
}
