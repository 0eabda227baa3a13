// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Speaker embedding extraction for the speaker-consistency loss.
//!
//! The circular solver can penalize converted spectrograms whose speaker
//! embedding drifts from the requested target. Extraction is a pretrained
//! network exported to TorchScript; gradients flow through it back into the
//! generator, while its own parameters stay frozen.

use crate::error::{Result, VcError};
use std::path::Path;
use tch::{CModule, Device, Kind, Tensor};
use tracing::info;

/// Maps spectrograms to speaker embeddings.
pub trait SpeakerEmbedder {
    /// `[batch, time, 80]` spectrograms in, `[batch, dim_emb]` embeddings out.
    fn embed(&self, mel: &Tensor) -> Result<Tensor>;
}

impl<F> SpeakerEmbedder for F
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    fn embed(&self, mel: &Tensor) -> Result<Tensor> {
        self(mel)
    }
}

/// Speaker encoder exported with `torch.jit`.
pub struct TorchScriptSpeakerEmbedder {
    model: CModule,
    device: Device,
}

impl TorchScriptSpeakerEmbedder {
    /// Load the scripted encoder onto `device` in eval mode.
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(VcError::not_found("speaker encoder", path));
        }
        let mut model = CModule::load_on_device(path, device)
            .map_err(|e| VcError::corrupt(path, e.to_string()))?;
        model.set_eval();
        info!(path = %path.display(), "speaker encoder loaded");
        Ok(Self { model, device })
    }
}

impl SpeakerEmbedder for TorchScriptSpeakerEmbedder {
    fn embed(&self, mel: &Tensor) -> Result<Tensor> {
        let input = mel.to_device(self.device).to_kind(Kind::Float);
        let embedding = self.model.forward_ts(&[input])?;
        if embedding.dim() != 2 {
            return Err(VcError::SchemaMismatch(format!(
                "speaker encoder returned shape {:?}, expected [batch, dim]",
                embedding.size()
            )));
        }
        Ok(embedding)
    }
}
