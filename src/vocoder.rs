// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Vocoder seam: renders converted mel spectrograms into waveforms.
//!
//! The converter only loads a vocoder after the generator has been
//! released, so loading goes through a [`VocoderLoader`] rather than an
//! already-built instance. Any `Fn(&Path, Device) -> Result<V>` is a loader;
//! [`TorchScriptVocoder::load`] is the stock one.

use crate::error::{Result, VcError};
use std::path::Path;
use tch::{CModule, Device, Kind, Tensor};
use tracing::{debug, info};

/// Turns one `[time, 80]` mel spectrogram into mono samples.
pub trait Vocoder {
    /// Waveform samples for `mel`.
    fn synthesize(&self, mel: &Tensor) -> Result<Vec<f32>>;
}

impl<F> Vocoder for F
where
    F: Fn(&Tensor) -> Result<Vec<f32>>,
{
    fn synthesize(&self, mel: &Tensor) -> Result<Vec<f32>> {
        self(mel)
    }
}

/// Builds a vocoder from a checkpoint path.
pub trait VocoderLoader {
    /// Vocoder produced by this loader
    type Output: Vocoder;

    /// Load the vocoder stored at `path` onto `device`.
    fn load(&self, path: &Path, device: Device) -> Result<Self::Output>;
}

impl<F, V> VocoderLoader for F
where
    F: Fn(&Path, Device) -> Result<V>,
    V: Vocoder,
{
    type Output = V;

    fn load(&self, path: &Path, device: Device) -> Result<V> {
        self(path, device)
    }
}

/// Neural vocoder exported with `torch.jit`.
///
/// The scripted module takes a `[1, time, 80]` spectrogram and returns the
/// waveform in any shape; the output is flattened.
pub struct TorchScriptVocoder {
    model: CModule,
    device: Device,
}

impl TorchScriptVocoder {
    /// Load the scripted vocoder onto `device` in eval mode.
    pub fn load(path: &Path, device: Device) -> Result<Self> {
        if !path.is_file() {
            return Err(VcError::not_found("vocoder", path));
        }
        let mut model = CModule::load_on_device(path, device)
            .map_err(|e| VcError::corrupt(path, e.to_string()))?;
        model.set_eval();
        info!(path = %path.display(), "vocoder loaded");
        Ok(Self { model, device })
    }
}

impl Vocoder for TorchScriptVocoder {
    fn synthesize(&self, mel: &Tensor) -> Result<Vec<f32>> {
        if mel.dim() != 2 {
            return Err(VcError::Config(format!(
                "vocoder expects a [time, mel] spectrogram, got shape {:?}",
                mel.size()
            )));
        }
        let input = mel
            .to_device(self.device)
            .to_kind(Kind::Float)
            .unsqueeze(0);

        let waveform = tch::no_grad(|| self.model.forward_ts(&[input]))?;
        let flat = waveform
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .reshape([-1]);
        let samples = Vec::<f32>::try_from(&flat)?;

        debug!(frames = mel.size()[0], samples = samples.len(), "synthesized");
        Ok(samples)
    }
}
