// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the integration tests.
//!
//! [`TinyNet`] stands in for the full generator so that checkpoints and
//! training steps stay cheap: one linear layer per stage, content codes
//! average-pooled over each `freq`-frame block.

#![allow(dead_code)]

use autovc::{
    CircularBatch, ConversionNetwork, GeneratorOutput, Hyperparams, IdentityBatch, SpeakerTable,
    TrainingConfig, MEL_CHANNELS,
};
use std::path::Path;
use tch::nn::{self, Module};
use tch::{Device, Kind, Tensor};

pub struct TinyNet {
    encoder: nn::Linear,
    decoder: nn::Linear,
    postnet: nn::Linear,
    dim_neck: i64,
    freq: i64,
}

fn over_time(embedding: &Tensor, frames: i64) -> Tensor {
    let size = embedding.size();
    embedding.unsqueeze(1).expand([size[0], frames, size[1]], false)
}

impl ConversionNetwork for TinyNet {
    fn build(vs: &nn::Path, hp: &Hyperparams) -> Self {
        Self {
            encoder: nn::linear(
                vs / "encoder",
                MEL_CHANNELS + hp.dim_emb,
                2 * hp.dim_neck,
                Default::default(),
            ),
            decoder: nn::linear(
                vs / "decoder",
                2 * hp.dim_neck + hp.dim_emb,
                MEL_CHANNELS,
                Default::default(),
            ),
            postnet: nn::linear(vs / "postnet", MEL_CHANNELS, MEL_CHANNELS, Default::default()),
            dim_neck: hp.dim_neck,
            freq: hp.freq,
        }
    }

    fn forward(&self, mel: &Tensor, emb_org: &Tensor, emb_trg: &Tensor) -> GeneratorOutput {
        let size = mel.size();
        let (batch, frames) = (size[0], size[1]);
        let codes = self.content_codes(mel, emb_org);
        let blocks = codes.size()[1];

        let upsampled = codes
            .unsqueeze(2)
            .expand([batch, blocks, self.freq, 2 * self.dim_neck], false)
            .reshape([batch, frames, 2 * self.dim_neck]);
        let decoded =
            Tensor::cat(&[upsampled, over_time(emb_trg, frames)], 2).apply(&self.decoder);
        let refined = &decoded + self.postnet.forward(&decoded);

        GeneratorOutput {
            mel: decoded,
            mel_postnet: refined,
            codes,
        }
    }

    fn content_codes(&self, mel: &Tensor, emb_org: &Tensor) -> Tensor {
        let size = mel.size();
        let (batch, frames) = (size[0], size[1]);
        let hidden = Tensor::cat(&[mel.shallow_clone(), over_time(emb_org, frames)], 2)
            .apply(&self.encoder);
        hidden
            .reshape([batch, frames / self.freq, self.freq, 2 * self.dim_neck])
            .mean_dim(&[2i64][..], false, Kind::Float)
    }
}

pub fn tiny_hyperparams() -> Hyperparams {
    Hyperparams::new(2, 4, 8, 4)
}

/// CPU config over `dir` with tiny dimensions and every iteration logged.
pub fn tiny_config(dir: &Path) -> TrainingConfig {
    let mut config = TrainingConfig::new()
        .with_hyperparams(tiny_hyperparams())
        .with_device("cpu")
        .with_batch_size(2)
        .with_num_iters(4)
        .with_log_step(1)
        .with_learning_rate(1e-3)
        .with_checkpoint_dir(dir.join("trained_models"))
        .with_autosave_path(dir.join("autovc_autosave.ckpt"));
    config.len_crop = 8;
    config
}

fn randn(shape: &[i64]) -> Tensor {
    Tensor::randn(shape, (Kind::Float, Device::Cpu))
}

pub fn identity_batches(count: usize) -> Vec<IdentityBatch> {
    (0..count)
        .map(|_| IdentityBatch {
            mel: randn(&[2, 8, MEL_CHANNELS]),
            emb_org: randn(&[2, 4]),
        })
        .collect()
}

pub fn circular_batches(count: usize) -> Vec<CircularBatch> {
    (0..count)
        .map(|_| CircularBatch {
            mel: randn(&[2, 8, MEL_CHANNELS]),
            emb_org: randn(&[2, 4]),
            emb_trg: randn(&[2, 4]),
        })
        .collect()
}

/// Write a `[frames, 80]` spectrogram cache file.
pub fn write_spectrogram(path: &Path, frames: i64) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    randn(&[frames, MEL_CHANNELS]).write_npy(path).unwrap();
}

/// Three speakers with 4-dimensional embeddings.
pub fn speaker_table() -> SpeakerTable {
    SpeakerTable::from_pairs([
        ("p225", vec![1.0, 0.0, 0.0, 0.0]),
        ("p226", vec![0.0, 1.0, 0.0, 0.0]),
        ("p227", vec![0.0, 0.0, 1.0, 0.0]),
    ])
    .unwrap()
}
