// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Conversion network seam and the reference AutoVC-style generator.
//!
//! The solver and converter only talk to [`ConversionNetwork`]: build the
//! network into a VarStore path from a [`Hyperparams`] record, run it with a
//! source and target speaker embedding, or run the encoder alone to get the
//! content code. [`Generator`] is the stock implementation:
//!
//! - **Encoder**: mel + broadcast source embedding → 3 × conv1d(5) →
//!   2-layer BLSTM with `dim_neck` units per direction; the forward half is
//!   sampled at the end and the backward half at the start of every
//!   `freq`-frame block, giving one content code per block.
//! - **Decoder**: codes up-sampled back to frame rate + broadcast target
//!   embedding → LSTM(`dim_pre`) → 3 × conv1d(5) → 2-layer LSTM(1024) →
//!   linear to 80 mel channels.
//! - **Postnet**: 5 × conv1d(5) residual refinement.

use crate::config::Hyperparams;
use tch::nn::{self, Module, RNN};
use tch::Tensor;

/// Mel channels of every spectrogram the generator consumes and produces.
pub const MEL_CHANNELS: i64 = 80;

const ENCODER_CHANNELS: i64 = 512;
const DECODER_LSTM_HIDDEN: i64 = 1024;
const POSTNET_CHANNELS: i64 = 512;
const KERNEL_SIZE: i64 = 5;

/// Result of a full generator pass.
#[derive(Debug)]
pub struct GeneratorOutput {
    /// Decoder output before the postnet, `[batch, time, 80]`
    pub mel: Tensor,
    /// Decoder output after the postnet, `[batch, time, 80]`
    pub mel_postnet: Tensor,
    /// Content codes of the input, `[batch, time / freq, 2 * dim_neck]`
    pub codes: Tensor,
}

/// A speaker-conditioned spectrogram-to-spectrogram network.
pub trait ConversionNetwork {
    /// Create the network with its parameters registered under `vs`.
    fn build(vs: &nn::Path, hparams: &Hyperparams) -> Self
    where
        Self: Sized;

    /// Convert `mel` (`[batch, time, 80]`, time a multiple of `freq`)
    /// from the `emb_org` speaker to the `emb_trg` speaker.
    fn forward(&self, mel: &Tensor, emb_org: &Tensor, emb_trg: &Tensor) -> GeneratorOutput;

    /// Encoder-only pass returning the content codes.
    fn content_codes(&self, mel: &Tensor, emb_org: &Tensor) -> Tensor;
}

fn conv(vs: nn::Path, in_dim: i64, out_dim: i64) -> nn::Conv1D {
    let config = nn::ConvConfig {
        padding: (KERNEL_SIZE - 1) / 2,
        ..Default::default()
    };
    nn::conv1d(vs, in_dim, out_dim, KERNEL_SIZE, config)
}

/// Broadcast `[batch, dim]` embeddings along a time axis of length `frames`.
fn broadcast_over_time(embedding: &Tensor, frames: i64) -> Tensor {
    let size = embedding.size();
    embedding
        .unsqueeze(1)
        .expand([size[0], frames, size[1]], false)
}

struct Encoder {
    convs: Vec<nn::Conv1D>,
    lstm: nn::LSTM,
    dim_neck: i64,
    freq: i64,
}

impl Encoder {
    fn new(vs: nn::Path, hp: &Hyperparams) -> Self {
        let convs = (0..3)
            .map(|i| {
                let in_dim = if i == 0 {
                    MEL_CHANNELS + hp.dim_emb
                } else {
                    ENCODER_CHANNELS
                };
                conv(vs.sub("convolutions").sub(i), in_dim, ENCODER_CHANNELS)
            })
            .collect();
        let lstm = nn::lstm(
            vs.sub("lstm"),
            ENCODER_CHANNELS,
            hp.dim_neck,
            nn::RNNConfig {
                num_layers: 2,
                bidirectional: true,
                batch_first: true,
                ..Default::default()
            },
        );
        Self {
            convs,
            lstm,
            dim_neck: hp.dim_neck,
            freq: hp.freq,
        }
    }

    fn forward(&self, mel: &Tensor, emb: &Tensor) -> Tensor {
        let frames = mel.size()[1];
        let emb = broadcast_over_time(emb, frames);
        let x = Tensor::cat(&[mel, &emb], 2).transpose(1, 2);
        let x = self.convs.iter().fold(x, |x, c| x.apply(c).relu());

        let (out, _) = self.lstm.seq(&x.transpose(1, 2));
        let forward = out.narrow(2, 0, self.dim_neck);
        let backward = out.narrow(2, self.dim_neck, self.dim_neck);

        let codes: Vec<Tensor> = (0..frames)
            .step_by(self.freq as usize)
            .map(|i| {
                Tensor::cat(
                    &[forward.select(1, i + self.freq - 1), backward.select(1, i)],
                    -1,
                )
            })
            .collect();
        Tensor::stack(&codes, 1)
    }
}

struct Decoder {
    lstm1: nn::LSTM,
    convs: Vec<nn::Conv1D>,
    lstm2: nn::LSTM,
    projection: nn::Linear,
}

impl Decoder {
    fn new(vs: nn::Path, hp: &Hyperparams) -> Self {
        let lstm1 = nn::lstm(
            vs.sub("lstm1"),
            2 * hp.dim_neck + hp.dim_emb,
            hp.dim_pre,
            nn::RNNConfig {
                batch_first: true,
                ..Default::default()
            },
        );
        let convs = (0..3)
            .map(|i| conv(vs.sub("convolutions").sub(i), hp.dim_pre, hp.dim_pre))
            .collect();
        let lstm2 = nn::lstm(
            vs.sub("lstm2"),
            hp.dim_pre,
            DECODER_LSTM_HIDDEN,
            nn::RNNConfig {
                num_layers: 2,
                batch_first: true,
                ..Default::default()
            },
        );
        let projection = nn::linear(
            vs.sub("linear_projection"),
            DECODER_LSTM_HIDDEN,
            MEL_CHANNELS,
            Default::default(),
        );
        Self {
            lstm1,
            convs,
            lstm2,
            projection,
        }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        let (x, _) = self.lstm1.seq(x);
        let x = self
            .convs
            .iter()
            .fold(x.transpose(1, 2), |x, c| x.apply(c).relu())
            .transpose(1, 2);
        let (x, _) = self.lstm2.seq(&x);
        x.apply(&self.projection)
    }
}

struct Postnet {
    convs: Vec<nn::Conv1D>,
}

impl Postnet {
    fn new(vs: nn::Path) -> Self {
        let dims = [
            (MEL_CHANNELS, POSTNET_CHANNELS),
            (POSTNET_CHANNELS, POSTNET_CHANNELS),
            (POSTNET_CHANNELS, POSTNET_CHANNELS),
            (POSTNET_CHANNELS, POSTNET_CHANNELS),
            (POSTNET_CHANNELS, MEL_CHANNELS),
        ];
        let convs = dims
            .iter()
            .enumerate()
            .map(|(i, &(in_dim, out_dim))| conv(vs.sub("convolutions").sub(i), in_dim, out_dim))
            .collect();
        Self { convs }
    }

    /// `[batch, time, 80]` in, residual of the same shape out.
    fn forward(&self, mel: &Tensor) -> Tensor {
        let last = self.convs.len() - 1;
        let mut x = mel.transpose(1, 2);
        for (i, c) in self.convs.iter().enumerate() {
            x = c.forward(&x);
            if i < last {
                x = x.tanh();
            }
        }
        x.transpose(1, 2)
    }
}

/// Reference AutoVC-style generator.
pub struct Generator {
    encoder: Encoder,
    decoder: Decoder,
    postnet: Postnet,
    freq: i64,
}

impl ConversionNetwork for Generator {
    fn build(vs: &nn::Path, hparams: &Hyperparams) -> Self {
        Self {
            encoder: Encoder::new(vs.sub("encoder"), hparams),
            decoder: Decoder::new(vs.sub("decoder"), hparams),
            postnet: Postnet::new(vs.sub("postnet")),
            freq: hparams.freq,
        }
    }

    fn forward(&self, mel: &Tensor, emb_org: &Tensor, emb_trg: &Tensor) -> GeneratorOutput {
        let codes = self.encoder.forward(mel, emb_org);
        let size = codes.size();
        let (batch, blocks, width) = (size[0], size[1], size[2]);
        let frames = blocks * self.freq;

        let upsampled = codes
            .unsqueeze(2)
            .expand([batch, blocks, self.freq, width], false)
            .reshape([batch, frames, width]);
        let decoder_input = Tensor::cat(&[upsampled, broadcast_over_time(emb_trg, frames)], -1);

        let mel_out = self.decoder.forward(&decoder_input);
        let mel_postnet = &mel_out + self.postnet.forward(&mel_out);

        GeneratorOutput {
            mel: mel_out,
            mel_postnet,
            codes,
        }
    }

    fn content_codes(&self, mel: &Tensor, emb_org: &Tensor) -> Tensor {
        self.encoder.forward(mel, emb_org)
    }
}
