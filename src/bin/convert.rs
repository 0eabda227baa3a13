// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Convert utterances to another speaker's voice.
//!
//! Example (one utterance):
//!   convert --source p225/p225_003.wav --target p226
//!
//! Example (every utterance of a speaker):
//!   convert --model trained_models/autovc_100000 --source p225 --target p226 --output-dir results

use autovc::{ConversionJob, Converter, ConverterConfig, TorchScriptVocoder};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "convert", version, about = "Convert speech with a trained AutoVC generator")]
struct Args {
    /// Generator checkpoint
    #[arg(long, default_value = "autovc.ckpt")]
    model: PathBuf,

    /// Utterance file or speaker directory, relative to --wavs-dir
    #[arg(long)]
    source: String,

    /// Target speaker id
    #[arg(long)]
    target: String,

    /// Spectrogram cache root
    #[arg(long, default_value = "./training_set/spmel")]
    spmel_dir: PathBuf,

    /// Waveform root
    #[arg(long, default_value = "./training_set/wavs")]
    wavs_dir: PathBuf,

    /// Speaker metadata file, relative to --spmel-dir
    #[arg(long, default_value = "train.json")]
    metadata: PathBuf,

    /// TorchScript vocoder
    #[arg(long, default_value = "checkpoint_step001000000_ema.pt")]
    vocoder: PathBuf,

    #[arg(long, default_value = "results")]
    output_dir: PathBuf,

    /// cpu, cuda, cuda:N or auto
    #[arg(long, default_value = "auto")]
    device: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ConverterConfig {
        model: args.model,
        spectrogram_dir: args.spmel_dir,
        wav_dir: args.wavs_dir,
        metadata: args.metadata,
        vocoder: args.vocoder,
        output_dir: args.output_dir,
        device: args.device,
    };

    // Sources are written with forward slashes on every platform.
    let job = ConversionJob::new(args.source.replace('\\', "/"), args.target.replace('\\', "/"));

    let converter: Converter = Converter::new(config)?;
    let written = converter.convert(&job, &TorchScriptVocoder::load)?;

    info!(files = written.len(), "Done");
    Ok(())
}
