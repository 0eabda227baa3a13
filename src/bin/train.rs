// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Train an AutoVC generator on cached spectrograms.
//!
//! Example:
//!   train --spmel-dir ./training_set/spmel --num-iters 100000 --save-every-n-iter 10000
//!
//! Resume from an autosave and switch to the round-trip objective:
//!   train --init-model autovc_autosave.ckpt --circular
//!
//! Ctrl-C stops the run between iterations; in autosave mode the full
//! training state is written to the autosave path first.

use anyhow::Context;
use autovc::config::parse_device;
use autovc::{
    BatchSource, CircularLoader, CircularMapping, Generator, IdentityLoader, IdentityMapping,
    InterruptFlag, Solver, SpeakerDataset, SpeakerTable, TrainingConfig, TrainingObjective,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "train", version, about = "Train an AutoVC voice conversion generator")]
struct Args {
    /// JSON training config; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the circular (round-trip) objective
    #[arg(long)]
    circular: bool,

    /// Spectrogram cache root (one directory per speaker)
    #[arg(long, default_value = "./training_set/spmel")]
    spmel_dir: PathBuf,

    /// Speaker metadata file, relative to the spectrogram root
    #[arg(long, default_value = "train.json")]
    metadata: PathBuf,

    /// Write an inference checkpoint here when training completes
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long)]
    lambda_cd: Option<f64>,

    #[arg(long)]
    dim_neck: Option<i64>,

    #[arg(long)]
    dim_emb: Option<i64>,

    #[arg(long)]
    dim_pre: Option<i64>,

    #[arg(long)]
    freq: Option<i64>,

    /// Full checkpoint to resume from
    #[arg(long)]
    init_model: Option<PathBuf>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    len_crop: Option<i64>,

    #[arg(long)]
    num_iters: Option<usize>,

    /// "autosave" or "manual"
    #[arg(long)]
    checkpoint_mode: Option<String>,

    /// Periodic checkpoint interval, 0 disables
    #[arg(long)]
    save_every_n_iter: Option<usize>,

    /// Periodic checkpoint file prefix
    #[arg(long)]
    save_path: Option<String>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    log_step: Option<usize>,

    /// Circular objective: add the speaker-consistency term
    #[arg(long)]
    use_speaker_loss: bool,

    /// TorchScript speaker encoder for the speaker-consistency term
    #[arg(long)]
    speaker_encoder: Option<PathBuf>,

    /// cpu, cuda, cuda:N or auto
    #[arg(long)]
    device: Option<String>,

    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn training_config(&self) -> anyhow::Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_json_file(path)?,
            None => TrainingConfig::default(),
        };

        if let Some(v) = self.lambda_cd {
            config.lambda_cd = v;
        }
        if let Some(v) = self.dim_neck {
            config.hyperparams.dim_neck = v;
        }
        if let Some(v) = self.dim_emb {
            config.hyperparams.dim_emb = v;
        }
        if let Some(v) = self.dim_pre {
            config.hyperparams.dim_pre = v;
        }
        if let Some(v) = self.freq {
            config.hyperparams.freq = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.len_crop {
            config.len_crop = v;
        }
        if let Some(v) = self.num_iters {
            config.num_iters = v;
        }
        if let Some(v) = self.save_every_n_iter {
            config.save_every_n_iter = v;
        }
        if let Some(v) = &self.save_path {
            config.save_path = v.clone();
        }
        if let Some(v) = self.learning_rate {
            config.learning_rate = v;
        }
        if let Some(v) = self.log_step {
            config.log_step = v;
        }
        if let Some(v) = &self.device {
            config.device = v.clone();
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(path) = &self.init_model {
            config.init_model = Some(path.clone());
        }
        if let Some(mode) = &self.checkpoint_mode {
            config.checkpoint_mode = mode.parse()?;
        }
        if self.use_speaker_loss {
            config.use_speaker_loss = true;
        }
        if let Some(path) = &self.speaker_encoder {
            config.speaker_encoder = Some(path.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

/// The speaker-consistency term only exists in the circular objective.
fn check_objective(circular: bool, config: &TrainingConfig) -> anyhow::Result<()> {
    if !circular && (config.use_speaker_loss || config.speaker_encoder.is_some()) {
        anyhow::bail!("--use-speaker-loss and --speaker-encoder require --circular");
    }
    Ok(())
}

/// Forward Ctrl-C to `flag` from a helper thread.
fn install_interrupt_handler(flag: InterruptFlag) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("could not install Ctrl-C handler: {e}");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current iteration");
                flag.trigger();
            }
        });
    });
}

fn run<O, S>(
    config: TrainingConfig,
    objective: O,
    loader: &mut S,
    flag: InterruptFlag,
    output: Option<&Path>,
) -> anyhow::Result<()>
where
    O: TrainingObjective,
    S: BatchSource<Batch = O::Batch>,
{
    let mut solver = Solver::<Generator, O>::new(config, objective)?.with_interrupt_flag(flag);
    solver.train(loader)?;
    if let Some(path) = output {
        solver.save_inference_model(path)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.training_config()?;
    check_objective(args.circular, &config)?;
    let device = parse_device(&config.device)?;

    let metadata = args.spmel_dir.join(&args.metadata);
    let table = SpeakerTable::load(&metadata)
        .with_context(|| format!("loading speaker metadata {}", metadata.display()))?;
    let dataset = SpeakerDataset::load(&table, &args.spmel_dir)?;
    info!(
        speakers = dataset.len(),
        circular = args.circular,
        "Start training..."
    );

    let flag = InterruptFlag::new();
    install_interrupt_handler(flag.clone());
    let output = args.output.as_deref();

    if args.circular {
        let objective = CircularMapping::from_config(&config)?;
        let mut loader =
            CircularLoader::new(dataset, config.batch_size, config.len_crop, config.seed, device)?;
        run(config, objective, &mut loader, flag, output)
    } else {
        let mut loader =
            IdentityLoader::new(dataset, config.batch_size, config.len_crop, config.seed, device)?;
        run(config, IdentityMapping, &mut loader, flag, output)
    }
}
