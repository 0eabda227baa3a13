// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Training solver for the conversion generator.
//!
//! A [`Solver`] owns the generator's VarStore, the Adam optimizer and the
//! loss history of the session. Each iteration pulls one batch from a
//! [`BatchSource`] (starting a new pass whenever the current one runs dry),
//! asks its [`TrainingObjective`] for the loss terms, appends the total to
//! the history and takes one optimizer step.
//!
//! Two objectives are provided:
//!
//! - [`IdentityMapping`]: self-reconstruction with the source embedding on
//!   both sides, MSE reconstruction terms plus an L1 content-code term.
//! - [`CircularMapping`]: source → target → source round trip, L1 terms
//!   throughout, with an optional speaker-consistency term on the
//!   intermediate target spectrogram.
//!
//! The iteration index is always the length of the loss history, so a
//! session resumed from a bundle with 150 recorded losses continues at 150.

use crate::checkpoint::{self, CheckpointBundle};
use crate::config::{parse_device, TrainingConfig};
use crate::data::{BatchSource, CircularBatch, IdentityBatch, TrainingBatch};
use crate::error::{Result, VcError};
use crate::model::{ConversionNetwork, Generator};
use crate::optim::{Adam, AdamConfig};
use crate::speaker::{SpeakerEmbedder, TorchScriptSpeakerEmbedder};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tch::{nn, Kind, Reduction, Tensor};
use tracing::{debug, info, warn};

const KEY_LOSS: &str = "G/loss";
const KEY_ID: &str = "G/loss_id";
const KEY_ID_PSNT: &str = "G/loss_id_psnt";
const KEY_CD: &str = "G/loss_cd";
const KEY_TGT_STYLE: &str = "G/loss_tgt_style";

/// Loss terms of one iteration.
///
/// `total` is the differentiable float64 scalar that gets back-propagated;
/// the other fields are its components as plain values.
#[derive(Debug)]
pub struct LossTerms {
    /// Weighted sum of every active term
    pub total: Tensor,
    /// Reconstruction error before the postnet
    pub id: f64,
    /// Reconstruction error after the postnet
    pub id_psnt: f64,
    /// Content-code consistency error
    pub cd: f64,
    /// Speaker-consistency error of the converted output, 0 when unused
    pub tgt_style: f64,
}

impl LossTerms {
    /// `id + id_psnt [+ tgt_style] + lambda_cd * cd`, summed in float64.
    pub fn compose(
        id: &Tensor,
        id_psnt: &Tensor,
        cd: &Tensor,
        tgt_style: Option<&Tensor>,
        lambda_cd: f64,
    ) -> Self {
        let double = |t: &Tensor| t.to_kind(Kind::Double);
        let mut total = double(id) + double(id_psnt);
        if let Some(style) = tgt_style {
            total = total + double(style);
        }
        let total = total + double(cd) * lambda_cd;

        Self {
            total,
            id: id.double_value(&[]),
            id_psnt: id_psnt.double_value(&[]),
            cd: cd.double_value(&[]),
            tgt_style: tgt_style.map_or(0.0, |t| t.double_value(&[])),
        }
    }

    /// Scalar value of the total loss.
    pub fn total_value(&self) -> f64 {
        self.total.double_value(&[])
    }

    fn value(&self, key: &str) -> f64 {
        match key {
            KEY_LOSS => self.total_value(),
            KEY_ID => self.id,
            KEY_ID_PSNT => self.id_psnt,
            KEY_CD => self.cd,
            KEY_TGT_STYLE => self.tgt_style,
            _ => 0.0,
        }
    }
}

/// How loss values are aggregated between two progress lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Report the values of the logging iteration only
    Instantaneous,
    /// Report the mean over the interval, then reset
    IntervalMean,
}

/// Loss definition for one training variant.
pub trait TrainingObjective {
    /// Batch type this objective scores
    type Batch: TrainingBatch;

    /// Log keys in print order.
    fn log_keys(&self) -> Vec<&'static str>;

    /// Aggregation used for progress lines.
    fn log_mode(&self) -> LogMode;

    /// Loss terms of `net` on one batch.
    fn losses<N: ConversionNetwork>(
        &self,
        net: &N,
        batch: &Self::Batch,
        lambda_cd: f64,
    ) -> Result<LossTerms>;
}

/// One-way self-reconstruction objective.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapping;

impl TrainingObjective for IdentityMapping {
    type Batch = IdentityBatch;

    fn log_keys(&self) -> Vec<&'static str> {
        vec![KEY_LOSS, KEY_ID, KEY_ID_PSNT, KEY_CD]
    }

    fn log_mode(&self) -> LogMode {
        LogMode::Instantaneous
    }

    fn losses<N: ConversionNetwork>(
        &self,
        net: &N,
        batch: &IdentityBatch,
        lambda_cd: f64,
    ) -> Result<LossTerms> {
        let out = net.forward(&batch.mel, &batch.emb_org, &batch.emb_org);
        let id = batch.mel.mse_loss(&out.mel, Reduction::Mean);
        let id_psnt = batch.mel.mse_loss(&out.mel_postnet, Reduction::Mean);

        let codes_reconst = net.content_codes(&out.mel_postnet, &batch.emb_org);
        let cd = out.codes.l1_loss(&codes_reconst, Reduction::Mean);

        Ok(LossTerms::compose(&id, &id_psnt, &cd, None, lambda_cd))
    }
}

/// Round-trip objective with an optional speaker-consistency term.
#[derive(Default)]
pub struct CircularMapping {
    embedder: Option<Box<dyn SpeakerEmbedder>>,
}

impl CircularMapping {
    /// Round trip without the speaker-consistency term.
    pub fn new() -> Self {
        Self::default()
    }

    /// Round trip scored additionally by `embedder`.
    pub fn with_embedder(embedder: Box<dyn SpeakerEmbedder>) -> Self {
        Self {
            embedder: Some(embedder),
        }
    }

    /// Load the speaker encoder named by the config when the speaker loss is on.
    pub fn from_config(config: &TrainingConfig) -> Result<Self> {
        if !config.use_speaker_loss {
            return Ok(Self::new());
        }
        let path = config.speaker_encoder.as_ref().ok_or_else(|| {
            VcError::Config("use_speaker_loss requires a speaker_encoder path".to_string())
        })?;
        let device = parse_device(&config.device)?;
        let embedder = TorchScriptSpeakerEmbedder::load(path, device)?;
        Ok(Self::with_embedder(Box::new(embedder)))
    }

    /// Whether the speaker-consistency term is active.
    pub fn uses_speaker_loss(&self) -> bool {
        self.embedder.is_some()
    }
}

impl TrainingObjective for CircularMapping {
    type Batch = CircularBatch;

    fn log_keys(&self) -> Vec<&'static str> {
        let mut keys = vec![KEY_LOSS, KEY_ID, KEY_ID_PSNT, KEY_CD];
        if self.uses_speaker_loss() {
            keys.push(KEY_TGT_STYLE);
        }
        keys
    }

    fn log_mode(&self) -> LogMode {
        LogMode::IntervalMean
    }

    fn losses<N: ConversionNetwork>(
        &self,
        net: &N,
        batch: &CircularBatch,
        lambda_cd: f64,
    ) -> Result<LossTerms> {
        let there = net.forward(&batch.mel, &batch.emb_org, &batch.emb_trg);
        let back = net.forward(&there.mel, &batch.emb_trg, &batch.emb_org);

        let id = batch.mel.l1_loss(&back.mel, Reduction::Mean);
        let id_psnt = batch.mel.l1_loss(&back.mel_postnet, Reduction::Mean);
        let cd = there.codes.l1_loss(&back.codes, Reduction::Mean);

        let tgt_style = match &self.embedder {
            Some(embedder) => {
                let predicted = embedder.embed(&there.mel_postnet)?;
                Some(predicted.l1_loss(&batch.emb_trg, Reduction::Mean))
            }
            None => None,
        };

        Ok(LossTerms::compose(
            &id,
            &id_psnt,
            &cd,
            tgt_style.as_ref(),
            lambda_cd,
        ))
    }
}

/// Lifecycle of a solver session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    /// Model and optimizer constructed
    Built,
    /// No resume path; starting at iteration 0
    Fresh,
    /// Restored from a full bundle
    Resumed {
        /// Iterations already recorded in the bundle
        iteration: usize,
    },
    /// Inside the training loop
    Running,
    /// Periodic checkpoint just written
    Checkpointed {
        /// Iteration the checkpoint was taken at
        iteration: usize,
    },
    /// Stopped by the interrupt flag
    Interrupted {
        /// Whether the autosave checkpoint was written
        autosaved: bool,
    },
    /// All requested iterations done
    Completed,
}

/// Shared flag that asks a running solver to stop.
///
/// The solver polls it between iterations; setting it from a signal
/// handler or another thread is safe.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// Unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the solver to stop before its next iteration.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Running aggregate of loss values for progress lines.
struct LossMeter {
    mode: LogMode,
    keys: Vec<&'static str>,
    sums: Vec<f64>,
    count: usize,
}

impl LossMeter {
    fn new(mode: LogMode, keys: Vec<&'static str>) -> Self {
        let sums = vec![0.0; keys.len()];
        Self {
            mode,
            keys,
            sums,
            count: 0,
        }
    }

    fn record(&mut self, terms: &LossTerms) {
        for (sum, key) in self.sums.iter_mut().zip(&self.keys) {
            match self.mode {
                LogMode::Instantaneous => *sum = terms.value(key),
                LogMode::IntervalMean => *sum += terms.value(key),
            }
        }
        self.count += 1;
    }

    fn report(&self) -> String {
        let divisor = match self.mode {
            LogMode::Instantaneous => 1.0,
            LogMode::IntervalMean => self.count.max(1) as f64,
        };
        self.keys
            .iter()
            .zip(&self.sums)
            .map(|(key, sum)| format!(", {}: {:.4}", key, sum / divisor))
            .collect()
    }

    fn reset(&mut self) {
        self.sums.iter_mut().for_each(|s| *s = 0.0);
        self.count = 0;
    }
}

/// `H:MM:SS`, whole seconds.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

/// Training session over a conversion network `N` with objective `O`.
pub struct Solver<N: ConversionNetwork, O: TrainingObjective> {
    config: TrainingConfig,
    vs: nn::VarStore,
    generator: N,
    optimizer: Adam,
    objective: O,
    loss_history: Vec<f64>,
    state: SolverState,
    interrupt: InterruptFlag,
}

/// One-way solver over the stock generator.
pub type IdentitySolver = Solver<Generator, IdentityMapping>;

/// Circular solver over the stock generator.
pub type CircularSolver = Solver<Generator, CircularMapping>;

impl<N: ConversionNetwork, O: TrainingObjective> Solver<N, O> {
    /// Build model and optimizer, then resume from `config.init_model` if set.
    pub fn new(config: TrainingConfig, objective: O) -> Result<Self> {
        config.validate()?;
        let device = parse_device(&config.device)?;
        tch::manual_seed(config.seed as i64);

        let vs = nn::VarStore::new(device);
        let generator = N::build(&vs.root(), &config.hyperparams);
        let optimizer = Adam::new(&vs, AdamConfig::from(&config));
        info!(
            device = ?device,
            hyperparams = ?config.hyperparams,
            params = vs.trainable_variables().len(),
            "solver built"
        );

        let mut solver = Self {
            config,
            vs,
            generator,
            optimizer,
            objective,
            loss_history: Vec::new(),
            state: SolverState::Built,
            interrupt: InterruptFlag::new(),
        };

        match solver.config.init_model.clone() {
            Some(path) => solver.load_trainable_model(&path)?,
            None => solver.state = SolverState::Fresh,
        }
        Ok(solver)
    }

    /// Use an externally owned interrupt flag.
    pub fn with_interrupt_flag(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = flag;
        self
    }

    /// Handle to the flag this solver polls.
    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    /// Index of the next iteration.
    pub fn iteration(&self) -> usize {
        self.loss_history.len()
    }

    /// Total loss of every completed iteration.
    pub fn loss_history(&self) -> &[f64] {
        &self.loss_history
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SolverState {
        self.state
    }

    /// Configuration the session was built with.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Parameters of the network being trained.
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Training objective of the session.
    pub fn objective(&self) -> &O {
        &self.objective
    }

    /// Restore weights, optimizer state and loss history from a full bundle.
    pub fn load_trainable_model(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(VcError::not_found("checkpoint", path));
        }
        info!(path = %path.display(), "loading model");

        let rewrap = |source: VcError| VcError::ResumeFailed {
            path: path.to_path_buf(),
            source: Box::new(source),
        };

        let bundle = checkpoint::load(path, Some(self.config.hyperparams)).map_err(rewrap)?;
        if bundle.hyperparams != Some(self.config.hyperparams) {
            return Err(VcError::SchemaMismatch(format!(
                "{} was trained with {:?}, configured architecture is {:?}",
                path.display(),
                bundle.hyperparams,
                self.config.hyperparams
            )));
        }
        let optimizer = bundle.optimizer.as_ref().ok_or_else(|| {
            rewrap(VcError::SchemaMismatch(
                "bundle has no optimizer state".to_string(),
            ))
        })?;

        checkpoint::copy_into_varstore(&self.vs, &bundle.weights).map_err(rewrap)?;
        self.optimizer.load_state(optimizer).map_err(rewrap)?;
        self.loss_history = bundle.loss_history.unwrap_or_default();

        let iteration = self.iteration();
        self.state = SolverState::Resumed { iteration };
        info!(iteration, "resumed training state");
        Ok(())
    }

    /// Write weights, hyperparams, optimizer state and loss history.
    pub fn save_trainable_model(&self, path: &Path) -> Result<()> {
        let bundle = CheckpointBundle {
            weights: checkpoint::varstore_weights(&self.vs),
            hyperparams: Some(self.config.hyperparams),
            optimizer: Some(self.optimizer.state()),
            loss_history: Some(self.loss_history.clone()),
        };
        checkpoint::save(&bundle, path)?;
        info!(path = %path.display(), iteration = self.iteration(), "trainable model saved");
        Ok(())
    }

    /// Write weights and hyperparams only, for inference.
    pub fn save_inference_model(&self, path: &Path) -> Result<()> {
        let bundle =
            CheckpointBundle::partial(checkpoint::varstore_weights(&self.vs), self.config.hyperparams);
        checkpoint::save(&bundle, path)?;
        info!(path = %path.display(), "model state saved");
        Ok(())
    }

    /// Run `config.num_iters` iterations starting at [`Solver::iteration`].
    ///
    /// Returns [`VcError::InterruptedTraining`] if the interrupt flag is
    /// raised, after writing the autosave bundle when autosave is enabled.
    pub fn train<S>(&mut self, source: &mut S) -> Result<()>
    where
        S: BatchSource<Batch = O::Batch> + ?Sized,
    {
        let first = self.iteration();
        let end = first + self.config.num_iters;
        let mut meter = LossMeter::new(self.objective.log_mode(), self.objective.log_keys());
        let mut batches = source.batches()?;
        let start = Instant::now();
        info!(from = first, to = end, "start training");

        while self.iteration() < end {
            if self.interrupt.is_set() {
                return Err(self.stop_on_interrupt());
            }
            self.state = SolverState::Running;

            let batch = match batches.next() {
                Some(batch) => batch?,
                None => {
                    debug!(iteration = self.iteration(), "data pass exhausted, restarting");
                    batches = source.batches()?;
                    batches.next().ok_or(VcError::EmptyDataset)??
                }
            };

            batch.validate(&self.config.hyperparams)?;
            let terms = self
                .objective
                .losses(&self.generator, &batch, self.config.lambda_cd)?;
            self.loss_history.push(terms.total_value());
            self.optimizer.zero_grad();
            terms.total.backward();
            self.optimizer.step();
            meter.record(&terms);

            let done = self.iteration();
            if done % self.config.log_step == 0 {
                info!(
                    "Elapsed [{}], Iteration [{}/{}]{}",
                    format_elapsed(start.elapsed()),
                    done,
                    self.config.num_iters,
                    meter.report()
                );
                meter.reset();
            }

            if self.config.save_every_n_iter != 0 && done % self.config.save_every_n_iter == 0 {
                let path = self.periodic_checkpoint_path(done);
                self.save_trainable_model(&path)?;
                self.state = SolverState::Checkpointed { iteration: done };
            }
        }

        self.state = SolverState::Completed;
        info!(iterations = end - first, "training complete");
        Ok(())
    }

    /// Where the periodic checkpoint for `iteration` goes.
    pub fn periodic_checkpoint_path(&self, iteration: usize) -> PathBuf {
        self.config
            .checkpoint_dir
            .join(format!("{}_{}", self.config.save_path, iteration))
    }

    fn stop_on_interrupt(&mut self) -> VcError {
        let autosaved = if self.config.autosave() {
            let path = self.config.autosave_path.clone();
            match self.save_trainable_model(&path) {
                Ok(()) => true,
                Err(e) => return e,
            }
        } else {
            false
        };
        warn!(iteration = self.iteration(), autosaved, "training interrupted");
        self.state = SolverState::Interrupted { autosaved };
        VcError::InterruptedTraining { autosaved }
    }
}
