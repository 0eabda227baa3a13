// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Training loop behaviour: resume, periodic checkpoints and interrupts.

mod common;

use autovc::checkpoint::{self, CheckpointBundle};
use autovc::{
    BatchSource, CheckpointMode, CircularMapping, IdentityBatch, IdentityLoader, IdentityMapping,
    InterruptFlag, Solver, SolverState, SpeakerDataset, SpeakerTable, VcError, MEL_CHANNELS,
};
use common::{circular_batches, identity_batches, tiny_config, TinyNet};
use tch::{Device, Kind, Tensor};
use tempfile::tempdir;

type TinySolver = Solver<TinyNet, IdentityMapping>;

/// Replays fixed batches and raises the flag when batch `trigger_at` is handed out.
struct TriggeringSource {
    batches: Vec<IdentityBatch>,
    flag: InterruptFlag,
    trigger_at: usize,
}

impl BatchSource for TriggeringSource {
    type Batch = IdentityBatch;

    fn batches(&mut self) -> autovc::Result<Box<dyn Iterator<Item = autovc::Result<IdentityBatch>>>> {
        let flag = self.flag.clone();
        let trigger_at = self.trigger_at;
        Ok(Box::new(self.batches.clone().into_iter().enumerate().map(
            move |(i, batch)| {
                if i + 1 == trigger_at {
                    flag.trigger();
                }
                Ok(batch)
            },
        )))
    }
}

#[test]
fn test_fresh_training_writes_periodic_checkpoints() {
    let dir = tempdir().unwrap();
    let config = tiny_config(dir.path()).with_checkpoints(2, "tiny");
    let mut solver = TinySolver::new(config, IdentityMapping).unwrap();
    assert_eq!(solver.state(), SolverState::Fresh);
    assert_eq!(solver.iteration(), 0);

    // Three batches per pass, so the fourth iteration starts a new pass.
    let mut batches = identity_batches(3);
    solver.train(&mut batches).unwrap();

    assert_eq!(solver.iteration(), 4);
    assert_eq!(solver.state(), SolverState::Completed);
    assert!(solver.loss_history().iter().all(|l| l.is_finite()));

    let ckpt_dir = dir.path().join("trained_models");
    assert!(ckpt_dir.join("tiny_2").is_file());
    assert!(ckpt_dir.join("tiny_4").is_file());
    assert!(!ckpt_dir.join("tiny_3").exists());

    let bundle = checkpoint::load(ckpt_dir.join("tiny_2"), None).unwrap();
    assert!(bundle.is_full());
    assert_eq!(bundle.loss_history.as_deref(), Some(&solver.loss_history()[..2]));
    assert_eq!(bundle.optimizer.unwrap().step, 2);
}

#[test]
fn test_resume_continues_from_loss_history_length() {
    let dir = tempdir().unwrap();
    let first = TinySolver::new(tiny_config(dir.path()), IdentityMapping).unwrap();
    let saved = dir.path().join("base.ckpt");
    first.save_trainable_model(&saved).unwrap();

    // Pretend the bundle came from a run that had completed 150 iterations.
    let mut bundle = checkpoint::load(&saved, None).unwrap();
    bundle.loss_history = Some(vec![0.25; 150]);
    let resumable = dir.path().join("autovc_150");
    checkpoint::save(&bundle, &resumable).unwrap();

    let config = tiny_config(dir.path())
        .with_init_model(&resumable)
        .with_num_iters(2);
    let mut solver = TinySolver::new(config, IdentityMapping).unwrap();
    assert_eq!(solver.iteration(), 150);
    assert_eq!(solver.state(), SolverState::Resumed { iteration: 150 });

    let variables = solver.var_store().variables();
    for (name, original) in &bundle.weights {
        assert!(variables[name].equal(original), "parameter {name} not restored");
    }

    solver.train(&mut identity_batches(2)).unwrap();
    assert_eq!(solver.iteration(), 152);
    assert!(solver.loss_history()[..150].iter().all(|&l| l == 0.25));
}

#[test]
fn test_interrupt_with_autosave() {
    let dir = tempdir().unwrap();
    let config = tiny_config(dir.path()).with_num_iters(10);
    let flag = InterruptFlag::new();
    let mut solver = TinySolver::new(config, IdentityMapping)
        .unwrap()
        .with_interrupt_flag(flag.clone());

    let mut source = TriggeringSource {
        batches: identity_batches(5),
        flag,
        trigger_at: 3,
    };
    let err = solver.train(&mut source).unwrap_err();

    assert!(matches!(err, VcError::InterruptedTraining { autosaved: true }));
    assert_eq!(err.to_string(), "KeyboardInterrupt: autosave done.");
    assert_eq!(solver.state(), SolverState::Interrupted { autosaved: true });
    // The iteration that fetched the triggering batch still completes.
    assert_eq!(solver.iteration(), 3);

    let autosave = checkpoint::load(dir.path().join("autovc_autosave.ckpt"), None).unwrap();
    assert!(autosave.is_full());
    assert_eq!(autosave.loss_history.map(|h| h.len()), Some(3));
}

#[test]
fn test_interrupt_in_manual_mode_saves_nothing() {
    let dir = tempdir().unwrap();
    let config = tiny_config(dir.path()).with_checkpoint_mode(CheckpointMode::Manual);
    let flag = InterruptFlag::new();
    flag.trigger();
    let mut solver = TinySolver::new(config, IdentityMapping)
        .unwrap()
        .with_interrupt_flag(flag);

    let err = solver.train(&mut identity_batches(2)).unwrap_err();
    assert!(matches!(err, VcError::InterruptedTraining { autosaved: false }));
    assert_eq!(err.to_string(), "KeyboardInterrupt: no autosave.");
    assert_eq!(solver.iteration(), 0);
    assert!(!dir.path().join("autovc_autosave.ckpt").exists());
}

#[test]
fn test_resume_errors() {
    let dir = tempdir().unwrap();

    let missing = tiny_config(dir.path()).with_init_model(dir.path().join("absent.ckpt"));
    assert!(matches!(
        TinySolver::new(missing, IdentityMapping).err().unwrap(),
        VcError::NotFound { .. }
    ));

    let garbage_path = dir.path().join("garbage.ckpt");
    std::fs::write(&garbage_path, b"definitely not safetensors").unwrap();
    let garbage = tiny_config(dir.path()).with_init_model(&garbage_path);
    assert!(matches!(
        TinySolver::new(garbage, IdentityMapping).err().unwrap(),
        VcError::ResumeFailed { .. }
    ));

    // Inference bundles have no optimizer state to resume from.
    let inference_path = dir.path().join("inference.ckpt");
    TinySolver::new(tiny_config(dir.path()), IdentityMapping)
        .unwrap()
        .save_inference_model(&inference_path)
        .unwrap();
    let partial = tiny_config(dir.path()).with_init_model(&inference_path);
    assert!(matches!(
        TinySolver::new(partial, IdentityMapping).err().unwrap(),
        VcError::ResumeFailed { .. }
    ));
}

#[test]
fn test_resume_with_other_architecture_is_schema_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wide.ckpt");
    let mut wide = tiny_config(dir.path());
    wide.hyperparams.dim_neck = 3;
    TinySolver::new(wide, IdentityMapping)
        .unwrap()
        .save_trainable_model(&path)
        .unwrap();

    let config = tiny_config(dir.path()).with_init_model(&path);
    assert!(matches!(
        TinySolver::new(config, IdentityMapping).err().unwrap(),
        VcError::SchemaMismatch(_)
    ));
}

#[test]
fn test_inference_bundle_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("autovc.ckpt");
    let solver = TinySolver::new(tiny_config(dir.path()), IdentityMapping).unwrap();
    solver.save_inference_model(&path).unwrap();

    let state = checkpoint::load_weights_only(&path).unwrap();
    assert_eq!(state.hyperparams, common::tiny_hyperparams());
    let bundle: CheckpointBundle = checkpoint::load(&path, None).unwrap();
    assert!(!bundle.is_full());
    assert_eq!(bundle.weights.len(), solver.var_store().variables().len());
}

#[test]
fn test_circular_training_with_speaker_term() {
    let dir = tempdir().unwrap();
    let embedder = |mel: &Tensor| -> autovc::Result<Tensor> {
        Ok(mel.mean_dim(&[1i64][..], false, Kind::Float).narrow(1, 0, 4))
    };
    let objective = CircularMapping::with_embedder(Box::new(embedder));
    let mut solver =
        Solver::<TinyNet, CircularMapping>::new(tiny_config(dir.path()), objective).unwrap();

    solver.train(&mut circular_batches(2)).unwrap();
    assert_eq!(solver.iteration(), 4);
    assert!(solver.objective().uses_speaker_loss());
    assert!(solver.loss_history().iter().all(|l| l.is_finite() && *l > 0.0));
}

#[test]
fn test_training_from_spectrogram_cache() {
    let dir = tempdir().unwrap();
    let spmel = dir.path().join("spmel");
    common::write_spectrogram(&spmel.join("p225/a.npy"), 20);
    common::write_spectrogram(&spmel.join("p226/b.npy"), 6);
    common::write_spectrogram(&spmel.join("p227/c.npy"), 12);

    let dataset = SpeakerDataset::load(&common::speaker_table(), &spmel).unwrap();
    let config = tiny_config(dir.path()).with_num_iters(3);
    let mut loader =
        IdentityLoader::new(dataset, config.batch_size, config.len_crop, config.seed, Device::Cpu)
            .unwrap();

    let mut solver = TinySolver::new(config, IdentityMapping).unwrap();
    solver.train(&mut loader).unwrap();
    assert_eq!(solver.iteration(), 3);
}

#[test]
fn test_embedding_width_must_match_model() {
    let dir = tempdir().unwrap();
    let mut solver = TinySolver::new(tiny_config(dir.path()), IdentityMapping).unwrap();

    // The model expects dim_emb = 4.
    let mut narrow = vec![IdentityBatch {
        mel: Tensor::randn([2, 8, MEL_CHANNELS], (Kind::Float, Device::Cpu)),
        emb_org: Tensor::randn([2, 3], (Kind::Float, Device::Cpu)),
    }];
    let err = solver.train(&mut narrow).unwrap_err();
    assert!(matches!(err, VcError::SchemaMismatch(_)));
    assert!(solver.loss_history().is_empty());
}

#[test]
fn test_loader_embedding_width_must_match_model() {
    let dir = tempdir().unwrap();
    let spmel = dir.path().join("spmel");
    common::write_spectrogram(&spmel.join("p225/a.npy"), 16);
    common::write_spectrogram(&spmel.join("p226/b.npy"), 16);
    let table = SpeakerTable::from_pairs([
        ("p225", vec![1.0, 0.0, 0.0]),
        ("p226", vec![0.0, 1.0, 0.0]),
    ])
    .unwrap();

    let dataset = SpeakerDataset::load(&table, &spmel).unwrap();
    let config = tiny_config(dir.path());
    let mut loader =
        IdentityLoader::new(dataset, config.batch_size, config.len_crop, config.seed, Device::Cpu)
            .unwrap();

    let mut solver = TinySolver::new(config, IdentityMapping).unwrap();
    let err = solver.train(&mut loader).unwrap_err();
    assert!(matches!(err, VcError::SchemaMismatch(_)));
    assert_eq!(solver.iteration(), 0);
}
