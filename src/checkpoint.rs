// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Checkpoint bundles in safetensors format.
//!
//! A bundle is one safetensors file holding generator weights plus the
//! optional pieces a training run needs to resume:
//!
//! | key | content |
//! |---|---|
//! | `G_state_dict.<param>` | generator weights (`model.<param>` accepted on read) |
//! | `hyperparams` | int64 `[dim_neck, dim_emb, dim_pre, freq]` |
//! | `g_optimizer_state_dict.step` | int64 `[1]` Adam step counter |
//! | `g_optimizer_state_dict.param_groups` | float64 `[lr, beta1, beta2, eps]` |
//! | `g_optimizer_state_dict.exp_avg.<param>` | Adam first moments |
//! | `g_optimizer_state_dict.exp_avg_sq.<param>` | Adam second moments |
//! | `G_loss` | float64 `[n]` total loss per completed iteration |
//!
//! Saves go through a temporary sibling file that is renamed into place, so
//! a crash never leaves a half-written bundle at the target path.

use crate::config::Hyperparams;
use crate::error::{Result, VcError};
use crate::optim::AdamConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tch::{nn, Device, Kind, Tensor};
use tracing::{debug, warn};

const WEIGHTS_PREFIX: &str = "G_state_dict.";
const LEGACY_WEIGHTS_PREFIX: &str = "model.";
const HYPERPARAMS_KEY: &str = "hyperparams";
const OPTIMIZER_PREFIX: &str = "g_optimizer_state_dict.";
const OPTIMIZER_STEP: &str = "step";
const PARAM_GROUPS: &str = "param_groups";
const EXP_AVG_PREFIX: &str = "exp_avg.";
const EXP_AVG_SQ_PREFIX: &str = "exp_avg_sq.";
const LOSS_KEY: &str = "G_loss";

/// Adam state as stored in a bundle.
#[derive(Debug)]
pub struct OptimizerState {
    /// Number of optimizer steps taken
    pub step: i64,
    /// First moment estimate per parameter name
    pub exp_avg: Vec<(String, Tensor)>,
    /// Second moment estimate per parameter name
    pub exp_avg_sq: Vec<(String, Tensor)>,
    /// Hyperparameters the optimizer ran with, if recorded
    pub param_group: Option<AdamConfig>,
}

/// Everything a checkpoint file can hold.
#[derive(Debug)]
pub struct CheckpointBundle {
    /// Generator weights by parameter name
    pub weights: Vec<(String, Tensor)>,
    /// Architecture record
    pub hyperparams: Option<Hyperparams>,
    /// Optimizer state (full bundles only)
    pub optimizer: Option<OptimizerState>,
    /// Loss history, one value per completed iteration (full bundles only)
    pub loss_history: Option<Vec<f64>>,
}

impl CheckpointBundle {
    /// Bundle with weights and architecture only, for inference.
    pub fn partial(weights: Vec<(String, Tensor)>, hyperparams: Hyperparams) -> Self {
        Self {
            weights,
            hyperparams: Some(hyperparams),
            optimizer: None,
            loss_history: None,
        }
    }

    /// Whether the bundle carries optimizer state.
    pub fn is_full(&self) -> bool {
        self.optimizer.is_some()
    }
}

/// Weights plus resolved architecture, for inference.
#[derive(Debug)]
pub struct WeightState {
    /// Generator weights by parameter name
    pub weights: Vec<(String, Tensor)>,
    /// Architecture (fallback values when the bundle has none)
    pub hyperparams: Hyperparams,
}

/// Write a bundle to `path`, replacing any existing file.
pub fn save(bundle: &CheckpointBundle, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut named: Vec<(String, Tensor)> = Vec::with_capacity(bundle.weights.len() * 3 + 3);

    for (name, tensor) in &bundle.weights {
        named.push((format!("{WEIGHTS_PREFIX}{name}"), to_host(tensor)));
    }
    if let Some(hp) = &bundle.hyperparams {
        named.push((HYPERPARAMS_KEY.to_string(), Tensor::from_slice(&hp.to_array())));
    }
    if let Some(optimizer) = &bundle.optimizer {
        named.push((
            format!("{OPTIMIZER_PREFIX}{OPTIMIZER_STEP}"),
            Tensor::from_slice(&[optimizer.step]),
        ));
        if let Some(group) = &optimizer.param_group {
            named.push((
                format!("{OPTIMIZER_PREFIX}{PARAM_GROUPS}"),
                Tensor::from_slice(&[group.learning_rate, group.beta1, group.beta2, group.epsilon]),
            ));
        }
        for (name, tensor) in &optimizer.exp_avg {
            named.push((
                format!("{OPTIMIZER_PREFIX}{EXP_AVG_PREFIX}{name}"),
                to_host(tensor),
            ));
        }
        for (name, tensor) in &optimizer.exp_avg_sq {
            named.push((
                format!("{OPTIMIZER_PREFIX}{EXP_AVG_SQ_PREFIX}{name}"),
                to_host(tensor),
            ));
        }
    }
    // Zero-length tensors are not written; an absent G_loss in a full bundle reads back as empty.
    if let Some(history) = bundle.loss_history.as_ref().filter(|h| !h.is_empty()) {
        named.push((LOSS_KEY.to_string(), Tensor::from_slice(history)));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    if let Err(e) = Tensor::write_safetensors(&named, &tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    std::fs::rename(&tmp, path)?;

    debug!(path = %path.display(), tensors = named.len(), "checkpoint written");
    Ok(())
}

/// Read a bundle from `path`.
///
/// When the file has no `hyperparams` record, `default_hyperparams` is used;
/// with no default either, loading fails with [`VcError::SchemaMismatch`].
pub fn load(
    path: impl AsRef<Path>,
    default_hyperparams: Option<Hyperparams>,
) -> Result<CheckpointBundle> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(VcError::not_found("checkpoint", path));
    }

    let tensors =
        Tensor::read_safetensors(path).map_err(|e| VcError::corrupt(path, e.to_string()))?;

    let mut weights = Vec::new();
    let mut legacy_weights = Vec::new();
    let mut hyperparams = None;
    let mut step = None;
    let mut exp_avg = Vec::new();
    let mut exp_avg_sq = Vec::new();
    let mut param_group = None;
    let mut loss_history = None;

    for (name, tensor) in tensors {
        if let Some(param) = name.strip_prefix(WEIGHTS_PREFIX) {
            weights.push((param.to_string(), tensor));
        } else if let Some(param) = name.strip_prefix(LEGACY_WEIGHTS_PREFIX) {
            legacy_weights.push((param.to_string(), tensor));
        } else if name == HYPERPARAMS_KEY {
            let values = to_vec::<i64>(path, &name, &tensor)?;
            let hp = Hyperparams::from_slice(&values).ok_or_else(|| {
                VcError::corrupt(path, format!("hyperparams has {} values, expected 4", values.len()))
            })?;
            hyperparams = Some(hp);
        } else if let Some(rest) = name.strip_prefix(OPTIMIZER_PREFIX) {
            if rest == OPTIMIZER_STEP {
                step = to_vec::<i64>(path, &name, &tensor)?.first().copied();
            } else if rest == PARAM_GROUPS {
                let values = to_vec::<f64>(path, &name, &tensor)?;
                let [learning_rate, beta1, beta2, epsilon] = values[..] else {
                    return Err(VcError::corrupt(
                        path,
                        format!("param_groups has {} values, expected 4", values.len()),
                    ));
                };
                param_group = Some(AdamConfig {
                    learning_rate,
                    beta1,
                    beta2,
                    epsilon,
                });
            } else if let Some(param) = rest.strip_prefix(EXP_AVG_SQ_PREFIX) {
                exp_avg_sq.push((param.to_string(), tensor));
            } else if let Some(param) = rest.strip_prefix(EXP_AVG_PREFIX) {
                exp_avg.push((param.to_string(), tensor));
            } else {
                debug!(key = %name, "ignoring unknown optimizer entry");
            }
        } else if name == LOSS_KEY {
            loss_history = Some(to_vec::<f64>(path, &name, &tensor)?);
        } else {
            debug!(key = %name, "ignoring unknown checkpoint entry");
        }
    }

    if weights.is_empty() {
        weights = legacy_weights;
    }
    if weights.is_empty() {
        return Err(VcError::corrupt(path, "no generator weights"));
    }
    weights.sort_by(|a, b| a.0.cmp(&b.0));

    let hyperparams = match (hyperparams, default_hyperparams) {
        (Some(hp), _) => hp,
        (None, Some(default)) => default,
        (None, None) => {
            return Err(VcError::SchemaMismatch(format!(
                "{} has no hyperparams and no default was supplied",
                path.display()
            )))
        }
    };

    let optimizer = match step {
        Some(step) => Some(OptimizerState {
            step,
            exp_avg,
            exp_avg_sq,
            param_group,
        }),
        None if exp_avg.is_empty() && exp_avg_sq.is_empty() => None,
        None => return Err(VcError::corrupt(path, "optimizer moments without a step counter")),
    };
    if optimizer.is_some() && loss_history.is_none() {
        loss_history = Some(Vec::new());
    }

    Ok(CheckpointBundle {
        weights,
        hyperparams: Some(hyperparams),
        optimizer,
        loss_history,
    })
}

/// Read only the generator weights and architecture from `path`.
///
/// Optimizer state and loss history are ignored if present; a missing
/// architecture record resolves to [`Hyperparams::FALLBACK`].
pub fn load_weights_only(path: impl AsRef<Path>) -> Result<WeightState> {
    let bundle = load(path, Some(Hyperparams::FALLBACK))?;
    Ok(WeightState {
        weights: bundle.weights,
        hyperparams: bundle.hyperparams.unwrap_or(Hyperparams::FALLBACK),
    })
}

/// Snapshot every variable of a VarStore, sorted by name.
pub fn varstore_weights(vs: &nn::VarStore) -> Vec<(String, Tensor)> {
    let mut weights: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .map(|(name, tensor)| (name, tensor.detach()))
        .collect();
    weights.sort_by(|a, b| a.0.cmp(&b.0));
    weights
}

/// Copy named weights into the matching VarStore variables.
///
/// Every variable must have a same-shaped tensor in `weights`.
pub fn copy_into_varstore(vs: &nn::VarStore, weights: &[(String, Tensor)]) -> Result<()> {
    let lookup: HashMap<&str, &Tensor> = weights.iter().map(|(n, t)| (n.as_str(), t)).collect();
    let mut variables = vs.variables();

    for name in lookup.keys() {
        if !variables.contains_key(*name) {
            warn!(param = %name, "checkpoint tensor has no matching parameter");
        }
    }

    tch::no_grad(|| {
        for (name, var) in variables.iter_mut() {
            let src = lookup.get(name.as_str()).ok_or_else(|| {
                VcError::SchemaMismatch(format!("checkpoint has no tensor for parameter {name}"))
            })?;
            if src.size() != var.size() {
                return Err(VcError::SchemaMismatch(format!(
                    "parameter {name}: checkpoint shape {:?}, model shape {:?}",
                    src.size(),
                    var.size()
                )));
            }
            var.copy_(src);
        }
        Ok(())
    })
}

fn to_host(tensor: &Tensor) -> Tensor {
    tensor.detach().to_device(Device::Cpu).contiguous()
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn to_vec<T: tch::kind::Element + Copy>(path: &Path, key: &str, tensor: &Tensor) -> Result<Vec<T>> {
    let flat = tensor.to_kind(T::KIND).reshape([-1]);
    Vec::<T>::try_from(&flat).map_err(|e| VcError::corrupt(path, format!("{key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_weights() -> Vec<(String, Tensor)> {
        vec![
            ("decoder.weight".to_string(), Tensor::randn([3, 4], (Kind::Float, Device::Cpu))),
            ("encoder.bias".to_string(), Tensor::randn([5], (Kind::Float, Device::Cpu))),
        ]
    }

    #[test]
    fn test_partial_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autovc.ckpt");
        let weights = sample_weights();
        let hp = Hyperparams::new(32, 256, 512, 32);

        let bundle = CheckpointBundle::partial(
            weights.iter().map(|(n, t)| (n.clone(), t.shallow_clone())).collect(),
            hp,
        );
        save(&bundle, &path).unwrap();

        let loaded = load(&path, None).unwrap();
        assert_eq!(loaded.hyperparams, Some(hp));
        assert!(!loaded.is_full());
        assert!(loaded.loss_history.is_none());
        assert_eq!(loaded.weights.len(), 2);
        for ((name_a, a), (name_b, b)) in weights.iter().zip(loaded.weights.iter()) {
            assert_eq!(name_a, name_b);
            assert!(a.equal(b), "tensor {name_a} changed");
        }
    }

    #[test]
    fn test_full_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_3");
        let bundle = CheckpointBundle {
            weights: sample_weights(),
            hyperparams: Some(Hyperparams::default()),
            optimizer: Some(OptimizerState {
                step: 3,
                exp_avg: sample_weights(),
                exp_avg_sq: sample_weights(),
                param_group: Some(AdamConfig {
                    learning_rate: 5e-4,
                    ..AdamConfig::default()
                }),
            }),
            loss_history: Some(vec![0.5, 0.25, 0.125]),
        };
        save(&bundle, &path).unwrap();

        let loaded = load(&path, None).unwrap();
        assert_eq!(loaded.loss_history, Some(vec![0.5, 0.25, 0.125]));
        let optimizer = loaded.optimizer.unwrap();
        assert_eq!(optimizer.step, 3);
        assert_eq!(optimizer.exp_avg.len(), 2);
        assert_eq!(optimizer.exp_avg_sq.len(), 2);
        assert_eq!(optimizer.param_group.map(|g| g.learning_rate), Some(5e-4));
        assert!(!dir.path().join("run_3.tmp").exists());
    }

    #[test]
    fn test_missing_hyperparams_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.ckpt");
        let named = vec![("G_state_dict.w".to_string(), Tensor::ones([2], (Kind::Float, Device::Cpu)))];
        Tensor::write_safetensors(&named, &path).unwrap();

        let state = load_weights_only(&path).unwrap();
        assert_eq!(state.hyperparams.to_array(), [32, 256, 512, 32]);

        let err = load(&path, None).unwrap_err();
        assert!(matches!(err, VcError::SchemaMismatch(_)));
    }

    #[test]
    fn test_legacy_model_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.ckpt");
        let named = vec![("model.w".to_string(), Tensor::ones([2], (Kind::Float, Device::Cpu)))];
        Tensor::write_safetensors(&named, &path).unwrap();

        let state = load_weights_only(&path).unwrap();
        assert_eq!(state.weights.len(), 1);
        assert_eq!(state.weights[0].0, "w");
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();

        let err = load(dir.path().join("absent.ckpt"), None).unwrap_err();
        assert!(matches!(err, VcError::NotFound { .. }));

        let garbage = dir.path().join("garbage.ckpt");
        std::fs::write(&garbage, b"not a checkpoint").unwrap();
        let err = load(&garbage, None).unwrap_err();
        assert!(matches!(err, VcError::Corrupt { .. }));
    }

    #[test]
    fn test_copy_into_varstore_checks_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = vs.root().var("w", &[2, 2], nn::Init::Const(0.0));

        let good = vec![("w".to_string(), Tensor::ones([2, 2], (Kind::Float, Device::Cpu)))];
        copy_into_varstore(&vs, &good).unwrap();
        let w = vs.variables()["w"].shallow_clone();
        assert_eq!(w.sum(Kind::Float).double_value(&[]), 4.0);

        let bad = vec![("w".to_string(), Tensor::ones([3], (Kind::Float, Device::Cpu)))];
        assert!(matches!(
            copy_into_varstore(&vs, &bad),
            Err(VcError::SchemaMismatch(_))
        ));
        assert!(matches!(
            copy_into_varstore(&vs, &[]),
            Err(VcError::SchemaMismatch(_))
        ));
    }
}
