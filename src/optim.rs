// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Adam over a VarStore with exportable state.
//!
//! `tch::nn::Optimizer` keeps its moment buffers inside libtorch where they
//! cannot be read back, so resuming a run would silently restart Adam from
//! zero. This implementation holds the buffers as plain tensors keyed by
//! parameter name so they can travel in a checkpoint bundle.

use crate::checkpoint::OptimizerState;
use crate::config::TrainingConfig;
use crate::error::{Result, VcError};
use std::collections::HashMap;
use tch::{nn, Tensor};
use tracing::info;

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    /// Step size
    pub learning_rate: f64,
    /// Decay of the first moment estimate
    pub beta1: f64,
    /// Decay of the second moment estimate
    pub beta2: f64,
    /// Denominator term for numerical stability
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl From<&TrainingConfig> for AdamConfig {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.epsilon,
        }
    }
}

struct ParamSlot {
    name: String,
    param: Tensor,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// Adam optimizer bound to the trainable variables of one VarStore.
pub struct Adam {
    slots: Vec<ParamSlot>,
    step: i64,
    config: AdamConfig,
}

impl Adam {
    /// Bind to every trainable variable in `vs`, with zeroed moments.
    pub fn new(vs: &nn::VarStore, config: AdamConfig) -> Self {
        let mut params: Vec<(String, Tensor)> = vs
            .variables()
            .into_iter()
            .filter(|(_, t)| t.requires_grad())
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let slots = params
            .into_iter()
            .map(|(name, param)| ParamSlot {
                exp_avg: param.zeros_like(),
                exp_avg_sq: param.zeros_like(),
                name,
                param,
            })
            .collect();

        Self {
            slots,
            step: 0,
            config,
        }
    }

    /// Steps taken so far.
    pub fn step_count(&self) -> i64 {
        self.step
    }

    /// Clear accumulated gradients of every bound parameter.
    pub fn zero_grad(&mut self) {
        for slot in &mut self.slots {
            slot.param.zero_grad();
        }
    }

    /// Apply one Adam update from the current gradients.
    ///
    /// Parameters without a gradient are left untouched.
    pub fn step(&mut self) {
        self.step += 1;
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let bias1 = 1.0 - beta1.powi(self.step as i32);
        let bias2 = 1.0 - beta2.powi(self.step as i32);

        tch::no_grad(|| {
            for slot in &mut self.slots {
                let grad = slot.param.grad();
                if !grad.defined() {
                    continue;
                }
                let m = &slot.exp_avg * beta1 + &grad * (1.0 - beta1);
                let v = &slot.exp_avg_sq * beta2 + (&grad * &grad) * (1.0 - beta2);
                slot.exp_avg.copy_(&m);
                slot.exp_avg_sq.copy_(&v);

                let denom = (v / bias2).sqrt() + epsilon;
                let update = m / bias1 / denom * learning_rate;
                let updated = &slot.param - update;
                slot.param.copy_(&updated);
            }
        });
    }

    /// Export step counter, hyperparameters and moments keyed by parameter name.
    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.step,
            exp_avg: self
                .slots
                .iter()
                .map(|s| (s.name.clone(), s.exp_avg.detach()))
                .collect(),
            exp_avg_sq: self
                .slots
                .iter()
                .map(|s| (s.name.clone(), s.exp_avg_sq.detach()))
                .collect(),
            param_group: Some(self.config),
        }
    }

    /// Restore state exported by [`Adam::state`].
    ///
    /// Every bound parameter must have same-shaped moments in `state`. A
    /// recorded param group replaces the configured hyperparameters.
    pub fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        let exp_avg: HashMap<&str, &Tensor> =
            state.exp_avg.iter().map(|(n, t)| (n.as_str(), t)).collect();
        let exp_avg_sq: HashMap<&str, &Tensor> =
            state.exp_avg_sq.iter().map(|(n, t)| (n.as_str(), t)).collect();

        tch::no_grad(|| {
            for slot in &mut self.slots {
                for (buffer, source, kind) in [
                    (&mut slot.exp_avg, &exp_avg, "exp_avg"),
                    (&mut slot.exp_avg_sq, &exp_avg_sq, "exp_avg_sq"),
                ] {
                    let src = source.get(slot.name.as_str()).ok_or_else(|| {
                        VcError::SchemaMismatch(format!(
                            "optimizer state has no {kind} for parameter {}",
                            slot.name
                        ))
                    })?;
                    if src.size() != buffer.size() {
                        return Err(VcError::SchemaMismatch(format!(
                            "optimizer {kind} for {}: shape {:?}, expected {:?}",
                            slot.name,
                            src.size(),
                            buffer.size()
                        )));
                    }
                    buffer.copy_(src);
                }
            }
            Ok(())
        })?;

        self.step = state.step;
        if let Some(group) = state.param_group {
            if group != self.config {
                info!(
                    learning_rate = group.learning_rate,
                    configured = self.config.learning_rate,
                    "restoring optimizer hyperparameters from checkpoint"
                );
            }
            self.config = group;
        }
        Ok(())
    }
}
