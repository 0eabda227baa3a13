// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Time-axis padding for spectrograms.
//!
//! The generator down-samples content codes every `freq` frames, so its
//! input length must be a multiple of that block size. [`pad_to_block`]
//! zero-pads trailing frames and reports how many were added so that
//! [`trim_padding`] can strip them from the output again.

use crate::error::{Result, VcError};
use tch::Tensor;

/// Zero-pad the time axis (dim 0) of a `[time, feature]` sequence up to the
/// smallest multiple of `block_size`.
///
/// Returns the padded sequence and the number of appended rows, which is
/// always in `0..block_size`.
pub fn pad_to_block(sequence: &Tensor, block_size: i64) -> Result<(Tensor, i64)> {
    if block_size <= 0 {
        return Err(VcError::Config(format!(
            "block size must be positive, got {block_size}"
        )));
    }
    if sequence.dim() != 2 {
        return Err(VcError::Config(format!(
            "expected a [time, feature] sequence, got shape {:?}",
            sequence.size()
        )));
    }

    let len = sequence.size()[0];
    let padded_len = (len + block_size - 1) / block_size * block_size;
    let pad = padded_len - len;
    if pad == 0 {
        return Ok((sequence.shallow_clone(), 0));
    }

    // constant_pad_nd takes (last-dim before, last-dim after, dim-0 before, dim-0 after)
    Ok((sequence.constant_pad_nd(&[0, 0, 0, pad]), pad))
}

/// Remove the last `pad` rows along the time axis (dim 0).
///
/// `pad == 0` returns the input untouched.
pub fn trim_padding(output: &Tensor, pad: i64) -> Result<Tensor> {
    if pad == 0 {
        return Ok(output.shallow_clone());
    }
    let len = output.size().first().copied().unwrap_or(0);
    if pad < 0 || pad > len {
        return Err(VcError::Config(format!(
            "cannot trim {pad} rows from a sequence of {len}"
        )));
    }
    Ok(output.narrow(0, 0, len - pad))
}
