// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! WAV input/output for synthesized waveforms.

use crate::error::{Result, VcError};
use hound::{WavReader, WavSpec, WavWriter};
use std::path::Path;

/// Write mono samples in `[-1, 1]` as a 16-bit PCM WAV file.
///
/// Samples outside the range are clamped.
pub fn write_wav_file(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec).map_err(|e| {
        VcError::Audio(format!("failed to create {}: {}", path.display(), e))
    })?;

    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer
            .write_sample(scaled)
            .map_err(|e| VcError::Audio(format!("failed to write sample: {e}")))?;
    }

    writer
        .finalize()
        .map_err(|e| VcError::Audio(format!("failed to finalize {}: {}", path.display(), e)))?;

    Ok(())
}

/// Read a WAV file as mono `f32` samples plus its sample rate.
///
/// Stereo input is averaged down to one channel.
pub fn load_wav_file(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .map_err(|e| VcError::Audio(format!("failed to open {}: {}", path.display(), e)))?;

    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| VcError::Audio(e.to_string()))?,
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|s| s as f32 / max_val))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| VcError::Audio(e.to_string()))?
        }
    };

    let samples = if spec.channels == 2 {
        samples
            .chunks(2)
            .map(|c| (c[0] + c.get(1).copied().unwrap_or(c[0])) / 2.0)
            .collect()
    } else {
        samples
    };

    Ok((samples, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..1600).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();

        write_wav_file(&path, &samples, 16_000).unwrap();
        let (loaded, rate) = load_wav_file(&path).unwrap();

        assert_eq!(rate, 16_000);
        assert_eq!(loaded.len(), samples.len());
        for (a, b) in samples.iter().zip(loaded.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_out_of_range_samples_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loud.wav");
        write_wav_file(&path, &[2.0, -3.0], 16_000).unwrap();

        let (loaded, _) = load_wav_file(&path).unwrap();
        assert!((loaded[0] - 1.0).abs() < 1e-3);
        assert!((loaded[1] + 1.0).abs() < 1e-3);
    }
}
