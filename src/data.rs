// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Training batches and the spectrogram dataset loaders.
//!
//! The solver only needs a [`BatchSource`]: something that hands out a
//! fresh pass of batches on demand. When a pass runs dry the solver asks
//! for another one, so epoch boundaries never surface in the training loop.
//!
//! The stock loaders read the speaker metadata table plus a spectrogram
//! cache laid out as `<spmel>/<speaker>/<utterance>.npy`. Every pass visits
//! each speaker once in shuffled order, picks one random utterance per
//! speaker and crops a random `len_crop`-frame window out of it
//! (zero-padding utterances that are too short). Incomplete trailing
//! batches are dropped.

use crate::config::Hyperparams;
use crate::embedding::SpeakerTable;
use crate::error::{Result, VcError};
use crate::model::MEL_CHANNELS;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tch::{Device, Kind, Tensor};
use tracing::{debug, warn};

/// Batch for the identity-mapping solver.
#[derive(Debug)]
pub struct IdentityBatch {
    /// Spectrogram crops, `[batch, len_crop, 80]`
    pub mel: Tensor,
    /// Source speaker embeddings, `[batch, dim_emb]`
    pub emb_org: Tensor,
}

impl Clone for IdentityBatch {
    fn clone(&self) -> Self {
        Self {
            mel: self.mel.shallow_clone(),
            emb_org: self.emb_org.shallow_clone(),
        }
    }
}

/// Batch for the circular solver.
#[derive(Debug)]
pub struct CircularBatch {
    /// Spectrogram crops, `[batch, len_crop, 80]`
    pub mel: Tensor,
    /// Source speaker embeddings, `[batch, dim_emb]`
    pub emb_org: Tensor,
    /// Target speaker embeddings, `[batch, dim_emb]`
    pub emb_trg: Tensor,
}

impl Clone for CircularBatch {
    fn clone(&self) -> Self {
        Self {
            mel: self.mel.shallow_clone(),
            emb_org: self.emb_org.shallow_clone(),
            emb_trg: self.emb_trg.shallow_clone(),
        }
    }
}

/// Shape checks a batch must pass before it reaches the network.
pub trait TrainingBatch {
    /// Reject batches whose spectrograms or embeddings do not fit `hparams`.
    fn validate(&self, hparams: &Hyperparams) -> Result<()>;
}

fn check_mel(mel: &Tensor, freq: i64) -> Result<i64> {
    match mel.size()[..] {
        [batch, frames, MEL_CHANNELS] if frames > 0 && frames % freq == 0 => Ok(batch),
        _ => Err(VcError::SchemaMismatch(format!(
            "batch spectrograms have shape {:?}, expected [batch, k * {freq}, {MEL_CHANNELS}]",
            mel.size()
        ))),
    }
}

fn check_embedding(name: &str, emb: &Tensor, batch: i64, dim_emb: i64) -> Result<()> {
    if emb.size() != [batch, dim_emb] {
        return Err(VcError::SchemaMismatch(format!(
            "{name} has shape {:?}, model expects [{batch}, {dim_emb}]",
            emb.size()
        )));
    }
    Ok(())
}

impl TrainingBatch for IdentityBatch {
    fn validate(&self, hparams: &Hyperparams) -> Result<()> {
        let batch = check_mel(&self.mel, hparams.freq)?;
        check_embedding("emb_org", &self.emb_org, batch, hparams.dim_emb)
    }
}

impl TrainingBatch for CircularBatch {
    fn validate(&self, hparams: &Hyperparams) -> Result<()> {
        let batch = check_mel(&self.mel, hparams.freq)?;
        check_embedding("emb_org", &self.emb_org, batch, hparams.dim_emb)?;
        check_embedding("emb_trg", &self.emb_trg, batch, hparams.dim_emb)
    }
}

/// A restartable supply of training batches.
pub trait BatchSource {
    /// Item handed to the training objective
    type Batch;

    /// Start a new pass over the data.
    fn batches(&mut self) -> Result<Box<dyn Iterator<Item = Result<Self::Batch>>>>;
}

/// In-memory batches, replayed in order on every pass.
impl<B: Clone + 'static> BatchSource for Vec<B> {
    type Batch = B;

    fn batches(&mut self) -> Result<Box<dyn Iterator<Item = Result<B>>>> {
        Ok(Box::new(self.clone().into_iter().map(Ok)))
    }
}

/// One speaker's embedding and cached utterances.
#[derive(Debug, Clone)]
pub struct SpeakerUtterances {
    /// Speaker id from the metadata table
    pub speaker: String,
    /// Speaker embedding from the metadata table
    pub embedding: Vec<f32>,
    /// Cached `.npy` spectrograms, sorted
    pub utterances: Vec<PathBuf>,
}

/// Speakers with at least one cached spectrogram.
#[derive(Debug, Clone)]
pub struct SpeakerDataset {
    speakers: Vec<SpeakerUtterances>,
}

impl SpeakerDataset {
    /// Pair every metadata row with the `.npy` files under
    /// `<spectrogram_dir>/<speaker>/`. Speakers without utterances are skipped.
    pub fn load(table: &SpeakerTable, spectrogram_dir: impl AsRef<Path>) -> Result<Self> {
        let root = spectrogram_dir.as_ref();
        let mut speakers = Vec::with_capacity(table.len());

        for entry in table.entries() {
            let dir = root.join(&entry.speaker);
            let utterances = list_spectrograms(&dir)?;
            if utterances.is_empty() {
                warn!(speaker = %entry.speaker, dir = %dir.display(), "no cached spectrograms, skipping speaker");
                continue;
            }
            speakers.push(SpeakerUtterances {
                speaker: entry.speaker.clone(),
                embedding: entry.embedding.clone(),
                utterances,
            });
        }

        debug!(speakers = speakers.len(), "spectrogram dataset loaded");
        Self::from_speakers(speakers)
    }

    /// Build from explicit speaker records.
    pub fn from_speakers(speakers: Vec<SpeakerUtterances>) -> Result<Self> {
        if speakers.iter().all(|s| s.utterances.is_empty()) {
            return Err(VcError::EmptyDataset);
        }
        Ok(Self { speakers })
    }

    /// Speakers in metadata order.
    pub fn speakers(&self) -> &[SpeakerUtterances] {
        &self.speakers
    }

    /// Number of speakers.
    pub fn len(&self) -> usize {
        self.speakers.len()
    }

    /// Whether no speaker is left.
    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }
}

fn list_spectrograms(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "npy") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load a cached `[time, 80]` spectrogram with at least one frame.
pub fn load_spectrogram(path: impl AsRef<Path>) -> Result<Tensor> {
    let path = path.as_ref();
    let mel = Tensor::read_npy(path).map_err(|e| VcError::corrupt(path, e.to_string()))?;
    match mel.size()[..] {
        [frames, MEL_CHANNELS] if frames > 0 => {}
        _ => {
            return Err(VcError::corrupt(
                path,
                format!(
                    "expected a non-empty [time, {MEL_CHANNELS}] array, got shape {:?}",
                    mel.size()
                ),
            ))
        }
    }
    Ok(mel.to_kind(Kind::Float))
}

/// Random `len_crop`-frame window of `mel`, zero-padded when too short.
fn random_crop(mel: &Tensor, len_crop: i64, rng: &mut StdRng) -> Tensor {
    let frames = mel.size()[0];
    if frames < len_crop {
        mel.constant_pad_nd([0, 0, 0, len_crop - frames])
    } else {
        let start = rng.gen_range(0..=frames - len_crop);
        mel.narrow(0, start, len_crop)
    }
}

struct CropSampler {
    dataset: SpeakerDataset,
    len_crop: i64,
    device: Device,
}

impl CropSampler {
    fn crop(&self, speaker: usize, rng: &mut StdRng) -> Result<Tensor> {
        let utterances = &self.dataset.speakers[speaker].utterances;
        let path = utterances
            .choose(rng)
            .ok_or(VcError::EmptyDataset)?;
        Ok(random_crop(&load_spectrogram(path)?, self.len_crop, rng))
    }

    fn embeddings(&self, speakers: &[usize]) -> Tensor {
        let dim = self.dataset.speakers[speakers[0]].embedding.len() as i64;
        let flat: Vec<f32> = speakers
            .iter()
            .flat_map(|&s| self.dataset.speakers[s].embedding.iter().copied())
            .collect();
        Tensor::from_slice(&flat)
            .view([speakers.len() as i64, dim])
            .to_device(self.device)
    }

    fn mels(&self, speakers: &[usize], rng: &mut StdRng) -> Result<Tensor> {
        let crops = speakers
            .iter()
            .map(|&s| self.crop(s, rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&crops, 0).to_device(self.device))
    }

    fn identity_batch(&self, speakers: &[usize], rng: &mut StdRng) -> Result<IdentityBatch> {
        Ok(IdentityBatch {
            mel: self.mels(speakers, rng)?,
            emb_org: self.embeddings(speakers),
        })
    }

    fn circular_batch(&self, speakers: &[usize], rng: &mut StdRng) -> Result<CircularBatch> {
        let count = self.dataset.len();
        let targets: Vec<usize> = speakers
            .iter()
            .map(|&s| {
                // Draw from the other speakers by skipping over the source index.
                let t = rng.gen_range(0..count - 1);
                if t >= s {
                    t + 1
                } else {
                    t
                }
            })
            .collect();
        Ok(CircularBatch {
            mel: self.mels(speakers, rng)?,
            emb_org: self.embeddings(speakers),
            emb_trg: self.embeddings(&targets),
        })
    }
}

/// Shuffled speaker order cut into full batches, plus the RNG for the pass.
fn plan_pass(rng: &mut StdRng, speakers: usize, batch_size: usize) -> (Vec<Vec<usize>>, StdRng) {
    let mut order: Vec<usize> = (0..speakers).collect();
    order.shuffle(rng);
    let chunks = order.chunks_exact(batch_size).map(<[usize]>::to_vec).collect();
    (chunks, StdRng::seed_from_u64(rng.gen()))
}

fn check_batch_size(dataset: &SpeakerDataset, batch_size: usize) -> Result<()> {
    if batch_size == 0 || dataset.len() < batch_size {
        return Err(VcError::Config(format!(
            "batch_size {} needs at least that many speakers, dataset has {}",
            batch_size,
            dataset.len()
        )));
    }
    Ok(())
}

/// Loader producing [`IdentityBatch`]es.
pub struct IdentityLoader {
    sampler: Arc<CropSampler>,
    batch_size: usize,
    rng: StdRng,
}

impl IdentityLoader {
    /// Loader over `dataset`; needs at least `batch_size` speakers.
    pub fn new(
        dataset: SpeakerDataset,
        batch_size: usize,
        len_crop: i64,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        check_batch_size(&dataset, batch_size)?;
        Ok(Self {
            sampler: Arc::new(CropSampler {
                dataset,
                len_crop,
                device,
            }),
            batch_size,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl BatchSource for IdentityLoader {
    type Batch = IdentityBatch;

    fn batches(&mut self) -> Result<Box<dyn Iterator<Item = Result<IdentityBatch>>>> {
        let sampler = Arc::clone(&self.sampler);
        let (chunks, mut rng) = plan_pass(&mut self.rng, sampler.dataset.len(), self.batch_size);
        Ok(Box::new(
            chunks
                .into_iter()
                .map(move |chunk| sampler.identity_batch(&chunk, &mut rng)),
        ))
    }
}

/// Loader producing [`CircularBatch`]es with a random other target speaker.
pub struct CircularLoader {
    sampler: Arc<CropSampler>,
    batch_size: usize,
    rng: StdRng,
}

impl CircularLoader {
    /// Loader over `dataset`; needs at least `batch_size` and at least two speakers.
    pub fn new(
        dataset: SpeakerDataset,
        batch_size: usize,
        len_crop: i64,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        check_batch_size(&dataset, batch_size)?;
        if dataset.len() < 2 {
            return Err(VcError::Config(
                "circular training needs at least two speakers".to_string(),
            ));
        }
        Ok(Self {
            sampler: Arc::new(CropSampler {
                dataset,
                len_crop,
                device,
            }),
            batch_size,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl BatchSource for CircularLoader {
    type Batch = CircularBatch;

    fn batches(&mut self) -> Result<Box<dyn Iterator<Item = Result<CircularBatch>>>> {
        let sampler = Arc::clone(&self.sampler);
        let (chunks, mut rng) = plan_pass(&mut self.rng, sampler.dataset.len(), self.batch_size);
        Ok(Box::new(
            chunks
                .into_iter()
                .map(move |chunk| sampler.circular_batch(&chunk, &mut rng)),
        ))
    }
}
