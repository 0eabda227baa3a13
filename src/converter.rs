// Copyright 2026 The autovc authors.
// SPDX-License-Identifier: Apache-2.0

//! Voice conversion pipeline: cached spectrograms in, WAV files out.
//!
//! A [`ConversionJob`] names a source relative to the waveform root, either
//! one utterance (`p225/p225_003.wav`) or a directory (`p225`), plus a target
//! speaker. The first path component of the source is the source speaker.
//!
//! Conversion runs in two phases. The generator phase loads the checkpoint,
//! converts every utterance's cached spectrogram and then drops the network
//! and its weights. Only then is the vocoder loaded to render each converted
//! spectrogram to 16 kHz audio.

use crate::audio::write_wav_file;
use crate::checkpoint::{self, WeightState};
use crate::config::{parse_device, ConverterConfig};
use crate::data::load_spectrogram;
use crate::embedding::{resolve_tensor, SpeakerTable};
use crate::error::{Result, VcError};
use crate::model::{ConversionNetwork, Generator};
use crate::padding::{pad_to_block, trim_padding};
use crate::vocoder::{Vocoder, VocoderLoader};
use crate::DEFAULT_SAMPLE_RATE;
use std::marker::PhantomData;
use std::path::{Component, Path, PathBuf};
use tch::{nn, Device, Kind, Tensor};
use tracing::{debug, info};

/// What to convert and into whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionJob {
    /// Utterance file or speaker directory, relative to the waveform root
    pub source: PathBuf,
    /// Target speaker id
    pub target: String,
}

impl ConversionJob {
    /// Job converting `source` into the voice of `target`.
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// Speaker id of the source: its first path component.
    pub fn source_speaker(&self) -> Result<String> {
        first_component(&self.source)
            .ok_or_else(|| VcError::InvalidPath(self.source.clone()))
    }
}

/// A converted spectrogram awaiting synthesis.
#[derive(Debug)]
pub struct ConvertedUtterance {
    /// `<source_speaker>_<utterance>_by_<target_speaker>`
    pub label: String,
    /// `[time, 80]`, padding removed
    pub mel: Tensor,
}

/// Conversion pipeline over network type `N`.
pub struct Converter<N: ConversionNetwork = Generator> {
    config: ConverterConfig,
    device: Device,
    network: PhantomData<N>,
}

impl<N: ConversionNetwork> Converter<N> {
    /// Converter on the device named in `config`. Nothing is loaded yet.
    pub fn new(config: ConverterConfig) -> Result<Self> {
        let device = parse_device(&config.device)?;
        Ok(Self {
            config,
            device,
            network: PhantomData,
        })
    }

    /// Paths and device the converter was built with.
    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Convert every utterance of `job` and write one WAV per utterance.
    ///
    /// Returns the written paths in conversion order.
    pub fn convert<L: VocoderLoader>(&self, job: &ConversionJob, loader: &L) -> Result<Vec<PathBuf>> {
        let source_speaker = job.source_speaker()?;
        let table = SpeakerTable::load(self.config.metadata_path())?;
        let emb_org = resolve_tensor(&table, &source_speaker, self.device)?;
        let emb_trg = resolve_tensor(&table, &job.target, self.device)?;

        let utterances = self.expand_source(&job.source)?;
        info!(
            source = %job.source.display(),
            target = %job.target,
            utterances = utterances.len(),
            "converting"
        );

        let converted = self.convert_spectrograms(
            &utterances,
            &job.target,
            table.embedding_dim(),
            &emb_org,
            &emb_trg,
        )?;
        self.synthesize(&converted, loader)
    }

    /// Utterance paths (relative to the waveform root) covered by `source`.
    ///
    /// A file yields itself; a directory yields every file below it, sorted.
    pub fn expand_source(&self, source: &Path) -> Result<Vec<PathBuf>> {
        let full = self.config.wav_dir.join(source);
        if full.is_file() {
            return Ok(vec![source.to_path_buf()]);
        }
        if !full.is_dir() {
            return Err(VcError::InvalidPath(full));
        }

        let mut files = Vec::new();
        collect_files(&full, &mut files)?;
        files.sort();
        Ok(files
            .into_iter()
            .filter_map(|f| {
                f.strip_prefix(&self.config.wav_dir)
                    .ok()
                    .map(Path::to_path_buf)
            })
            .collect())
    }

    /// Locate the cached spectrogram of `utterance`.
    ///
    /// Tries `<spmel>/<utterance with .npy>` and then
    /// `<spmel>/<speaker>/<remaining components concatenated>.npy`.
    pub fn find_spectrogram(&self, utterance: &Path) -> Result<PathBuf> {
        spectrogram_candidates(&self.config.spectrogram_dir, utterance)
            .into_iter()
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| VcError::SpectrogramNotFound {
                utterance: utterance.to_path_buf(),
            })
    }

    /// Generator phase. The network and its weights are dropped on return.
    fn convert_spectrograms(
        &self,
        utterances: &[PathBuf],
        target: &str,
        embedding_dim: Option<usize>,
        emb_org: &Tensor,
        emb_trg: &Tensor,
    ) -> Result<Vec<ConvertedUtterance>> {
        let WeightState {
            weights,
            hyperparams,
        } = checkpoint::load_weights_only(&self.config.model)?;
        hyperparams.validate()?;
        if embedding_dim != Some(hyperparams.dim_emb as usize) {
            return Err(VcError::SchemaMismatch(format!(
                "speaker embeddings have length {}, model expects {}",
                embedding_dim.unwrap_or(0),
                hyperparams.dim_emb
            )));
        }

        let vs = nn::VarStore::new(self.device);
        let net = N::build(&vs.root(), &hyperparams);
        checkpoint::copy_into_varstore(&vs, &weights)?;
        drop(weights);
        debug!(model = %self.config.model.display(), ?hyperparams, "generator loaded");

        let mut converted = Vec::with_capacity(utterances.len());
        for utterance in utterances {
            let path = self.find_spectrogram(utterance)?;
            let mel = load_spectrogram(&path)?;
            let (padded, pad) = pad_to_block(&mel, hyperparams.freq)?;

            let input = padded.to_device(self.device).to_kind(Kind::Float).unsqueeze(0);
            let output = tch::no_grad(|| net.forward(&input, emb_org, emb_trg));
            let mel = trim_padding(&output.mel_postnet.get(0), pad)?.to_device(Device::Cpu);

            let label = utterance_label(utterance, target)?;
            debug!(%label, frames = mel.size()[0], "converted");
            converted.push(ConvertedUtterance { label, mel });
        }
        Ok(converted)
    }

    /// Vocoder phase: render and write every converted spectrogram.
    fn synthesize<L: VocoderLoader>(
        &self,
        converted: &[ConvertedUtterance],
        loader: &L,
    ) -> Result<Vec<PathBuf>> {
        let vocoder = loader.load(&self.config.vocoder, self.device)?;
        std::fs::create_dir_all(&self.config.output_dir)?;

        let mut written = Vec::with_capacity(converted.len());
        for utterance in converted {
            let samples = vocoder.synthesize(&utterance.mel)?;
            let path = self.config.output_dir.join(format!("{}.wav", utterance.label));
            write_wav_file(&path, &samples, DEFAULT_SAMPLE_RATE)?;
            info!(path = %path.display(), samples = samples.len(), "written");
            written.push(path);
        }
        Ok(written)
    }
}

fn normal_components(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

fn first_component(path: &Path) -> Option<String> {
    normal_components(path).into_iter().next()
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if path.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

/// Both spectrogram locations for `utterance`, primary first, deduplicated.
fn spectrogram_candidates(spectrogram_dir: &Path, utterance: &Path) -> Vec<PathBuf> {
    let primary = spectrogram_dir.join(utterance).with_extension("npy");

    let parts = normal_components(&utterance.with_extension("npy"));
    let mut candidates = vec![primary];
    if let Some((speaker, rest)) = parts.split_first() {
        if !rest.is_empty() {
            let alternate = spectrogram_dir.join(speaker).join(rest.concat());
            if !candidates.contains(&alternate) {
                candidates.push(alternate);
            }
        }
    }
    candidates
}

/// `<source_speaker>_<rest joined by "__", extension dropped>_by_<target>`.
fn utterance_label(utterance: &Path, target: &str) -> Result<String> {
    let parts = normal_components(&utterance.with_extension(""));
    match parts.split_first() {
        Some((speaker, rest)) if !rest.is_empty() => {
            Ok(format!("{}_{}_by_{}", speaker, rest.join("__"), target))
        }
        _ => Err(VcError::InvalidPath(utterance.to_path_buf())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utterance_label() {
        assert_eq!(
            utterance_label(Path::new("p225/p225_003.wav"), "p226").unwrap(),
            "p225_p225_003_by_p226"
        );
        assert_eq!(
            utterance_label(Path::new("p225/session1/x.wav"), "p226").unwrap(),
            "p225_session1__x_by_p226"
        );
        assert!(utterance_label(Path::new("p225"), "p226").is_err());
    }

    #[test]
    fn test_spectrogram_candidates() {
        let root = Path::new("spmel");

        let flat = spectrogram_candidates(root, Path::new("p225/x.wav"));
        assert_eq!(flat, vec![PathBuf::from("spmel/p225/x.npy")]);

        let nested = spectrogram_candidates(root, Path::new("p225/s1/x.wav"));
        assert_eq!(
            nested,
            vec![
                PathBuf::from("spmel/p225/s1/x.npy"),
                PathBuf::from("spmel/p225/s1x.npy"),
            ]
        );
    }

    #[test]
    fn test_source_speaker() {
        assert_eq!(
            ConversionJob::new("p225/x.wav", "p226").source_speaker().unwrap(),
            "p225"
        );
        assert_eq!(
            ConversionJob::new("./p225", "p226").source_speaker().unwrap(),
            "p225"
        );
        assert!(matches!(
            ConversionJob::new("", "p226").source_speaker(),
            Err(VcError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_expand_source() {
        let dir = tempfile::tempdir().unwrap();
        let wavs = dir.path().join("wavs");
        for f in ["p225/b.wav", "p225/a.wav", "p225/s1/c.wav"] {
            let path = wavs.join(f);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"").unwrap();
        }
        let converter = Converter::<Generator>::new(ConverterConfig {
            wav_dir: wavs,
            device: "cpu".to_string(),
            ..ConverterConfig::default()
        })
        .unwrap();

        let all = converter.expand_source(Path::new("p225")).unwrap();
        assert_eq!(
            all,
            vec![
                PathBuf::from("p225/a.wav"),
                PathBuf::from("p225/b.wav"),
                PathBuf::from("p225/s1/c.wav"),
            ]
        );

        let one = converter.expand_source(Path::new("p225/a.wav")).unwrap();
        assert_eq!(one, vec![PathBuf::from("p225/a.wav")]);

        assert!(matches!(
            converter.expand_source(Path::new("p999")),
            Err(VcError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_missing_spectrogram() {
        let dir = tempfile::tempdir().unwrap();
        let converter = Converter::<Generator>::new(ConverterConfig {
            spectrogram_dir: dir.path().to_path_buf(),
            device: "cpu".to_string(),
            ..ConverterConfig::default()
        })
        .unwrap();

        let err = converter.find_spectrogram(Path::new("p225/s1/x.wav")).unwrap_err();
        assert!(matches!(err, VcError::SpectrogramNotFound { .. }));

        let alternate = dir.path().join("p225/s1x.npy");
        std::fs::create_dir_all(alternate.parent().unwrap()).unwrap();
        std::fs::write(&alternate, b"").unwrap();
        assert_eq!(
            converter.find_spectrogram(Path::new("p225/s1/x.wav")).unwrap(),
            alternate
        );
    }
}
