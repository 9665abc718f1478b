//! Transcript-list datasets and batching
//!
//! A split is described by one or more transcript list files: UTF-8, one
//! `audio_path<TAB>transcript` entry per line, `#` lines and empty lines
//! ignored. Audio is loaded lazily at batch time, so an epoch streams
//! through the split instead of holding it in memory.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;

use ctc_asr_config::DatasetConfig;
use ctc_asr_core::{read_raw_audio, Error, Result};
use ctc_asr_features::{SpeechFeaturizer, TextFeaturizer};

/// One transcript-list entry
#[derive(Debug, Clone)]
pub struct Utterance {
    pub audio: PathBuf,
    pub transcript: String,
}

/// A padded batch ready for the model.
///
/// `features` is `[B, T_max, bins, channels]` zero-padded on the time axis;
/// `feature_lens` carries each utterance's true frame count.
pub struct Batch {
    pub features: Tensor,
    pub feature_lens: Vec<usize>,
    pub labels: Vec<Vec<u32>>,
}

/// One split of the dataset (train or eval)
pub struct SpeechDataset {
    entries: Vec<Utterance>,
    sample_rate: u32,
    max_duration_s: f32,
    shuffle: bool,
}

impl SpeechDataset {
    /// Load a split from its transcript list files.
    ///
    /// Relative audio paths are resolved against each list file's directory.
    pub fn from_lists(list_paths: &[String], config: &DatasetConfig, sample_rate: u32) -> Result<Self> {
        if list_paths.is_empty() {
            return Err(Error::Data("no transcript list files given".to_string()));
        }
        let mut entries = Vec::new();
        for list in list_paths {
            let list = Path::new(list);
            let contents = std::fs::read_to_string(list).map_err(|e| {
                Error::Data(format!("cannot read transcript list {}: {}", list.display(), e))
            })?;
            let base = list.parent().unwrap_or_else(|| Path::new("."));
            for (lineno, line) in contents.lines().enumerate() {
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let (audio, transcript) = line.split_once('\t').ok_or_else(|| {
                    Error::Data(format!(
                        "{}:{}: expected audio_path<TAB>transcript",
                        list.display(),
                        lineno + 1
                    ))
                })?;
                let audio = Path::new(audio);
                let audio = if audio.is_absolute() {
                    audio.to_path_buf()
                } else {
                    base.join(audio)
                };
                entries.push(Utterance {
                    audio,
                    transcript: transcript.to_string(),
                });
            }
        }
        if entries.is_empty() {
            return Err(Error::Data("transcript lists contain no utterances".to_string()));
        }
        tracing::info!(utterances = entries.len(), "Loaded transcript lists");
        Ok(Self {
            entries,
            sample_rate,
            max_duration_s: config.max_duration_s,
            shuffle: config.shuffle,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate the split in batches, shuffling first when configured.
    pub fn batches<'a>(
        &'a mut self,
        batch_size: usize,
        speech: &'a SpeechFeaturizer,
        text: &'a TextFeaturizer,
        device: &'a Device,
    ) -> BatchIter<'a> {
        if self.shuffle {
            self.entries.shuffle(&mut rand::thread_rng());
        }
        BatchIter {
            entries: &self.entries,
            pos: 0,
            batch_size,
            sample_rate: self.sample_rate,
            max_duration_s: self.max_duration_s,
            speech,
            text,
            device,
        }
    }
}

pub struct BatchIter<'a> {
    entries: &'a [Utterance],
    pos: usize,
    batch_size: usize,
    sample_rate: u32,
    max_duration_s: f32,
    speech: &'a SpeechFeaturizer,
    text: &'a TextFeaturizer,
    device: &'a Device,
}

impl BatchIter<'_> {
    /// Load and featurize one utterance; `None` drops it (over-long)
    fn featurize(&self, entry: &Utterance) -> Result<Option<(Vec<f32>, usize, Vec<u32>)>> {
        let signal = read_raw_audio(&entry.audio, self.sample_rate)?;
        if self.max_duration_s > 0.0 {
            let duration = signal.len() as f32 / self.sample_rate as f32;
            if duration > self.max_duration_s {
                tracing::warn!(
                    audio = %entry.audio.display(),
                    duration,
                    "Dropping over-long utterance"
                );
                return Ok(None);
            }
        }
        let features = self.speech.extract(&signal)?;
        let frames = features.dim().0;
        let labels = self.text.encode(&entry.transcript)?;
        Ok(Some((features.iter().copied().collect(), frames, labels)))
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let (bins, channels) = self.speech.compute_feature_dim();
        let mut flats: Vec<Vec<f32>> = Vec::with_capacity(self.batch_size);
        let mut feature_lens = Vec::with_capacity(self.batch_size);
        let mut labels = Vec::with_capacity(self.batch_size);

        while flats.len() < self.batch_size && self.pos < self.entries.len() {
            let entry = &self.entries[self.pos];
            self.pos += 1;
            if let Some((flat, frames, ids)) = self.featurize(entry)? {
                flats.push(flat);
                feature_lens.push(frames);
                labels.push(ids);
            }
        }
        if flats.is_empty() {
            return Ok(None);
        }

        let t_max = *feature_lens.iter().max().unwrap_or(&0);
        let frame_elems = bins * channels;
        let mut padded = vec![0f32; flats.len() * t_max * frame_elems];
        for (i, flat) in flats.iter().enumerate() {
            let dst = i * t_max * frame_elems;
            padded[dst..dst + flat.len()].copy_from_slice(flat);
        }
        let features = Tensor::from_vec(
            padded,
            (flats.len(), t_max, bins, channels),
            self.device,
        )?;

        Ok(Some(Batch {
            features,
            feature_lens,
            labels,
        }))
    }
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use ctc_asr_config::{DecoderConfig, SpeechConfig};

    fn write_wav(path: &Path, seconds: f32, rate: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let samples = (seconds * rate as f32) as usize;
        for i in 0..samples {
            let v = ((i as f32 * 0.03).sin() * 8000.0) as i16;
            writer.write_sample(v).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn fixtures(dir: &Path) -> (String, SpeechFeaturizer, TextFeaturizer) {
        write_wav(&dir.join("one.wav"), 0.3, 8000);
        write_wav(&dir.join("two.wav"), 0.5, 8000);
        let list = dir.join("train.tsv");
        let mut file = std::fs::File::create(&list).unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "one.wav\tab").unwrap();
        writeln!(file, "two.wav\tba").unwrap();

        let speech = SpeechFeaturizer::new(&SpeechConfig {
            sample_rate: 8000,
            num_feature_bins: 8,
            ..Default::default()
        });
        let text = TextFeaturizer::from_tokens(
            vec!["a".to_string(), "b".to_string()],
            DecoderConfig::default(),
        )
        .unwrap();
        (list.display().to_string(), speech, text)
    }

    fn config(shuffle: bool, max_duration_s: f32) -> DatasetConfig {
        DatasetConfig {
            shuffle,
            max_duration_s,
            ..Default::default()
        }
    }

    #[test]
    fn test_batching_pads_and_keeps_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let (list, speech, text) = fixtures(dir.path());
        let mut dataset =
            SpeechDataset::from_lists(&[list], &config(false, 20.0), 8000).unwrap();
        assert_eq!(dataset.len(), 2);

        let device = Device::Cpu;
        let batches: Vec<Batch> = dataset
            .batches(2, &speech, &text, &device)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 1);

        let batch = &batches[0];
        let (b, t, bins, ch) = batch.features.dims4().unwrap();
        assert_eq!((b, bins, ch), (2, 8, 1));
        // Padded to the longer utterance
        assert_eq!(t, *batch.feature_lens.iter().max().unwrap());
        assert!(batch.feature_lens[0] < batch.feature_lens[1]);
        assert_eq!(batch.labels[0], vec![1, 2]);
        assert_eq!(batch.labels[1], vec![2, 1]);
    }

    #[test]
    fn test_max_duration_filter_drops() {
        let dir = tempfile::tempdir().unwrap();
        let (list, speech, text) = fixtures(dir.path());
        // 0.4s cutoff keeps one.wav (0.3s), drops two.wav (0.5s)
        let mut dataset =
            SpeechDataset::from_lists(&[list], &config(false, 0.4), 8000).unwrap();
        let device = Device::Cpu;
        let batches: Vec<Batch> = dataset
            .batches(4, &speech, &text, &device)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].labels.len(), 1);
    }

    #[test]
    fn test_malformed_line_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("bad.tsv");
        std::fs::write(&list, "no_tab_here\n").unwrap();
        let result =
            SpeechDataset::from_lists(&[list.display().to_string()], &config(false, 20.0), 8000);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_lists_rejected() {
        assert!(SpeechDataset::from_lists(&[], &config(false, 20.0), 8000).is_err());
    }
}
