//! Featurization over a real WAV file, end to end

use std::path::Path;

use ctc_asr_config::{DecoderConfig, SpeechConfig};
use ctc_asr_core::read_raw_audio;
use ctc_asr_features::{SpeechFeaturizer, TextFeaturizer};

fn write_wav(path: &Path, samples: usize, rate: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..samples {
        let v = ((i as f32 * 0.02).sin() * 12000.0) as i16;
        writer.write_sample(v).unwrap();
    }
    writer.finalize().unwrap();
}

#[test]
fn wav_to_features() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("tone.wav");
    write_wav(&wav, 8000, 16000);

    let config = SpeechConfig::default();
    let featurizer = SpeechFeaturizer::new(&config);

    let signal = read_raw_audio(&wav, config.sample_rate).unwrap();
    assert_eq!(signal.len(), 8000);

    let features = featurizer.extract(&signal).unwrap();
    let (t, bins, channels) = features.dim();
    assert_eq!(t, featurizer.num_frames(signal.len()));
    assert_eq!((bins, channels), featurizer.compute_feature_dim());
    assert!(features.iter().all(|v| v.is_finite()));
}

#[test]
fn wav_resampled_to_target_rate() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("tone44k.wav");
    write_wav(&wav, 44100, 44100);

    // One second at 44.1 kHz lands close to 16000 samples after resampling
    let signal = read_raw_audio(&wav, 16000).unwrap();
    let drift = (signal.len() as i64 - 16000).abs();
    assert!(drift < 160, "resampled to {} samples", signal.len());
}

#[test]
fn vocabulary_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let vocab = dir.path().join("vocabulary.txt");
    std::fs::write(&vocab, "# characters\n \na\nb\n").unwrap();

    let config = DecoderConfig {
        vocabulary: vocab.display().to_string(),
        ..Default::default()
    };
    let text = TextFeaturizer::new(&config).unwrap();
    assert_eq!(text.num_classes(), 4);

    let ids = text.encode("ab a").unwrap();
    assert_eq!(text.decode(&ids), "ab a");
}
