//! `ctc-asr` binary: train an acoustic model or transcribe a WAV file

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use ctc_asr_config::{load_settings, ObservabilityConfig, Settings};
use ctc_asr_core::read_raw_audio;
use ctc_asr_features::{SpeechFeaturizer, TextFeaturizer};
use ctc_asr_model::DeepSpeech2;
use ctc_asr_train::{export_model, CheckpointManager, PrecisionPolicy, SpeechDataset, TrainSession};

const DEFAULT_CONFIG: &str = "config/default.yaml";

#[derive(Parser)]
#[command(name = "ctc-asr", about = "DeepSpeech2 CTC training and transcription", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the acoustic model
    Train {
        /// Override configuration YAML, layered over the defaults
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Export the trained model to this path after the run
        #[arg(short, long)]
        export: Option<PathBuf>,

        /// Train with f16 parameters
        #[arg(long)]
        mixed_precision: bool,

        /// Export weights only, without the architecture manifest
        #[arg(long)]
        save_weights: bool,

        /// Override the configured checkpoint retention count
        #[arg(long)]
        max_ckpts: Option<usize>,

        /// Override the configured eval batch multiplier
        #[arg(long)]
        eval_train_ratio: Option<usize>,
    },
    /// Transcribe a WAV file with a trained model
    Transcribe {
        /// Override configuration YAML, layered over the defaults
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Checkpoint or exported weights to load; defaults to the latest
        /// checkpoint in the configured directory
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Decode with beam search instead of greedy argmax
        #[arg(long)]
        beam: bool,

        /// Rescore the beam with the configured language model
        #[arg(long)]
        lm: bool,

        /// Input WAV file
        wav: PathBuf,
    },
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&observability.log_level));
    if observability.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load(config: Option<&Path>) -> anyhow::Result<Settings> {
    let settings = load_settings(DEFAULT_CONFIG, config)
        .context("failed to load configuration")?;
    Ok(settings)
}

fn run_train(
    config: Option<PathBuf>,
    export: Option<PathBuf>,
    mixed_precision: bool,
    save_weights: bool,
    max_ckpts: Option<usize>,
    eval_train_ratio: Option<usize>,
) -> anyhow::Result<()> {
    let mut settings = load(config.as_deref())?;
    if let Some(max_ckpts) = max_ckpts {
        settings.learning.running.max_ckpts = max_ckpts;
    }
    if let Some(ratio) = eval_train_ratio {
        settings.learning.running.eval_train_ratio = ratio;
    }
    settings.validate().context("invalid configuration")?;
    init_tracing(&settings.observability);

    let precision = if mixed_precision {
        PrecisionPolicy::MixedFloat16
    } else {
        PrecisionPolicy::Float32
    };

    let dataset = &settings.learning.dataset;
    let mut train = SpeechDataset::from_lists(
        &dataset.train_paths,
        dataset,
        settings.speech.sample_rate,
    )
    .context("failed to load training data")?;
    let mut eval = if dataset.eval_paths.is_empty() {
        None
    } else {
        Some(
            SpeechDataset::from_lists(
                &dataset.eval_paths,
                dataset,
                settings.speech.sample_rate,
            )
            .context("failed to load evaluation data")?,
        )
    };

    let mut session = TrainSession::new(&settings, precision)?;
    session.fit(&mut train, eval.as_mut())?;

    if let Some(path) = export {
        export_model(session.varmap(), session.model(), &path, save_weights)?;
    }
    Ok(())
}

fn run_transcribe(
    config: Option<PathBuf>,
    checkpoint: Option<PathBuf>,
    beam: bool,
    lm: bool,
    wav: PathBuf,
) -> anyhow::Result<()> {
    let settings = load(config.as_deref())?;
    init_tracing(&settings.observability);

    if lm {
        bail!("--lm needs an external scorer binding, which this build does not carry");
    }

    let speech = SpeechFeaturizer::new(&settings.speech);
    let text = TextFeaturizer::new(&settings.decoder)?;

    let device = Device::Cpu;
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = DeepSpeech2::new(
        &settings.model,
        speech.compute_feature_dim(),
        text.num_classes(),
        vb,
    )?;

    match checkpoint {
        Some(path) => varmap
            .load(&path)
            .with_context(|| format!("failed to load weights from {}", path.display()))?,
        None => {
            let running = &settings.learning.running;
            let manager = CheckpointManager::new(&running.checkpoint_dir, running.max_ckpts)?;
            if manager.restore(&mut varmap)?.is_none() {
                bail!(
                    "no checkpoint found in {}; pass --checkpoint",
                    running.checkpoint_dir
                );
            }
        }
    }

    let signal = read_raw_audio(&wav, settings.speech.sample_rate)
        .with_context(|| format!("failed to read {}", wav.display()))?;
    let features = speech.extract(&signal)?;
    let (t, bins, channels) = features.dim();
    let flat: Vec<f32> = features.iter().copied().collect();
    let batch = Tensor::from_vec(flat, (1, t, bins, channels), &device)?;

    let hypothesis = if beam {
        model.recognize_beam(&batch, &text, false)?.remove(0)
    } else {
        model.recognize(&batch, &text)?.remove(0)
    };

    println!("{}", hypothesis.text);
    println!("score: {:.4}", hypothesis.score);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Train {
            config,
            export,
            mixed_precision,
            save_weights,
            max_ckpts,
            eval_train_ratio,
        } => run_train(
            config,
            export,
            mixed_precision,
            save_weights,
            max_ckpts,
            eval_train_ratio,
        ),
        Command::Transcribe {
            config,
            checkpoint,
            beam,
            lm,
            wav,
        } => run_transcribe(config, checkpoint, beam, lm, wav),
    }
}
