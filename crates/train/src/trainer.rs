//! CTC training session
//!
//! `TrainSession` owns everything a run needs: device, precision policy,
//! model parameters, AdamW optimizer and the checkpoint manager. Any step
//! error aborts the run and propagates through the error taxonomy.

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use ctc_asr_config::Settings;
use ctc_asr_core::Result;
use ctc_asr_features::{SpeechFeaturizer, TextFeaturizer};
use ctc_asr_model::{ctc_loss_batch, DeepSpeech2};

use crate::checkpoint::CheckpointManager;
use crate::dataset::{Batch, SpeechDataset};

/// Parameter dtype policy for a training run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecisionPolicy {
    #[default]
    Float32,
    MixedFloat16,
}

impl PrecisionPolicy {
    pub fn dtype(&self) -> DType {
        match self {
            PrecisionPolicy::Float32 => DType::F32,
            PrecisionPolicy::MixedFloat16 => DType::F16,
        }
    }
}

/// Mean CTC loss of one batch. The loss is always computed in f32, also
/// under the f16 parameter policy.
fn batch_loss(
    model: &DeepSpeech2,
    text: &TextFeaturizer,
    batch: &Batch,
    features: &Tensor,
    training: bool,
) -> Result<Tensor> {
    let log_probs = model.forward_log_probs(features, training)?.to_dtype(DType::F32)?;
    let output_lens: Vec<usize> = batch
        .feature_lens
        .iter()
        .map(|&t| model.output_time_len(t))
        .collect();
    ctc_loss_batch(&log_probs, &batch.labels, &output_lens, text.blank())
}

pub struct TrainSession {
    device: Device,
    varmap: VarMap,
    model: DeepSpeech2,
    optimizer: AdamW,
    checkpoints: CheckpointManager,
    speech: SpeechFeaturizer,
    text: TextFeaturizer,
    settings: Settings,
    start_epoch: usize,
    global_step: usize,
}

impl TrainSession {
    /// Initialize a session: build featurizers and model, dry-run the
    /// forward shapes, then resume from the latest checkpoint when one
    /// exists.
    pub fn new(settings: &Settings, precision: PrecisionPolicy) -> Result<Self> {
        let device = Device::Cpu;
        let speech = SpeechFeaturizer::new(&settings.speech);
        let text = TextFeaturizer::new(&settings.decoder)?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, precision.dtype(), &device);
        let model = DeepSpeech2::new(
            &settings.model,
            speech.compute_feature_dim(),
            text.num_classes(),
            vb,
        )?;
        // Shapes fixed against one second of audio before any data flows
        model.validate_build(1, speech.num_frames(settings.speech.sample_rate as usize))?;

        let running = &settings.learning.running;
        let checkpoints = CheckpointManager::new(&running.checkpoint_dir, running.max_ckpts)?;
        let start_epoch = checkpoints.restore(&mut varmap)?.unwrap_or(0);

        let opt = &settings.learning.optimizer;
        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: opt.learning_rate,
                beta1: opt.beta1,
                beta2: opt.beta2,
                eps: opt.epsilon,
                weight_decay: opt.weight_decay,
            },
        )?;

        tracing::info!(
            precision = ?precision,
            start_epoch,
            num_epochs = running.num_epochs,
            "Training session initialized"
        );

        Ok(Self {
            device,
            varmap,
            model,
            optimizer,
            checkpoints,
            speech,
            text,
            settings: settings.clone(),
            start_epoch,
            global_step: 0,
        })
    }

    pub fn model(&self) -> &DeepSpeech2 {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn speech_featurizer(&self) -> &SpeechFeaturizer {
        &self.speech
    }

    pub fn text_featurizer(&self) -> &TextFeaturizer {
        &self.text
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run the configured number of epochs over `train`, evaluating on
    /// `eval` after each epoch and checkpointing.
    pub fn fit(&mut self, train: &mut SpeechDataset, mut eval: Option<&mut SpeechDataset>) -> Result<()> {
        let running = self.settings.learning.running.clone();
        let noise_std = self.settings.learning.augmentations.noise_std;

        for epoch in self.start_epoch..running.num_epochs {
            let mut epoch_loss = 0f32;
            let mut steps = 0usize;

            let Self {
                ref device,
                ref model,
                ref mut optimizer,
                ref speech,
                ref text,
                ref mut global_step,
                ..
            } = *self;

            for batch in train.batches(running.batch_size, speech, text, device) {
                let batch = batch?;
                let features = if noise_std > 0.0 {
                    let noise =
                        Tensor::randn(0f32, noise_std, batch.features.shape(), device)?;
                    (&batch.features + noise)?
                } else {
                    batch.features.clone()
                };
                let loss = batch_loss(model, text, &batch, &features, true)?;
                optimizer.backward_step(&loss)?;

                let loss = loss.to_scalar::<f32>()?;
                epoch_loss += loss;
                steps += 1;
                *global_step += 1;
                if *global_step % running.log_interval == 0 {
                    tracing::info!(epoch = epoch + 1, step = *global_step, loss, "Train step");
                }
            }

            let mean_train = if steps > 0 { epoch_loss / steps as f32 } else { f32::NAN };
            tracing::info!(epoch = epoch + 1, mean_loss = mean_train, "Epoch finished");

            if let Some(eval) = eval.as_deref_mut() {
                let eval_loss =
                    self.evaluate(eval, running.batch_size * running.eval_train_ratio)?;
                tracing::info!(epoch = epoch + 1, eval_loss, "Evaluation finished");
            }

            self.checkpoints.save(&self.varmap, epoch + 1)?;
        }
        Ok(())
    }

    /// Mean CTC loss over one pass of `dataset`, without weight updates
    pub fn evaluate(&self, dataset: &mut SpeechDataset, batch_size: usize) -> Result<f32> {
        let mut total = 0f32;
        let mut steps = 0usize;
        for batch in dataset.batches(batch_size, &self.speech, &self.text, &self.device) {
            let batch = batch?;
            let loss = batch_loss(&self.model, &self.text, &batch, &batch.features, false)?;
            total += loss.to_scalar::<f32>()?;
            steps += 1;
        }
        if steps == 0 {
            return Ok(f32::NAN);
        }
        Ok(total / steps as f32)
    }
}
