//! DeepSpeech2 acoustic model
//!
//! Convolutional subsampling (conv2d + batch norm + clipped ReLU), a stack of
//! optionally bidirectional GRU layers, a fully-connected head and a linear
//! classifier producing per-timestep class logits.
//!
//! The GRU cell is written against owned weight matrices rather than an
//! opaque layer type so the quantized inference variant can reuse the exact
//! same gate math over quantized matmuls.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{
    batch_norm, linear, BatchNorm, BatchNormConfig, Dropout, Linear, Module, ModuleT, VarBuilder,
};

use ctc_asr_config::{ConvBlockConfig, ModelConfig};
use ctc_asr_core::{Error, Hypothesis, Result};
use ctc_asr_features::TextFeaturizer;

use crate::decode::{beam_search, greedy_decode};

/// Clipped ReLU used throughout the architecture
pub(crate) fn clipped_relu(x: &Tensor) -> candle_core::Result<Tensor> {
    x.relu()?.clamp(0f32, 20f32)
}

/// 2-D convolution with per-axis kernels and strides.
///
/// candle's conv2d helper is square-only; DeepSpeech2 kernels are not
/// (e.g. 11x41). Expressed as an accumulation of strided slices so the
/// operation stays differentiable. Zero padding keeps the output length at
/// ceil(len / stride) per axis.
pub(crate) fn conv2d_asym(
    x: &Tensor,
    weight: &Tensor,
    bias: &Tensor,
    strides: [usize; 2],
) -> candle_core::Result<Tensor> {
    let (_b, cin, t, f) = x.dims4()?;
    let (cout, _, kt, kf) = weight.dims4()?;
    let device = x.device();

    let pad_t = kt - 1;
    let pad_f = kf - 1;
    let x = x.pad_with_zeros(2, pad_t / 2, pad_t - pad_t / 2)?;
    let x = x.pad_with_zeros(3, pad_f / 2, pad_f - pad_f / 2)?;

    let t_out = (t + pad_t - kt) / strides[0] + 1;
    let f_out = (f + pad_f - kf) / strides[1] + 1;

    let mut acc: Option<Tensor> = None;
    for dt in 0..kt {
        let idx_t: Vec<u32> = (0..t_out).map(|i| (i * strides[0] + dt) as u32).collect();
        let idx_t = Tensor::from_vec(idx_t, t_out, device)?;
        let xt = x.index_select(&idx_t, 2)?;
        for df in 0..kf {
            let idx_f: Vec<u32> = (0..f_out).map(|i| (i * strides[1] + df) as u32).collect();
            let idx_f = Tensor::from_vec(idx_f, f_out, device)?;
            // [B, Cin, T_out, F_out]
            let patch = xt.index_select(&idx_f, 3)?;
            // [Cout, Cin]
            let w = weight.narrow(2, dt, 1)?.narrow(3, df, 1)?;
            let w = w.reshape((1, cout, cin, 1, 1))?;
            let contrib = patch.unsqueeze(1)?.broadcast_mul(&w)?.sum(2)?;
            acc = Some(match acc {
                Some(a) => (a + contrib)?,
                None => contrib,
            });
        }
    }
    let out = acc.expect("kernel has at least one tap");
    out.broadcast_add(&bias.reshape((1, cout, 1, 1))?)
}

/// Expected output length of one conv axis under `conv2d_asym` padding
pub(crate) fn conv_out_len(len: usize, stride: usize) -> usize {
    (len - 1) / stride + 1
}

/// Conv + batch norm + clipped ReLU block
struct ConvBlock {
    weight: Tensor,
    bias: Tensor,
    bn: BatchNorm,
    strides: [usize; 2],
}

impl ConvBlock {
    fn new(in_c: usize, config: &ConvBlockConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let weight = vb.get_with_hints(
            (config.filters, in_c, config.kernel[0], config.kernel[1]),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(config.filters, "bias", candle_nn::Init::Const(0.))?;
        let bn = batch_norm(config.filters, BatchNormConfig::default(), vb.pp("bn"))?;
        Ok(Self {
            weight,
            bias,
            bn,
            strides: config.strides,
        })
    }

    fn forward(&self, x: &Tensor, training: bool) -> candle_core::Result<Tensor> {
        let x = conv2d_asym(x, &self.weight, &self.bias, self.strides)?;
        let x = self.bn.forward_t(&x, training)?;
        clipped_relu(&x)
    }
}

/// Combine GRU gate pre-activations into the next hidden state.
///
/// `gi` = x W_ih^T + b_ih and `gh` = h W_hh^T + b_hh, both `[B, 3H]` with
/// gate order (reset, update, new). Shared with the quantized variant.
pub(crate) fn gru_combine(
    gi: &Tensor,
    gh: &Tensor,
    h: &Tensor,
    hidden: usize,
) -> candle_core::Result<Tensor> {
    let r = candle_nn::ops::sigmoid(&(gi.narrow(1, 0, hidden)? + gh.narrow(1, 0, hidden)?)?)?;
    let z = candle_nn::ops::sigmoid(
        &(gi.narrow(1, hidden, hidden)? + gh.narrow(1, hidden, hidden)?)?,
    )?;
    let n = (gi.narrow(1, 2 * hidden, hidden)?
        + r.mul(&gh.narrow(1, 2 * hidden, hidden)?)?)?
    .tanh()?;
    // h' = (1 - z) * n + z * h
    z.affine(-1.0, 1.0)?.mul(&n)? + z.mul(h)?
}

/// Single-direction GRU over a `[B, T, In]` sequence
struct Gru {
    w_ih: Tensor,
    w_hh: Tensor,
    b_ih: Tensor,
    b_hh: Tensor,
    hidden: usize,
}

impl Gru {
    fn new(in_dim: usize, hidden: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let w_ih = vb.get_with_hints(
            (3 * hidden, in_dim),
            "weight_ih",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let w_hh = vb.get_with_hints(
            (3 * hidden, hidden),
            "weight_hh",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let b_ih = vb.get_with_hints(3 * hidden, "bias_ih", candle_nn::Init::Const(0.))?;
        let b_hh = vb.get_with_hints(3 * hidden, "bias_hh", candle_nn::Init::Const(0.))?;
        Ok(Self {
            w_ih,
            w_hh,
            b_ih,
            b_hh,
            hidden,
        })
    }

    fn step(&self, x: &Tensor, h: &Tensor) -> candle_core::Result<Tensor> {
        let gi = x.matmul(&self.w_ih.t()?)?.broadcast_add(&self.b_ih)?;
        let gh = h.matmul(&self.w_hh.t()?)?.broadcast_add(&self.b_hh)?;
        gru_combine(&gi, &gh, h, self.hidden)
    }

    fn seq(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, _in) = x.dims3()?;
        let mut h = Tensor::zeros((b, self.hidden), x.dtype(), x.device())?;
        let mut outputs = Vec::with_capacity(t);
        for step in 0..t {
            let xt = x.narrow(1, step, 1)?.squeeze(1)?;
            h = self.step(&xt, &h)?;
            outputs.push(h.clone());
        }
        Tensor::stack(&outputs, 1)
    }
}

/// One recurrent layer, optionally bidirectional, with optional batch norm
/// over its output
struct GruLayer {
    fwd: Gru,
    bwd: Option<Gru>,
    bn: Option<BatchNorm>,
}

impl GruLayer {
    fn new(
        in_dim: usize,
        hidden: usize,
        bidirectional: bool,
        with_bn: bool,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let fwd = Gru::new(in_dim, hidden, vb.pp("fwd"))?;
        let bwd = if bidirectional {
            Some(Gru::new(in_dim, hidden, vb.pp("bwd"))?)
        } else {
            None
        };
        let dirs = if bidirectional { 2 } else { 1 };
        let bn = if with_bn {
            Some(batch_norm(hidden * dirs, BatchNormConfig::default(), vb.pp("bn"))?)
        } else {
            None
        };
        Ok(Self { fwd, bwd, bn })
    }

    fn forward(&self, x: &Tensor, training: bool) -> candle_core::Result<Tensor> {
        let fwd = self.fwd.seq(x)?;
        let out = match &self.bwd {
            None => fwd,
            Some(bwd) => {
                let reversed = reverse_time(x)?;
                let bwd_out = reverse_time(&bwd.seq(&reversed)?)?;
                Tensor::cat(&[&fwd, &bwd_out], 2)?
            }
        };
        match &self.bn {
            None => Ok(out),
            Some(bn) => {
                // [B, H, T] for the channel-major batch norm, then back
                let out = bn.forward_t(&out.transpose(1, 2)?, training)?;
                out.transpose(1, 2)
            }
        }
    }
}

/// Reverse the time axis of a `[B, T, ..]` tensor
pub(crate) fn reverse_time(x: &Tensor) -> candle_core::Result<Tensor> {
    let t = x.dim(1)?;
    let idx: Vec<u32> = (0..t as u32).rev().collect();
    x.index_select(&Tensor::from_vec(idx, t, x.device())?, 1)
}

/// DeepSpeech2 acoustic model.
///
/// Lifecycle: construction materializes parameters from the `VarBuilder`
/// (built); `validate_build` dry-runs a forward pass to fix and check shapes
/// before any data flows; decoding entry points never mutate model state.
pub struct DeepSpeech2 {
    conv_blocks: Vec<ConvBlock>,
    gru_layers: Vec<GruLayer>,
    fc: Option<Linear>,
    dropout: Dropout,
    classifier: Linear,
    config: ModelConfig,
    feature_dim: (usize, usize),
    num_classes: usize,
    device: Device,
    dtype: DType,
}

impl DeepSpeech2 {
    /// Build the model for features of shape `[time, bins, channels]` with
    /// `feature_dim = (bins, channels)`.
    pub fn new(
        config: &ModelConfig,
        feature_dim: (usize, usize),
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (bins, channels) = feature_dim;
        let device = vb.device().clone();
        let dtype = vb.dtype();

        let mut conv_blocks = Vec::with_capacity(config.conv_blocks.len());
        let mut in_c = channels;
        let mut freq = bins;
        for (i, block) in config.conv_blocks.iter().enumerate() {
            conv_blocks.push(
                ConvBlock::new(in_c, block, vb.pp(format!("conv_{i}")))
                    .map_err(|e| Error::ModelBuild(e.to_string()))?,
            );
            in_c = block.filters;
            freq = conv_out_len(freq, block.strides[1]);
        }

        let dirs = if config.rnn_bidirectional { 2 } else { 1 };
        let mut gru_layers = Vec::with_capacity(config.rnn_layers);
        let mut rnn_in = in_c * freq;
        for i in 0..config.rnn_layers {
            gru_layers.push(
                GruLayer::new(
                    rnn_in,
                    config.rnn_units,
                    config.rnn_bidirectional,
                    config.rnn_batch_norm,
                    vb.pp(format!("gru_{i}")),
                )
                .map_err(|e| Error::ModelBuild(e.to_string()))?,
            );
            rnn_in = config.rnn_units * dirs;
        }

        let (fc, head_dim) = if config.fc_units > 0 {
            let fc = linear(rnn_in, config.fc_units, vb.pp("fc"))
                .map_err(|e| Error::ModelBuild(e.to_string()))?;
            (Some(fc), config.fc_units)
        } else {
            (None, rnn_in)
        };

        let classifier = linear(head_dim, num_classes, vb.pp("classifier"))
            .map_err(|e| Error::ModelBuild(e.to_string()))?;

        tracing::info!(
            conv_blocks = config.conv_blocks.len(),
            rnn_layers = config.rnn_layers,
            rnn_units = config.rnn_units,
            bidirectional = config.rnn_bidirectional,
            num_classes,
            "Built DeepSpeech2"
        );

        Ok(Self {
            conv_blocks,
            gru_layers,
            fc,
            dropout: Dropout::new(config.dropout),
            classifier,
            config: config.clone(),
            feature_dim,
            num_classes,
            device,
            dtype,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn feature_dim(&self) -> (usize, usize) {
        self.feature_dim
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Factor by which the conv stack shortens the time axis
    pub fn time_reduction_factor(&self) -> usize {
        self.config.time_reduction_factor()
    }

    /// Output time length for an input of `time` frames
    pub fn output_time_len(&self, time: usize) -> usize {
        self.conv_blocks
            .iter()
            .fold(time, |t, b| conv_out_len(t, b.strides[0]))
    }

    /// Dry-run forward pass fixing and checking all parameter shapes.
    pub fn validate_build(&self, batch: usize, time: usize) -> Result<()> {
        let (bins, channels) = self.feature_dim;
        let input = Tensor::zeros((batch, time, bins, channels), DType::F32, &self.device)
            .map_err(|e| Error::ModelBuild(e.to_string()))?;
        let logits = self
            .forward(&input, false)
            .map_err(|e| Error::ModelBuild(format!("dry run failed: {e}")))?;

        let expected = (batch, self.output_time_len(time), self.num_classes);
        let got = logits.dims3().map_err(|e| Error::ModelBuild(e.to_string()))?;
        if got != expected {
            return Err(Error::ModelBuild(format!(
                "dry run produced {got:?}, expected {expected:?}"
            )));
        }
        Ok(())
    }

    /// Forward pass over `[B, T, bins, channels]` features, producing
    /// `[B, T', num_classes]` logits. `training` only toggles dropout and
    /// batch-norm mode.
    pub fn forward(&self, features: &Tensor, training: bool) -> Result<Tensor> {
        let features = if features.dtype() == self.dtype {
            features.clone()
        } else {
            features.to_dtype(self.dtype)?
        };

        // [B, C, T, F]
        let mut x = features.permute((0, 3, 1, 2))?;
        for block in &self.conv_blocks {
            x = block.forward(&x, training)?;
        }

        // [B, T', C * F]
        let (b, c, t, f) = x.dims4()?;
        let mut x = x.permute((0, 2, 1, 3))?.reshape((b, t, c * f))?;

        for layer in &self.gru_layers {
            x = layer.forward(&x, training)?;
        }

        if let Some(fc) = &self.fc {
            x = clipped_relu(&fc.forward(&x)?)?;
            x = self.dropout.forward(&x, training)?;
        }

        Ok(self.classifier.forward(&x)?)
    }

    /// Forward pass followed by a log-softmax over classes
    pub fn forward_log_probs(&self, features: &Tensor, training: bool) -> Result<Tensor> {
        let logits = self.forward(features, training)?;
        Ok(candle_nn::ops::log_softmax(&logits, D::Minus1)?)
    }

    /// Per-utterance frame log-probabilities as plain vectors, for decoding
    fn frame_log_probs(&self, features: &Tensor) -> Result<Vec<Vec<Vec<f32>>>> {
        let log_probs = self.forward_log_probs(features, false)?;
        Ok(log_probs.to_dtype(DType::F32)?.to_vec3::<f32>()?)
    }

    /// Greedy argmax decoding, one hypothesis per utterance.
    pub fn recognize(&self, features: &Tensor, text: &TextFeaturizer) -> Result<Vec<Hypothesis>> {
        let batches = self.frame_log_probs(features)?;
        Ok(batches
            .iter()
            .map(|frames| greedy_decode(frames, text))
            .collect())
    }

    /// Beam-search decoding, one hypothesis per utterance. With `lm` set, the
    /// attached scorer rescores the beam; decoding fails if none is attached.
    pub fn recognize_beam(
        &self,
        features: &Tensor,
        text: &TextFeaturizer,
        lm: bool,
    ) -> Result<Vec<Hypothesis>> {
        if lm && text.scorer().is_none() {
            return Err(Error::Decode(
                "lm rescoring requested but no scorer is attached".to_string(),
            ));
        }
        let batches = self.frame_log_probs(features)?;
        batches
            .iter()
            .map(|frames| beam_search(frames, text, lm))
            .collect()
    }

    pub(crate) fn conv_parts(&self) -> Vec<(&Tensor, &Tensor, &BatchNorm, [usize; 2])> {
        self.conv_blocks
            .iter()
            .map(|b| (&b.weight, &b.bias, &b.bn, b.strides))
            .collect()
    }

    pub(crate) fn gru_parts(&self) -> Vec<(&Tensor, &Tensor, &Tensor, &Tensor, bool)> {
        let mut parts = Vec::new();
        for layer in &self.gru_layers {
            parts.push((
                &layer.fwd.w_ih,
                &layer.fwd.w_hh,
                &layer.fwd.b_ih,
                &layer.fwd.b_hh,
                false,
            ));
            if let Some(bwd) = &layer.bwd {
                parts.push((&bwd.w_ih, &bwd.w_hh, &bwd.b_ih, &bwd.b_hh, true));
            }
        }
        parts
    }

    pub(crate) fn rnn_bn_parts(&self) -> Vec<Option<&BatchNorm>> {
        self.gru_layers.iter().map(|l| l.bn.as_ref()).collect()
    }

    pub(crate) fn fc_part(&self) -> Option<&Linear> {
        self.fc.as_ref()
    }

    pub(crate) fn classifier_part(&self) -> &Linear {
        &self.classifier
    }

    pub(crate) fn hidden_units(&self) -> usize {
        self.config.rnn_units
    }
}
