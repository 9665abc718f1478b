//! CTC loss as a differentiable log-space forward recursion
//!
//! Written entirely in tensor ops so the autodiff graph carries the backward
//! pass; no hand-written gradient. Probabilities use a large negative
//! constant instead of `-inf` so `exp` never produces NaN under
//! differentiation.

use candle_core::Tensor;

use ctc_asr_core::{Error, Result};

/// Stand-in for log(0). Large enough to never win a max, small enough that
/// sums of a few of these stay finite in f32.
const LOG_ZERO: f32 = -1e30;

/// Elementwise log(exp(a) + exp(b)), stable around LOG_ZERO
fn logaddexp(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    let m = a.maximum(b)?;
    let sum = ((a - &m)?.exp()? + (b - &m)?.exp()?)?;
    sum.log()? + m
}

/// Number of frames a label sequence needs at minimum: one per token plus
/// one blank between each adjacent repeat
fn min_input_len(labels: &[u32]) -> usize {
    let repeats = labels.windows(2).filter(|w| w[0] == w[1]).count();
    labels.len() + repeats
}

/// Negative log-likelihood of `labels` under `log_probs` for one utterance.
///
/// `log_probs` is `[T, num_classes]`, already log-softmaxed over classes.
/// Returns a scalar tensor attached to the autodiff graph.
pub fn ctc_loss(log_probs: &Tensor, labels: &[u32], blank: u32) -> Result<Tensor> {
    let (time, _classes) = log_probs.dims2()?;
    if min_input_len(labels) > time {
        return Err(Error::Data(format!(
            "label sequence of length {} needs more than the {} available frames",
            labels.len(),
            time
        )));
    }
    let device = log_probs.device();

    // Extended label sequence: blanks interleaved around every token
    let ext_len = 2 * labels.len() + 1;
    let mut ext = Vec::with_capacity(ext_len);
    ext.push(blank);
    for &l in labels {
        ext.push(l);
        ext.push(blank);
    }
    let ext_ids = Tensor::from_vec(ext.clone(), ext_len, device)?;

    // Additive mask: the s-2 transition is allowed only onto a non-blank
    // that differs from the label two positions back
    let skip_mask: Vec<f32> = (0..ext_len)
        .map(|s| {
            if s >= 2 && ext[s] != blank && ext[s] != ext[s - 2] {
                0.0
            } else {
                LOG_ZERO
            }
        })
        .collect();
    let skip_mask = Tensor::from_vec(skip_mask, ext_len, device)?;

    let emission = |t: usize| -> candle_core::Result<Tensor> {
        // index_select needs a contiguous slice; callers may pass views
        log_probs
            .narrow(0, t, 1)?
            .contiguous()?
            .index_select(&ext_ids, 1)?
            .squeeze(0)
    };

    let mut init = vec![LOG_ZERO; ext_len];
    init[0] = 0.0;
    if ext_len > 1 {
        init[1] = 0.0;
    }
    let init = Tensor::from_vec(init, ext_len, device)?;
    let mut alpha = (init + emission(0)?)?;

    let pad1 = Tensor::full(LOG_ZERO, 1, device)?;
    let pad2 = Tensor::full(LOG_ZERO, 2.min(ext_len), device)?;

    for t in 1..time {
        let stay = &alpha;
        let step = Tensor::cat(&[&pad1, &alpha.narrow(0, 0, ext_len - 1)?], 0)?;
        let mut next = logaddexp(stay, &step)?;
        if ext_len > 2 {
            let skip = Tensor::cat(&[&pad2, &alpha.narrow(0, 0, ext_len - 2)?], 0)?;
            next = logaddexp(&next, &(skip + &skip_mask)?)?;
        }
        alpha = (next + emission(t)?)?;
    }

    // Valid endings: the final token or the trailing blank
    let tail = alpha.narrow(0, ext_len - 1, 1)?;
    let log_lik = if ext_len > 1 {
        let before = alpha.narrow(0, ext_len - 2, 1)?;
        logaddexp(&tail, &before)?
    } else {
        tail
    };
    Ok(log_lik.squeeze(0)?.neg()?)
}

/// Mean CTC loss over a batch.
///
/// `log_probs` is `[B, T, num_classes]`; `input_lens[i]` gives the valid
/// frame count of utterance `i` (padding frames beyond it are ignored).
pub fn ctc_loss_batch(
    log_probs: &Tensor,
    labels: &[Vec<u32>],
    input_lens: &[usize],
    blank: u32,
) -> Result<Tensor> {
    let (batch, time, _classes) = log_probs.dims3()?;
    if labels.len() != batch || input_lens.len() != batch {
        return Err(Error::Data(format!(
            "batch size mismatch: {} utterances, {} label sequences, {} lengths",
            batch,
            labels.len(),
            input_lens.len()
        )));
    }

    let mut losses = Vec::with_capacity(batch);
    for i in 0..batch {
        let len = input_lens[i].min(time);
        let lp = log_probs.narrow(0, i, 1)?.squeeze(0)?.narrow(0, 0, len)?;
        losses.push(ctc_loss(&lp, &labels[i], blank)?);
    }
    Ok(Tensor::stack(&losses, 0)?.mean(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    /// Uniform log-probabilities over all classes
    fn uniform(time: usize, classes: usize, device: &Device) -> Tensor {
        let lp = (1.0 / classes as f32).ln();
        Tensor::full(lp, (time, classes), device).unwrap()
    }

    #[test]
    fn test_uniform_single_label() {
        // T=2, 3 classes, label [1], blank 0. Paths collapsing to the label:
        // (1,0), (0,1), (1,1), each 1/9, so the loss is ln(3).
        let lp = uniform(2, 3, &Device::Cpu);
        let loss = ctc_loss(&lp, &[1], 0).unwrap();
        let loss = loss.to_scalar::<f32>().unwrap();
        assert!((loss - 3f32.ln()).abs() < 1e-4, "got {loss}");
    }

    #[test]
    fn test_uniform_two_labels() {
        // T=2, label [1, 2]: the only path is (1, 2), so the loss is ln(9)
        let lp = uniform(2, 3, &Device::Cpu);
        let loss = ctc_loss(&lp, &[1, 2], 0).unwrap();
        let loss = loss.to_scalar::<f32>().unwrap();
        assert!((loss - 9f32.ln()).abs() < 1e-4, "got {loss}");
    }

    #[test]
    fn test_empty_label_is_all_blanks() {
        // With no labels the only valid path is all blanks
        let lp = uniform(3, 3, &Device::Cpu);
        let loss = ctc_loss(&lp, &[], 0).unwrap();
        let loss = loss.to_scalar::<f32>().unwrap();
        assert!((loss - 3.0 * 3f32.ln()).abs() < 1e-4, "got {loss}");
    }

    #[test]
    fn test_accepts_non_contiguous_views() {
        // Broadcast views are not contiguous; the loss must handle them
        let device = Device::Cpu;
        let row = Tensor::full((1f32 / 3.0).ln(), (1, 3), &device).unwrap();
        let lp = row.broadcast_as((2, 3)).unwrap();
        let loss = ctc_loss(&lp, &[1], 0).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - 3f32.ln()).abs() < 1e-4, "got {loss}");
    }

    #[test]
    fn test_label_longer_than_input_rejected() {
        let lp = uniform(2, 3, &Device::Cpu);
        assert!(ctc_loss(&lp, &[1, 2, 1], 0).is_err());
        // Adjacent repeats need an intervening blank frame
        assert!(ctc_loss(&lp, &[1, 1], 0).is_err());
    }

    #[test]
    fn test_batch_mean_and_padding() {
        let device = Device::Cpu;
        let lp = uniform(4, 3, &device).unsqueeze(0).unwrap();
        let lp = Tensor::cat(&[&lp, &lp], 0).unwrap();
        // Second utterance only uses 2 of the 4 frames
        let loss = ctc_loss_batch(&lp, &[vec![1], vec![1]], &[4, 2], 0).unwrap();
        let single_short = ctc_loss(&uniform(2, 3, &device), &[1], 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let single_long = ctc_loss(&uniform(4, 3, &device), &[1], 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let expected = (single_short + single_long) / 2.0;
        let loss = loss.to_scalar::<f32>().unwrap();
        assert!((loss - expected).abs() < 1e-4, "got {loss}, want {expected}");
    }

    #[test]
    fn test_gradient_flows_to_logits() {
        let device = Device::Cpu;
        let logits = Var::randn(0f32, 1f32, (4, 3), &device).unwrap();
        let lp = candle_nn::ops::log_softmax(logits.as_tensor(), 1).unwrap();
        let loss = ctc_loss(&lp, &[1, 2], 0).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());
        let grads = loss.backward().unwrap();
        let g = grads.get(logits.as_tensor()).expect("gradient for logits");
        let norm = g.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(norm > 0.0 && norm.is_finite());
    }
}
