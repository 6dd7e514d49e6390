//! Priority transform: per-(context, channel) weights and sampling keys
//!
//! Each context's weight for a channel is its peak rectified activation
//! raised to the sampling exponent:
//!
//! ```text
//! weight[i, c] = max_p( relu(act[i, p, c]) ) ^ exponent
//! key[i, c]    = ln(u[i, c]) / weight[i, c]       u ~ Uniform(0, 1]
//! ```
//!
//! Keeping the N largest keys over a stream is Efraimidis–Spirakis weighted
//! sampling without replacement (`u^(1/w)`, in log space). A zero weight maps
//! to `-inf` and the context is never eligible for that channel. With sampling
//! disabled the key is the weight itself, so selection is top-N by weight.

use anyhow::Result;
use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Weights and keys for one batch, row-major `[item, channel]`
#[derive(Debug, Clone)]
pub struct BatchPriorities {
    n_items: usize,
    n_channels: usize,
    weights: Vec<f32>,
    keys: Vec<f64>,
}

impl BatchPriorities {
    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    pub fn weight(&self, item: usize, channel: usize) -> f32 {
        self.weights[item * self.n_channels + channel]
    }

    pub fn key(&self, item: usize, channel: usize) -> f64 {
        self.keys[item * self.n_channels + channel]
    }

    /// Whether the context can ever be selected for the channel
    pub fn is_eligible(&self, item: usize, channel: usize) -> bool {
        self.key(item, channel) > f64::NEG_INFINITY
    }
}

/// Turns activation traces into sampling priorities
#[derive(Debug)]
pub struct PriorityTransform {
    exponent: f32,
    enable_sampling: bool,
    rng: StdRng,
}

impl PriorityTransform {
    pub fn new(exponent: f32, enable_sampling: bool, seed: u64) -> Self {
        Self {
            exponent,
            enable_sampling,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Per-context weights from a `[batch, position, channel]` trace.
    ///
    /// Returns `[batch, channel]` as a tensor in F32.
    pub fn weights(&self, activations: &Tensor) -> Result<Tensor> {
        let acts = activations.to_dtype(DType::F32)?;
        let weights = acts
            .relu()?
            .powf(f64::from(self.exponent))?
            .max(1)?;
        Ok(weights)
    }

    /// Compute weights and keys for one batch.
    ///
    /// In sampling mode one uniform is drawn per `(item, channel)` in
    /// row-major order whether or not the weight is zero, so the draw
    /// sequence depends only on how many items have been seen.
    pub fn compute(&mut self, activations: &Tensor) -> Result<BatchPriorities> {
        let (n_items, _, n_channels) = activations.dims3()?;
        let weights: Vec<f32> = self.weights(activations)?.flatten_all()?.to_vec1()?;

        if let Some((idx, w)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            anyhow::bail!(
                "Invalid sample weight {w} for item {} channel {}",
                idx / n_channels,
                idx % n_channels
            );
        }

        let keys: Vec<f64> = if self.enable_sampling {
            weights
                .iter()
                .map(|&w| {
                    // gen() is in [0, 1); flip to (0, 1] so ln() stays finite
                    let u: f64 = 1.0 - self.rng.gen::<f64>();
                    if w == 0.0 {
                        f64::NEG_INFINITY
                    } else {
                        u.ln() / f64::from(w)
                    }
                })
                .collect()
        } else {
            weights
                .iter()
                .map(|&w| {
                    if w == 0.0 {
                        f64::NEG_INFINITY
                    } else {
                        f64::from(w)
                    }
                })
                .collect()
        };

        Ok(BatchPriorities {
            n_items,
            n_channels,
            weights,
            keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn trace(data: Vec<f32>, shape: (usize, usize, usize)) -> Tensor {
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_weight_is_peak_rectified_power() {
        // 1 item, 3 positions, 2 channels
        let acts = trace(vec![1.0, -4.0, 3.0, -1.0, 2.0, 0.0], (1, 3, 2));
        let mut transform = PriorityTransform::new(2.0, false, 0);
        let p = transform.compute(&acts).unwrap();

        assert_eq!(p.n_items(), 1);
        assert_eq!(p.n_channels(), 2);
        assert!((p.weight(0, 0) - 9.0).abs() < 1e-5);
        assert_eq!(p.weight(0, 1), 0.0);
    }

    #[test]
    fn test_deterministic_key_is_weight() {
        let acts = trace(vec![2.0, 0.5], (2, 1, 1));
        let mut transform = PriorityTransform::new(1.0, false, 0);
        let p = transform.compute(&acts).unwrap();
        assert_eq!(p.key(0, 0), 2.0);
        assert_eq!(p.key(1, 0), 0.5);
    }

    #[test]
    fn test_zero_weight_never_eligible() {
        let acts = trace(vec![0.0, -1.0, 0.7, 0.0], (2, 1, 2));
        for sampling in [true, false] {
            let mut transform = PriorityTransform::new(1.0, sampling, 7);
            let p = transform.compute(&acts).unwrap();
            assert!(!p.is_eligible(0, 0));
            assert!(!p.is_eligible(0, 1));
            assert!(p.is_eligible(1, 0));
            assert_eq!(p.key(1, 1), f64::NEG_INFINITY);
        }
    }

    #[test]
    fn test_sampling_keys_are_non_positive() {
        let acts = trace(vec![0.3, 1.5, 4.0, 0.01], (4, 1, 1));
        let mut transform = PriorityTransform::new(1.0, true, 1);
        let p = transform.compute(&acts).unwrap();
        for item in 0..4 {
            let key = p.key(item, 0);
            assert!(key.is_finite());
            assert!(key <= 0.0);
        }
    }

    #[test]
    fn test_same_seed_same_keys() {
        let acts = trace(vec![0.3, 1.5, 4.0, 0.01, 2.0, 2.0], (3, 1, 2));
        let mut a = PriorityTransform::new(1.0, true, 99);
        let mut b = PriorityTransform::new(1.0, true, 99);
        let pa = a.compute(&acts).unwrap();
        let pb = b.compute(&acts).unwrap();
        for item in 0..3 {
            for ch in 0..2 {
                assert_eq!(pa.key(item, ch).to_bits(), pb.key(item, ch).to_bits());
            }
        }
    }

    #[test]
    fn test_overflowing_weight_is_rejected() {
        let acts = trace(vec![f32::MAX], (1, 1, 1));
        let mut transform = PriorityTransform::new(2.0, true, 0);
        assert!(transform.compute(&acts).is_err());
    }
}
