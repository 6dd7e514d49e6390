//! Host copy of one batch's activations
//!
//! Stored as a single flat buffer laid out `[item][channel][position]`, so a
//! channel's per-position trace for one context is a contiguous slice.

use anyhow::Result;
use candle_core::{DType, Tensor};

/// One batch of activations on the host
#[derive(Debug, Clone)]
pub struct ActivationTrace {
    data: Vec<f32>,
    n_items: usize,
    n_channels: usize,
    n_positions: usize,
}

impl ActivationTrace {
    /// Copy a `[batch, position, channel]` tensor to the host. NaN is rejected.
    pub fn from_tensor(activations: &Tensor) -> Result<Self> {
        let (n_items, n_positions, n_channels) = activations.dims3()?;
        let data: Vec<f32> = activations
            .to_dtype(DType::F32)?
            .transpose(1, 2)?
            .contiguous()?
            .flatten_all()?
            .to_vec1()?;
        anyhow::ensure!(
            !data.iter().any(|v| v.is_nan()),
            "Activation trace contains NaN"
        );
        Ok(Self {
            data,
            n_items,
            n_channels,
            n_positions,
        })
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    pub fn n_positions(&self) -> usize {
        self.n_positions
    }

    /// Activation of `channel` at every position of context `item`
    pub fn channel(&self, item: usize, channel: usize) -> &[f32] {
        let start = (item * self.n_channels + channel) * self.n_positions;
        &self.data[start..start + self.n_positions]
    }
}
