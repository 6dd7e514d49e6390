//! Exact running per-channel aggregates
//!
//! - activation count: strictly positive activations over every position of
//!   every processed context (exact)
//! - max activation: running maximum, floored at zero (exact)
//! - histogram: positive activation values from every `interval`-th batch
//!   only, optionally capped by a uniform reservoir

use anyhow::Result;
use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::trace::ActivationTrace;

/// Sampled activation values for one channel
#[derive(Debug, Clone, Default)]
pub struct HistogramSample {
    values: Vec<f32>,
    capacity: Option<usize>,
    /// Values offered so far, kept or not
    offered: u64,
}

impl HistogramSample {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            values: Vec::new(),
            capacity,
            offered: 0,
        }
    }

    /// Offer one value. Without a capacity it is always appended; with one,
    /// Algorithm R keeps a uniform sample of everything offered.
    pub fn offer(&mut self, value: f32, rng: &mut StdRng) {
        self.offered += 1;
        match self.capacity {
            None => self.values.push(value),
            Some(cap) if self.values.len() < cap => self.values.push(value),
            Some(cap) => {
                let slot = rng.gen_range(0..self.offered);
                if slot < cap as u64 {
                    self.values[slot as usize] = value;
                }
            }
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn offered(&self) -> u64 {
        self.offered
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }
}

/// Running aggregates for every channel
#[derive(Debug)]
pub struct ChannelAggregates {
    activation_counts: Vec<u64>,
    max_activations: Vec<f32>,
    histograms: Vec<HistogramSample>,
    interval: u64,
    batches_seen: u64,
    rng: StdRng,
}

impl ChannelAggregates {
    pub fn new(n_channels: usize, interval: u64, capacity: Option<usize>, seed: u64) -> Self {
        Self {
            activation_counts: vec![0; n_channels],
            max_activations: vec![0.0; n_channels],
            histograms: vec![HistogramSample::new(capacity); n_channels],
            interval,
            batches_seen: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn n_channels(&self) -> usize {
        self.activation_counts.len()
    }

    pub fn activation_count(&self, channel: usize) -> u64 {
        self.activation_counts[channel]
    }

    pub fn max_activation(&self, channel: usize) -> f32 {
        self.max_activations[channel]
    }

    pub fn histogram(&self, channel: usize) -> &HistogramSample {
        &self.histograms[channel]
    }

    pub fn batches_seen(&self) -> u64 {
        self.batches_seen
    }

    /// Whether the next batch contributes to the histograms
    pub fn collects_histogram(&self) -> bool {
        self.batches_seen % self.interval == 0
    }

    /// Fold one batch into the aggregates.
    ///
    /// `activations` is the `[batch, position, channel]` tensor and `trace`
    /// its host copy.
    pub fn update(&mut self, activations: &Tensor, trace: &ActivationTrace) -> Result<()> {
        let acts = activations.to_dtype(DType::F32)?;

        let counts: Vec<u32> = acts
            .gt(0f32)?
            .to_dtype(DType::U32)?
            .sum((0, 1))?
            .to_vec1()?;
        for (total, n) in self.activation_counts.iter_mut().zip(counts) {
            *total += u64::from(n);
        }

        let batch_max: Vec<f32> = acts.max(1)?.max(0)?.to_vec1()?;
        for (running, m) in self.max_activations.iter_mut().zip(batch_max) {
            *running = running.max(m);
        }

        if self.collects_histogram() {
            for (channel, histogram) in self.histograms.iter_mut().enumerate() {
                for item in 0..trace.n_items() {
                    for &v in trace.channel(item, channel) {
                        if v > 0.0 {
                            histogram.offer(v, &mut self.rng);
                        }
                    }
                }
            }
        }

        self.batches_seen += 1;
        Ok(())
    }

    /// Consume into `(counts, maxima, histograms)`
    pub fn into_parts(self) -> (Vec<u64>, Vec<f32>, Vec<Vec<f32>>) {
        let histograms = self
            .histograms
            .into_iter()
            .map(HistogramSample::into_values)
            .collect();
        (self.activation_counts, self.max_activations, histograms)
    }
}
