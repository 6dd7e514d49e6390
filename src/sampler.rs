//! Streaming feature activation sampler
//!
//! Pulls token batches until the token budget is met and threads each batch
//! through the priority transform, the per-channel top-K reservoir, and the
//! running aggregates. Nothing beyond the current batch, the reservoir, and
//! the aggregates is held in memory.
//!
//! Processing is strictly sequential with a single writer. Running out of
//! batches before the budget is met is fatal: there is no partial result.

use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Tensor;
use tracing::{debug, info};

use crate::aggregate::ChannelAggregates;
use crate::config::AnalysisConfig;
use crate::priority::PriorityTransform;
use crate::producer::ActivationProducer;
use crate::reservoir::TopKReservoir;
use crate::result::{ChannelResult, ResultSet, TopSample};
use crate::source::{BatchSource, TokenBatch};
use crate::trace::ActivationTrace;

/// Sampling state for one pass
#[derive(Debug)]
pub struct FeatureSampler {
    config: AnalysisConfig,
    priority: PriorityTransform,
    reservoir: TopKReservoir,
    aggregates: ChannelAggregates,
    n_tokens: u64,
    n_steps: u64,
    /// Arrival index of the next context
    next_sequence: u64,
}

impl FeatureSampler {
    pub fn new(config: &AnalysisConfig, n_channels: usize) -> Result<Self> {
        config.validate()?;
        anyhow::ensure!(n_channels > 0, "Sampler needs at least one channel");
        Ok(Self {
            priority: PriorityTransform::new(
                config.sample_weight_exponent,
                config.enable_sampling,
                config.seed,
            ),
            reservoir: TopKReservoir::new(n_channels, config.n_samples),
            aggregates: ChannelAggregates::new(
                n_channels,
                config.histogram_interval,
                config.histogram_capacity,
                config.seed.wrapping_add(1),
            ),
            config: config.clone(),
            n_tokens: 0,
            n_steps: 0,
            next_sequence: 0,
        })
    }

    pub fn n_channels(&self) -> usize {
        self.reservoir.n_channels()
    }

    /// Tokens processed so far (monotonic)
    pub fn tokens_processed(&self) -> u64 {
        self.n_tokens
    }

    pub fn steps(&self) -> u64 {
        self.n_steps
    }

    /// Whether the token budget has been met
    pub fn is_done(&self) -> bool {
        self.n_tokens >= self.config.total_analyzing_tokens
    }

    pub fn reservoir(&self) -> &TopKReservoir {
        &self.reservoir
    }

    pub fn aggregates(&self) -> &ChannelAggregates {
        &self.aggregates
    }

    /// Fold one batch and its `[batch, position, channel]` activations into the state
    pub fn process_batch(&mut self, batch: &TokenBatch, activations: &Tensor) -> Result<()> {
        let (n_items, n_positions, n_channels) = activations
            .dims3()
            .context("Activations must be [batch, position, channel]")?;
        anyhow::ensure!(
            n_items == batch.len() && n_positions == batch.context_size(),
            "Activations have shape {:?}, expected [{}, {}, {}]",
            activations.dims(),
            batch.len(),
            batch.context_size(),
            self.n_channels()
        );
        anyhow::ensure!(
            n_channels == self.n_channels(),
            "Activations have {n_channels} channels, sampler was built for {}",
            self.n_channels()
        );

        let trace = ActivationTrace::from_tensor(activations)?;
        let priorities = self.priority.compute(activations)?;
        let contexts: Vec<Arc<[u32]>> = batch
            .contexts()
            .iter()
            .map(|c| Arc::from(c.as_slice()))
            .collect();

        self.reservoir
            .merge_batch(&priorities, &contexts, &trace, self.next_sequence);
        self.aggregates.update(activations, &trace)?;

        self.next_sequence += n_items as u64;
        self.n_tokens += batch.n_tokens();
        self.n_steps += 1;
        debug!(
            "Step {}: {} tokens processed",
            self.n_steps, self.n_tokens
        );
        Ok(())
    }

    /// Package the reservoir and aggregates into an immutable result set
    pub fn finalize(self) -> ResultSet {
        let (counts, maxima, histograms) = self.aggregates.into_parts();
        let channels: Vec<ChannelResult> = self
            .reservoir
            .into_channels()
            .into_iter()
            .zip(counts)
            .zip(maxima)
            .zip(histograms)
            .map(
                |(((samples, activation_count), max_activation), histogram)| ChannelResult {
                    activation_count,
                    max_activation,
                    histogram,
                    top_samples: samples.into_iter().map(TopSample::from).collect(),
                },
            )
            .collect();

        let result = ResultSet {
            n_samples: self.config.n_samples,
            context_size: self.config.context_size,
            channels,
        };
        info!(
            "Sampling finished: {} steps, {} tokens, {} of {} channels active",
            self.n_steps,
            self.n_tokens,
            result.nonzero_channels().len(),
            result.n_channels()
        );
        result
    }
}

/// Run a full sampling pass.
///
/// Pulls `store_batch_size` contexts at a time from `source` until
/// `total_analyzing_tokens` have been processed; `progress` receives the
/// running token count after every batch.
pub fn sample_feature_activations<S, P>(
    source: &mut S,
    producer: &P,
    config: &AnalysisConfig,
    mut progress: impl FnMut(u64),
) -> Result<ResultSet>
where
    S: BatchSource + ?Sized,
    P: ActivationProducer + ?Sized,
{
    let mut sampler = FeatureSampler::new(config, producer.n_channels())?;

    info!("Total Analyzing Tokens: {}", config.total_analyzing_tokens);
    info!("Total Analyzing Steps: {}", config.total_analyzing_steps());

    while !sampler.is_done() {
        let batch = source
            .next_batch(config.store_batch_size)?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Not enough tokens to sample: source exhausted after {} of {} tokens",
                    sampler.tokens_processed(),
                    config.total_analyzing_tokens
                )
            })?;
        anyhow::ensure!(
            batch.context_size() == config.context_size,
            "Batch context size {} does not match configured context_size {}",
            batch.context_size(),
            config.context_size
        );

        let activations = producer
            .compute_activations(&batch, &config.hook_point)
            .with_context(|| format!("Failed to compute activations at step {}", sampler.steps()))?;
        sampler.process_batch(&batch, &activations)?;
        progress(sampler.tokens_processed());
    }

    Ok(sampler.finalize())
}
