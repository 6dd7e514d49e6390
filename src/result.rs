//! Finalized per-channel sampling results

use serde::{Deserialize, Serialize};

use crate::reservoir::Candidate;

/// One retained context for a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopSample {
    pub weight: f32,
    pub priority_key: f64,
    /// Context token ids
    pub context: Vec<u32>,
    /// The channel's activation at each context position
    pub activations: Vec<f32>,
}

impl From<Candidate> for TopSample {
    fn from(candidate: Candidate) -> Self {
        Self {
            weight: candidate.weight,
            priority_key: candidate.priority_key,
            context: candidate.context.to_vec(),
            activations: candidate.activations,
        }
    }
}

/// Everything recorded for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelResult {
    /// Strictly positive activations seen across the whole pass
    pub activation_count: u64,
    pub max_activation: f32,
    /// Positive activation values sampled every Kth batch
    pub histogram: Vec<f32>,
    /// Retained contexts, highest priority first
    pub top_samples: Vec<TopSample>,
}

/// Immutable output of a sampling pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub n_samples: usize,
    pub context_size: usize,
    pub channels: Vec<ChannelResult>,
}

impl ResultSet {
    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&ChannelResult> {
        self.channels.get(index)
    }

    /// Channels that activated at least once
    pub fn nonzero_channels(&self) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.max_activation > 0.0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Channels that never activated
    pub fn dead_channels(&self) -> usize {
        self.channels.len() - self.nonzero_channels().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn channel(max_activation: f32) -> ChannelResult {
        ChannelResult {
            activation_count: u64::from(max_activation > 0.0),
            max_activation,
            histogram: vec![],
            top_samples: vec![],
        }
    }

    #[test]
    fn test_nonzero_channels() {
        let result = ResultSet {
            n_samples: 2,
            context_size: 4,
            channels: vec![channel(0.0), channel(1.5), channel(0.0), channel(0.2)],
        };
        assert_eq!(result.n_channels(), 4);
        assert_eq!(result.nonzero_channels(), vec![1, 3]);
        assert_eq!(result.dead_channels(), 2);
        assert!(result.channel(4).is_none());
    }

    #[test]
    fn test_top_sample_from_candidate() {
        let candidate = Candidate {
            weight: 2.0,
            priority_key: -0.1,
            sequence: 7,
            context: Arc::from(vec![10, 11]),
            activations: vec![0.0, 2.0],
        };
        let sample = TopSample::from(candidate);
        assert_eq!(sample.context, vec![10, 11]);
        assert_eq!(sample.activations, vec![0.0, 2.0]);
        assert_eq!(sample.weight, 2.0);
    }
}
