//! Per-channel bounded top-K reservoir
//!
//! Each channel keeps at most `capacity` candidates ordered by priority key
//! (descending). Merging a batch concatenates the retained entries with the
//! newly admitted candidates, sorts, and truncates, so after any prefix of the
//! stream a channel holds exactly the `capacity` highest-key candidates seen
//! so far. Equal keys are ordered by arrival sequence, earliest first.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::priority::BatchPriorities;
use crate::trace::ActivationTrace;

/// One context observed for a specific channel
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Peak rectified activation raised to the sampling exponent
    pub weight: f32,
    /// Sampling key; larger is kept first
    pub priority_key: f64,
    /// Global arrival index of the context in the stream
    pub sequence: u64,
    /// Context token ids, shared by every channel the context was kept for
    pub context: Arc<[u32]>,
    /// This channel's activation at each context position
    pub activations: Vec<f32>,
}

/// Descending by key, then ascending by arrival
fn priority_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.priority_key
        .total_cmp(&a.priority_key)
        .then(a.sequence.cmp(&b.sequence))
}

/// Bounded priority-ordered candidate sets, one per channel
#[derive(Debug, Clone)]
pub struct TopKReservoir {
    capacity: usize,
    channels: Vec<Vec<Candidate>>,
    candidates_seen: Vec<u64>,
}

impl TopKReservoir {
    pub fn new(n_channels: usize, capacity: usize) -> Self {
        Self {
            capacity,
            channels: vec![Vec::new(); n_channels],
            candidates_seen: vec![0; n_channels],
        }
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// Retained candidates for a channel, highest priority first
    pub fn entries(&self, channel: usize) -> &[Candidate] {
        &self.channels[channel]
    }

    /// Eligible (finite-key) candidates offered to a channel so far
    pub fn candidates_seen(&self, channel: usize) -> u64 {
        self.candidates_seen[channel]
    }

    /// Whether a key arriving now could survive the next truncation
    pub fn admits(&self, channel: usize, key: f64) -> bool {
        if key == f64::NEG_INFINITY || key.is_nan() {
            return false;
        }
        let entries = &self.channels[channel];
        if entries.len() < self.capacity {
            return true;
        }
        // A later arrival loses ties, so it must strictly beat the last entry
        entries.last().is_some_and(|last| key > last.priority_key)
    }

    /// Merge candidates into one channel: concatenate, sort, keep the top `capacity`.
    pub fn merge(&mut self, channel: usize, candidates: Vec<Candidate>) {
        if candidates.is_empty() {
            return;
        }
        let entries = &mut self.channels[channel];
        entries.extend(candidates);
        entries.sort_by(priority_order);
        entries.truncate(self.capacity);
    }

    /// Merge a whole batch.
    ///
    /// `contexts[i]` is item `i`'s token window and `trace.channel(i, c)` its
    /// per-position activations for channel `c`. Items receive arrival
    /// sequences starting at `first_sequence`. Traces are only copied for
    /// candidates that pass the channel's current admission threshold.
    pub fn merge_batch(
        &mut self,
        priorities: &BatchPriorities,
        contexts: &[Arc<[u32]>],
        trace: &ActivationTrace,
        first_sequence: u64,
    ) {
        for channel in 0..self.channels.len() {
            let mut admitted = Vec::new();
            for (item, context) in contexts.iter().enumerate() {
                if !priorities.is_eligible(item, channel) {
                    continue;
                }
                self.candidates_seen[channel] += 1;
                let key = priorities.key(item, channel);
                if !self.admits(channel, key) {
                    continue;
                }
                admitted.push(Candidate {
                    weight: priorities.weight(item, channel),
                    priority_key: key,
                    sequence: first_sequence + item as u64,
                    context: Arc::clone(context),
                    activations: trace.channel(item, channel).to_vec(),
                });
            }
            self.merge(channel, admitted);
        }
    }

    /// Consume the reservoir into per-channel candidate lists
    pub fn into_channels(self) -> Vec<Vec<Candidate>> {
        self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: f64, sequence: u64) -> Candidate {
        Candidate {
            weight: key as f32,
            priority_key: key,
            sequence,
            context: Arc::from(vec![sequence as u32]),
            activations: vec![key as f32],
        }
    }

    fn keys(reservoir: &TopKReservoir, channel: usize) -> Vec<f64> {
        reservoir
            .entries(channel)
            .iter()
            .map(|c| c.priority_key)
            .collect()
    }

    #[test]
    fn test_merge_keeps_top_k() {
        let mut reservoir = TopKReservoir::new(1, 3);
        reservoir.merge(0, vec![candidate(1.0, 0), candidate(5.0, 1)]);
        assert_eq!(keys(&reservoir, 0), vec![5.0, 1.0]);

        reservoir.merge(0, vec![candidate(3.0, 2), candidate(0.5, 3), candidate(4.0, 4)]);
        assert_eq!(keys(&reservoir, 0), vec![5.0, 4.0, 3.0]);
    }

    #[test]
    fn test_fewer_than_capacity_not_padded() {
        let mut reservoir = TopKReservoir::new(2, 4);
        reservoir.merge(1, vec![candidate(2.0, 0)]);
        assert_eq!(reservoir.entries(0).len(), 0);
        assert_eq!(reservoir.entries(1).len(), 1);
    }

    #[test]
    fn test_ties_prefer_earlier_arrival() {
        let mut reservoir = TopKReservoir::new(1, 2);
        reservoir.merge(0, vec![candidate(1.0, 5), candidate(1.0, 2)]);
        reservoir.merge(0, vec![candidate(1.0, 1), candidate(1.0, 9)]);
        let seqs: Vec<u64> = reservoir.entries(0).iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_admits_threshold() {
        let mut reservoir = TopKReservoir::new(1, 2);
        assert!(reservoir.admits(0, -100.0));
        assert!(!reservoir.admits(0, f64::NEG_INFINITY));

        reservoir.merge(0, vec![candidate(2.0, 0), candidate(3.0, 1)]);
        assert!(!reservoir.admits(0, 2.0));
        assert!(!reservoir.admits(0, 1.0));
        assert!(reservoir.admits(0, 2.5));
    }

    #[test]
    fn test_merge_order_independent_of_split() {
        let all: Vec<Candidate> = [0.4, 2.0, 1.1, 7.0, 2.0, 0.9, 3.3]
            .iter()
            .enumerate()
            .map(|(i, &k)| candidate(k, i as u64))
            .collect();

        let mut whole = TopKReservoir::new(1, 3);
        whole.merge(0, all.clone());

        let mut split = TopKReservoir::new(1, 3);
        split.merge(0, all[..4].to_vec());
        split.merge(0, all[4..].to_vec());

        assert_eq!(whole.entries(0), split.entries(0));
    }
}
