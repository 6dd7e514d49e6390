//! Token batch sources for the sampling pass

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use serde::Deserialize;

/// A fixed-shape block of token contexts, `[batch, context_size]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    /// Stream index of the first context in this batch
    offset: usize,
    contexts: Vec<Vec<u32>>,
}

impl TokenBatch {
    /// Build a batch, rejecting empty or ragged contexts
    pub fn new(offset: usize, contexts: Vec<Vec<u32>>) -> Result<Self> {
        anyhow::ensure!(!contexts.is_empty(), "Token batch has no contexts");
        let context_size = contexts[0].len();
        anyhow::ensure!(context_size > 0, "Token batch has empty contexts");
        if let Some((i, row)) = contexts
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != context_size)
        {
            anyhow::bail!(
                "Context {i} has {} tokens, expected {context_size}",
                row.len()
            );
        }
        Ok(Self { offset, contexts })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of contexts
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn context_size(&self) -> usize {
        self.contexts[0].len()
    }

    /// Total tokens in the batch
    pub fn n_tokens(&self) -> u64 {
        (self.len() * self.context_size()) as u64
    }

    pub fn contexts(&self) -> &[Vec<u32>] {
        &self.contexts
    }

    /// Token ids as a `U32` tensor of shape `[batch, context_size]`
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<u32> = self.contexts.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(
            flat,
            (self.len(), self.context_size()),
            device,
        )?)
    }
}

/// Supplies token batches on demand
pub trait BatchSource {
    /// Next batch of at most `size` contexts, or `None` once exhausted
    fn next_batch(&mut self, size: usize) -> Result<Option<TokenBatch>>;
}

/// In-memory batch source over pre-built contexts
#[derive(Debug, Clone)]
pub struct VecSource {
    contexts: Vec<Vec<u32>>,
    cursor: usize,
}

impl VecSource {
    pub fn new(contexts: Vec<Vec<u32>>) -> Self {
        Self {
            contexts,
            cursor: 0,
        }
    }

    /// Contexts not yet handed out
    pub fn remaining(&self) -> usize {
        self.contexts.len() - self.cursor
    }
}

impl BatchSource for VecSource {
    fn next_batch(&mut self, size: usize) -> Result<Option<TokenBatch>> {
        if self.cursor >= self.contexts.len() || size == 0 {
            return Ok(None);
        }
        let end = (self.cursor + size).min(self.contexts.len());
        let batch = TokenBatch::new(self.cursor, self.contexts[self.cursor..end].to_vec())?;
        self.cursor = end;
        Ok(Some(batch))
    }
}

/// Raw JSON structure for loading
#[derive(Debug, Deserialize)]
struct CorpusFile {
    sequences: Vec<Vec<u32>>,
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
}

/// Pre-tokenized corpus split into consecutive non-overlapping context windows
#[derive(Debug, Clone)]
pub struct TokenCorpus {
    inner: VecSource,
    context_size: usize,
}

impl TokenCorpus {
    /// Load a corpus of token id sequences from JSON.
    ///
    /// Sequences are concatenated into one stream and cut into windows of
    /// `context_size` tokens; a trailing partial window is dropped.
    pub fn load(path: &str, context_size: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read token corpus {path}"))?;
        let file: CorpusFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse token corpus {path}"))?;
        Self::from_sequences(file.sequences, context_size)
    }

    pub fn from_sequences(sequences: Vec<Vec<u32>>, context_size: usize) -> Result<Self> {
        anyhow::ensure!(context_size > 0, "context_size must be positive");
        let stream: Vec<u32> = sequences.into_iter().flatten().collect();
        let contexts: Vec<Vec<u32>> = stream
            .chunks_exact(context_size)
            .map(<[u32]>::to_vec)
            .collect();
        Ok(Self {
            inner: VecSource::new(contexts),
            context_size,
        })
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    /// Contexts not yet handed out
    pub fn remaining_contexts(&self) -> usize {
        self.inner.remaining()
    }

    /// Tokens not yet handed out
    pub fn remaining_tokens(&self) -> u64 {
        (self.inner.remaining() * self.context_size) as u64
    }
}

impl BatchSource for TokenCorpus {
    fn next_batch(&mut self, size: usize) -> Result<Option<TokenBatch>> {
        self.inner.next_batch(size)
    }
}
