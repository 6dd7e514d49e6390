//! Activation producers: token batches in, `[batch, position, channel]` out

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::{info, warn};

use crate::encoder::{float_dtype, SparseEncoder};
use crate::source::TokenBatch;

/// Maps a token batch to per-channel activation strengths
pub trait ActivationProducer {
    /// Number of channels in every produced trace
    fn n_channels(&self) -> usize;

    /// Activation trace of shape `[batch, position, channel]` read at `hook_point`
    fn compute_activations(&self, batch: &TokenBatch, hook_point: &str) -> Result<Tensor>;
}

/// Producer backed by a closure
pub struct FnProducer<F> {
    n_channels: usize,
    f: F,
}

impl<F> FnProducer<F>
where
    F: Fn(&TokenBatch, &str) -> Result<Tensor>,
{
    pub fn new(n_channels: usize, f: F) -> Self {
        Self { n_channels, f }
    }
}

impl<F> ActivationProducer for FnProducer<F>
where
    F: Fn(&TokenBatch, &str) -> Result<Tensor>,
{
    fn n_channels(&self) -> usize {
        self.n_channels
    }

    fn compute_activations(&self, batch: &TokenBatch, hook_point: &str) -> Result<Tensor> {
        (self.f)(batch, hook_point)
    }
}

/// Header size cap, same as the safetensors crate
const MAX_HEADER_SIZE: u64 = 100_000_000;

/// Only the `__metadata__` table of a safetensors header is read here
#[derive(Deserialize)]
struct DumpHeader {
    #[serde(rename = "__metadata__", default)]
    metadata: HashMap<String, String>,
}

fn read_dump_metadata(path: &Path) -> Result<HashMap<String, String>> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut len = [0u8; 8];
    file.read_exact(&mut len)
        .with_context(|| format!("Failed to read header length of {}", path.display()))?;
    let len = u64::from_le_bytes(len);
    anyhow::ensure!(
        len <= MAX_HEADER_SIZE,
        "Header of {} is {len} bytes, larger than {MAX_HEADER_SIZE}",
        path.display()
    );
    let mut header = vec![0u8; usize::try_from(len)?];
    file.read_exact(&mut header)
        .with_context(|| format!("Truncated header in {}", path.display()))?;
    let header: DumpHeader = serde_json::from_slice(&header)
        .with_context(|| format!("Failed to parse header of {}", path.display()))?;
    Ok(header.metadata)
}

/// Hidden states captured at the hook point, encoded on demand.
///
/// The dump is a safetensors file holding `hidden_states` of shape
/// `[n_contexts, context_size, d_model]`, row `i` aligned with context `i` of
/// the token stream. It is memory-mapped and only the rows of the current
/// batch are copied out. Two optional entries guard the alignment:
///
/// - `__metadata__["hook_point"]`: the hook point the states were captured at
/// - `tokens`: `[n_contexts, context_size]` token ids (U32 or I64)
pub struct EncodedHiddenStates {
    dump: MmapedSafetensors,
    dtype: DType,
    n_contexts: usize,
    context_size: usize,
    d_model: usize,
    hook_point: Option<String>,
    token_dtype: Option<DType>,
    encoder: SparseEncoder,
    device: Device,
}

impl EncodedHiddenStates {
    pub const TENSOR_NAME: &'static str = "hidden_states";
    pub const TOKENS_NAME: &'static str = "tokens";
    pub const HOOK_POINT_KEY: &'static str = "hook_point";

    /// Memory-map the hidden-state dump
    pub fn load(path: impl AsRef<Path>, encoder: SparseEncoder, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let metadata = read_dump_metadata(path)?;
        // The file must not change while mapped
        let dump = unsafe { MmapedSafetensors::new(path) }
            .with_context(|| format!("Failed to map hidden states {}", path.display()))?;

        let view = dump
            .get(Self::TENSOR_NAME)
            .with_context(|| format!("Tensor '{}' not found", Self::TENSOR_NAME))?;
        let (n_contexts, context_size, d_model) = match *view.shape() {
            [n, ctx, d] => (n, ctx, d),
            ref other => anyhow::bail!(
                "hidden_states has shape {other:?}, expected [n_contexts, context_size, d_model]"
            ),
        };
        let dtype = float_dtype(view.dtype())?;
        anyhow::ensure!(
            d_model == encoder.d_model(),
            "Hidden size {d_model} does not match encoder d_model {}",
            encoder.d_model()
        );

        let token_dtype = match dump.get(Self::TOKENS_NAME) {
            Ok(tokens) => {
                anyhow::ensure!(
                    tokens.shape() == [n_contexts, context_size],
                    "tokens has shape {:?}, expected [{n_contexts}, {context_size}]",
                    tokens.shape()
                );
                Some(match tokens.dtype() {
                    safetensors::Dtype::U32 => DType::U32,
                    safetensors::Dtype::I64 => DType::I64,
                    other => anyhow::bail!("Unsupported token dtype: {other:?}"),
                })
            }
            Err(_) => {
                warn!(
                    "No '{}' tensor in {}; batch alignment is unchecked",
                    Self::TOKENS_NAME,
                    path.display()
                );
                None
            }
        };

        let hook_point = metadata.get(Self::HOOK_POINT_KEY).cloned();
        if hook_point.is_none() {
            warn!("No hook point recorded in {}", path.display());
        }

        info!(
            "Hidden states: [{n_contexts}, {context_size}, {d_model}] {dtype:?} from {} (hook point {})",
            path.display(),
            hook_point.as_deref().unwrap_or("unknown")
        );
        Ok(Self {
            dump,
            dtype,
            n_contexts,
            context_size,
            d_model,
            hook_point,
            token_dtype,
            encoder,
            device: device.clone(),
        })
    }

    pub fn n_contexts(&self) -> usize {
        self.n_contexts
    }

    /// Hook point recorded in the dump, if any
    pub fn hook_point(&self) -> Option<&str> {
        self.hook_point.as_deref()
    }

    /// Compare the batch's token ids with the ids recorded next to the states
    fn check_tokens(&self, batch: &TokenBatch, dtype: DType) -> Result<()> {
        let view = self.dump.get(Self::TOKENS_NAME)?;
        let row_bytes = self.context_size * dtype.size_in_bytes();
        let start = batch.offset() * row_bytes;
        let rows = &view.data()[start..start + batch.len() * row_bytes];
        let recorded = Tensor::from_raw_buffer(
            rows,
            dtype,
            &[batch.len(), self.context_size],
            &Device::Cpu,
        )?
        .to_dtype(DType::U32)?;
        let mismatches = recorded
            .ne(&batch.to_tensor(&Device::Cpu)?)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()?;
        anyhow::ensure!(
            mismatches == 0,
            "Batch tokens at contexts {}..{} differ from the dumped tokens at {mismatches} positions",
            batch.offset(),
            batch.offset() + batch.len()
        );
        Ok(())
    }
}

impl ActivationProducer for EncodedHiddenStates {
    fn n_channels(&self) -> usize {
        self.encoder.n_features()
    }

    fn compute_activations(&self, batch: &TokenBatch, hook_point: &str) -> Result<Tensor> {
        if let Some(ref recorded) = self.hook_point {
            anyhow::ensure!(
                recorded == hook_point,
                "Hidden states were captured at '{recorded}', not '{hook_point}'"
            );
        }
        let end = batch.offset() + batch.len();
        anyhow::ensure!(
            end <= self.n_contexts,
            "Batch covers contexts {}..{end} but only {} hidden states were dumped",
            batch.offset(),
            self.n_contexts
        );
        anyhow::ensure!(
            batch.context_size() == self.context_size,
            "Batch context size {} does not match dumped context size {}",
            batch.context_size(),
            self.context_size
        );
        if let Some(dtype) = self.token_dtype {
            self.check_tokens(batch, dtype)?;
        }

        let view = self.dump.get(Self::TENSOR_NAME)?;
        let row_bytes = self.context_size * self.d_model * self.dtype.size_in_bytes();
        let rows = &view.data()[batch.offset() * row_bytes..end * row_bytes];
        let hidden = Tensor::from_raw_buffer(
            rows,
            self.dtype,
            &[batch.len(), self.context_size, self.d_model],
            &self.device,
        )?;
        self.encoder.encode(&hidden)
    }
}
