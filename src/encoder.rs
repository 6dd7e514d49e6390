//! Sparse encoder for turning hook-point activations into feature activations
//!
//! Loads sparse autoencoder / transcoder encoder weights from a safetensors
//! file (local or on the HuggingFace hub) and encodes hidden states:
//!
//! ```text
//! features = ReLU((hidden - b_dec) @ W_enc^T + b_enc)
//! ```
//!
//! # Weight File Layout
//!
//! - `W_enc`: shape `[n_features, d_model]` (F32/F16/BF16)
//! - `b_enc`: shape `[n_features]`
//! - `b_dec`: shape `[d_model]`, optional; subtracted from the input first

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;
use hf_hub::{api::sync::Api, Repo, RepoType};
use safetensors::tensor::SafeTensors;
use tracing::info;

/// Encoder half of a sparse dictionary
#[derive(Debug, Clone)]
pub struct SparseEncoder {
    linear: Linear,
    b_dec: Option<Tensor>,
    n_features: usize,
    d_model: usize,
}

impl SparseEncoder {
    /// Build an encoder from its weights. All tensors are converted to F32.
    pub fn new(w_enc: Tensor, b_enc: Tensor, b_dec: Option<Tensor>) -> Result<Self> {
        let (n_features, d_model) = w_enc
            .dims2()
            .context("W_enc must be [n_features, d_model]")?;
        anyhow::ensure!(
            b_enc.dims() == [n_features],
            "b_enc has shape {:?}, expected [{n_features}]",
            b_enc.dims()
        );
        if let Some(ref b_dec) = b_dec {
            anyhow::ensure!(
                b_dec.dims() == [d_model],
                "b_dec has shape {:?}, expected [{d_model}]",
                b_dec.dims()
            );
        }
        let b_dec = b_dec.map(|t| t.to_dtype(DType::F32)).transpose()?;
        let linear = Linear::new(w_enc.to_dtype(DType::F32)?, Some(b_enc.to_dtype(DType::F32)?));
        Ok(Self {
            linear,
            b_dec,
            n_features,
            d_model,
        })
    }

    /// Load encoder weights from a local safetensors file
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read encoder file {}", path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to deserialize encoder file {}", path.display()))?;

        let w_enc = tensor_from_view(&st.tensor("W_enc").context("Tensor 'W_enc' not found")?, device)?;
        let b_enc = tensor_from_view(&st.tensor("b_enc").context("Tensor 'b_enc' not found")?, device)?;
        let b_dec = match st.tensor("b_dec") {
            Ok(view) => Some(tensor_from_view(&view, device)?),
            Err(_) => None,
        };

        let encoder = Self::new(w_enc, b_enc, b_dec)?;
        info!(
            "Sparse encoder: {} features, d_model={} ({})",
            encoder.n_features,
            encoder.d_model,
            path.display()
        );
        Ok(encoder)
    }

    /// Download an encoder file from the HuggingFace hub and load it
    ///
    /// # Arguments
    /// * `repo_id` - HuggingFace repository ID
    /// * `filename` - Safetensors file within the repository
    pub fn from_hub(repo_id: &str, filename: &str, device: &Device) -> Result<Self> {
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));
        info!("Downloading {filename} from {repo_id}");
        let path = repo
            .get(filename)
            .with_context(|| format!("Failed to download {filename}"))?;
        Self::load(path, device)
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// Encode hidden states of shape `[..., d_model]` into `[..., n_features]`
    pub fn encode(&self, hidden: &Tensor) -> Result<Tensor> {
        let hidden = hidden.to_dtype(DType::F32)?;
        let hidden = match self.b_dec {
            Some(ref b_dec) => hidden.broadcast_sub(b_dec)?,
            None => hidden,
        };
        Ok(self.linear.forward(&hidden)?.relu()?)
    }
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
pub(crate) fn tensor_from_view(
    view: &safetensors::tensor::TensorView<'_>,
    device: &Device,
) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = float_dtype(view.dtype())?;
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor)
}

/// Candle dtype for a floating-point safetensors dtype
pub(crate) fn float_dtype(dtype: safetensors::Dtype) -> Result<DType> {
    Ok(match dtype {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!("Unsupported tensor dtype: {other:?}"),
    })
}
