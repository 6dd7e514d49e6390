//! On-disk result sets
//!
//! A result set is a directory holding a JSON manifest and MessagePack
//! shards, each shard a contiguous range of channels:
//!
//! ```text
//! top_activations/
//!   manifest.json
//!   shard-00000-of-00004.msgpack
//!   ...
//! ```
//!
//! The manifest is written last, so a directory without one is incomplete.
//! Result sets are immutable: saving into a non-empty directory fails.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::result::{ChannelResult, ResultSet};

pub const MANIFEST_FILE: &str = "manifest.json";
const FORMAT_VERSION: u32 = 1;

/// Where each channel range lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub file: String,
    /// First channel in the shard
    pub start: usize,
    /// One past the last channel
    pub end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub n_channels: usize,
    pub n_samples: usize,
    pub context_size: usize,
    pub shards: Vec<ShardInfo>,
}

#[derive(Serialize, Deserialize)]
struct Shard {
    start: usize,
    channels: Vec<ChannelResult>,
}

/// Channel ranges for splitting `n_channels` over at most `n_shards` shards
fn shard_ranges(n_channels: usize, n_shards: usize) -> Vec<(usize, usize)> {
    let n_shards = n_shards.clamp(1, n_channels.max(1));
    let per_shard = n_channels.div_ceil(n_shards).max(1);
    (0..n_channels)
        .step_by(per_shard)
        .map(|start| (start, (start + per_shard).min(n_channels)))
        .collect()
}

/// Write a result set to `path` as `n_shards` shards (fewer if there are fewer channels)
pub fn save(result: &ResultSet, path: impl AsRef<Path>, n_shards: usize) -> Result<Manifest> {
    let path = path.as_ref();
    if path.exists() {
        let occupied = std::fs::read_dir(path)
            .with_context(|| format!("Failed to inspect {}", path.display()))?
            .next()
            .is_some();
        anyhow::ensure!(
            !occupied,
            "Refusing to overwrite existing result set at {}",
            path.display()
        );
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let ranges = shard_ranges(result.n_channels(), n_shards);
    let total = ranges.len();
    let mut shards = Vec::with_capacity(total);
    for (i, &(start, end)) in ranges.iter().enumerate() {
        let file = format!("shard-{i:05}-of-{total:05}.msgpack");
        let shard = Shard {
            start,
            channels: result.channels[start..end].to_vec(),
        };
        let bytes = rmp_serde::to_vec_named(&shard)
            .with_context(|| format!("Failed to encode shard {file}"))?;
        std::fs::write(path.join(&file), bytes)
            .with_context(|| format!("Failed to write shard {file}"))?;
        shards.push(ShardInfo { file, start, end });
    }

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        n_channels: result.n_channels(),
        n_samples: result.n_samples,
        context_size: result.context_size,
        shards,
    };
    std::fs::write(
        path.join(MANIFEST_FILE),
        serde_json::to_string_pretty(&manifest)?,
    )?;
    info!(
        "Saved {} channels in {} shards to {}",
        manifest.n_channels,
        total,
        path.display()
    );
    Ok(manifest)
}

/// Read only the manifest of a stored result set
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Manifest> {
    let path = path.as_ref().join(MANIFEST_FILE);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    anyhow::ensure!(
        manifest.format_version == FORMAT_VERSION,
        "Unsupported result set format version {}",
        manifest.format_version
    );
    Ok(manifest)
}

/// Load a stored result set
pub fn load(path: impl AsRef<Path>) -> Result<ResultSet> {
    let path = path.as_ref();
    let manifest = load_manifest(path)?;

    let mut channels = Vec::with_capacity(manifest.n_channels);
    for info in &manifest.shards {
        anyhow::ensure!(
            info.start == channels.len(),
            "Shard {} starts at channel {}, expected {}",
            info.file,
            info.start,
            channels.len()
        );
        let expected = info.end.checked_sub(info.start).with_context(|| {
            format!(
                "Shard {} has end {} before start {}",
                info.file, info.end, info.start
            )
        })?;
        let bytes = std::fs::read(path.join(&info.file))
            .with_context(|| format!("Failed to read shard {}", info.file))?;
        let shard: Shard = rmp_serde::from_slice(&bytes)
            .with_context(|| format!("Failed to decode shard {}", info.file))?;
        anyhow::ensure!(
            shard.start == info.start && shard.channels.len() == expected,
            "Shard {} holds channels {}..{}, manifest says {}..{}",
            info.file,
            shard.start,
            shard.start + shard.channels.len(),
            info.start,
            info.end
        );
        channels.extend(shard.channels);
    }
    anyhow::ensure!(
        channels.len() == manifest.n_channels,
        "Result set has {} channels, manifest says {}",
        channels.len(),
        manifest.n_channels
    );

    Ok(ResultSet {
        n_samples: manifest.n_samples,
        context_size: manifest.context_size,
        channels,
    })
}
