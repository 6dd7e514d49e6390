//! Read-side lookup of stored result sets
//!
//! Result sets live under `<result_dir>/<dictionary>/analysis/top_activations`.
//! Loaded sets are kept in a bounded LRU cache owned by the service.
//! Responses are MessagePack with named fields; context tokens are decoded
//! to raw bytes and encoded as msgpack `bin`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::{debug, info};

use crate::config::LookupConfig;
use crate::result::ResultSet;
use crate::store;
use crate::tokens::TokenDecoder;

/// Errors surfaced at the lookup boundary
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Feature index {0} is not a valid integer")]
    InvalidIndex(String),
    #[error("Feature index {0} is out of range")]
    OutOfRange(i64),
    #[error("Dictionary {0} has no active features")]
    NoActiveFeatures(String),
    #[error("Invalid dictionary name {0:?}")]
    InvalidName(String),
    #[error("Dictionary {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl LookupError {
    /// HTTP-style status for the error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidIndex(_)
            | Self::OutOfRange(_)
            | Self::NoActiveFeatures(_)
            | Self::InvalidName(_) => 400,
            Self::NotFound(_) => 404,
            Self::Internal(_) => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

/// Which feature a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureQuery {
    /// Any feature that activated at least once
    Random,
    Index(i64),
}

impl FeatureQuery {
    /// Parse `"random"` or an integer
    pub fn parse(raw: &str) -> Result<Self, LookupError> {
        if raw == "random" {
            return Ok(Self::Random);
        }
        raw.trim()
            .parse::<i64>()
            .map(Self::Index)
            .map_err(|_| LookupError::InvalidIndex(raw.to_string()))
    }
}

/// One retained context as served
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleView {
    /// Decoded bytes of each context token
    pub context: Vec<ByteBuf>,
    pub context_ids: Vec<u32>,
    pub feature_acts: Vec<f32>,
    pub weight: f32,
    pub priority_key: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureResponse {
    pub feature_index: usize,
    pub act_times: u64,
    pub max_feature_act: f32,
    pub samples: Vec<SampleView>,
}

impl FeatureResponse {
    pub fn to_msgpack(&self) -> anyhow::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_msgpack(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Least-recently-used cache of loaded result sets
#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    entries: HashMap<String, Arc<ResultSet>>,
    /// Front is least recently used
    order: VecDeque<String>,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn touch(&mut self, name: &str) {
        if let Some(pos) = self.order.iter().position(|n| n == name) {
            if let Some(n) = self.order.remove(pos) {
                self.order.push_back(n);
            }
        }
    }

    pub fn get(&mut self, name: &str) -> Option<Arc<ResultSet>> {
        let hit = self.entries.get(name).cloned()?;
        self.touch(name);
        Some(hit)
    }

    pub fn insert(&mut self, name: String, result: Arc<ResultSet>) {
        if self.entries.insert(name.clone(), result).is_some() {
            self.touch(&name);
            return;
        }
        self.order.push_back(name);
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(evicted) => {
                    debug!("Evicting result set {evicted}");
                    self.entries.remove(&evicted);
                }
                None => break,
            }
        }
    }
}

/// Serves per-feature queries over stored result sets
pub struct LookupService {
    config: LookupConfig,
    decoder: Box<dyn TokenDecoder>,
    cache: Mutex<ResultCache>,
    rng: Mutex<StdRng>,
}

impl LookupService {
    pub fn new(config: LookupConfig, decoder: Box<dyn TokenDecoder>) -> Self {
        Self {
            cache: Mutex::new(ResultCache::new(config.cache_capacity)),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            config,
            decoder,
        }
    }

    /// Directory holding a dictionary's stored result set
    pub fn result_path(&self, dictionary: &str) -> PathBuf {
        self.config
            .result_dir
            .join(dictionary)
            .join("analysis")
            .join("top_activations")
    }

    /// Dictionaries under the result directory that have an analysis
    pub fn list_dictionaries(&self) -> Result<Vec<String>, LookupError> {
        let dir = &self.config.result_dir;
        let entries = std::fs::read_dir(dir).map_err(|e| {
            LookupError::Internal(anyhow::anyhow!(
                "Failed to read result dir {}: {e}",
                dir.display()
            ))
        })?;
        let mut names: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().join("analysis").is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Fetch a result set, loading it on a cache miss
    pub fn result_set(&self, dictionary: &str) -> Result<Arc<ResultSet>, LookupError> {
        if dictionary.is_empty()
            || dictionary.contains(|c: char| c == '/' || c == '\\')
            || dictionary == "."
            || dictionary == ".."
        {
            return Err(LookupError::InvalidName(dictionary.to_string()));
        }

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow::anyhow!("Result cache lock poisoned"))?;
        if let Some(hit) = cache.get(dictionary) {
            debug!("Result cache hit: {dictionary}");
            return Ok(hit);
        }

        let path = self.result_path(dictionary);
        if !path.join(store::MANIFEST_FILE).is_file() {
            return Err(LookupError::NotFound(dictionary.to_string()));
        }
        info!("Loading result set {dictionary} from {}", path.display());
        let loaded = Arc::new(store::load(&path)?);
        cache.insert(dictionary.to_string(), Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Resolve a query to a channel index within `result`
    fn resolve(
        &self,
        dictionary: &str,
        result: &ResultSet,
        query: FeatureQuery,
    ) -> Result<usize, LookupError> {
        let index = match query {
            FeatureQuery::Random => {
                let nonzero = result.nonzero_channels();
                if nonzero.is_empty() {
                    return Err(LookupError::NoActiveFeatures(dictionary.to_string()));
                }
                let mut rng = self
                    .rng
                    .lock()
                    .map_err(|_| anyhow::anyhow!("Lookup rng lock poisoned"))?;
                let pick = nonzero[rng.gen_range(0..nonzero.len())];
                debug!("Random feature: {pick}");
                return Ok(pick);
            }
            FeatureQuery::Index(index) => index,
        };
        match usize::try_from(index) {
            Ok(i) if i < result.n_channels() => Ok(i),
            _ => Err(LookupError::OutOfRange(index)),
        }
    }

    /// Look up one feature
    pub fn feature(
        &self,
        dictionary: &str,
        query: FeatureQuery,
    ) -> Result<FeatureResponse, LookupError> {
        let result = self.result_set(dictionary)?;
        let feature_index = self.resolve(dictionary, &result, query)?;
        let channel = &result.channels[feature_index];

        let samples = channel
            .top_samples
            .iter()
            .map(|s| -> anyhow::Result<SampleView> {
                let context = self
                    .decoder
                    .decode_tokens(&s.context)?
                    .into_iter()
                    .map(ByteBuf::from)
                    .collect();
                Ok(SampleView {
                    context,
                    context_ids: s.context.clone(),
                    feature_acts: s.activations.clone(),
                    weight: s.weight,
                    priority_key: s.priority_key,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(FeatureResponse {
            feature_index,
            act_times: channel.activation_count,
            max_feature_act: channel.max_activation,
            samples,
        })
    }

    /// Look up one feature and encode the response as MessagePack
    pub fn feature_info(&self, dictionary: &str, raw_index: &str) -> Result<Vec<u8>, LookupError> {
        let query = FeatureQuery::parse(raw_index)?;
        Ok(self.feature(dictionary, query)?.to_msgpack()?)
    }
}
