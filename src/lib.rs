// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `trace`/`traces`
#![allow(clippy::module_name_repetitions)] // SampleView in lookup.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! feature-acts: top activating contexts for sparse encoder features
//!
//! Streams token batches through a sparse encoder and keeps, for every
//! feature (channel), a bounded weighted sample of the contexts that
//! activate it most, plus exact activation counts and maxima and a sampled
//! activation histogram. Results are stored as a sharded result set and
//! served per feature by a lookup service.
//!
//! ## Architecture
//!
//! - `source`: token batch sources (JSON corpus, in-memory)
//! - `encoder`: sparse encoder loaded from safetensors / HuggingFace
//! - `producer`: activation producers mapping token batches to `[batch, position, channel]`
//! - `priority`: per-context weights and Efraimidis–Spirakis sampling keys
//! - `reservoir`: per-channel bounded top-K reservoir
//! - `trace`: flat host copy of one batch's activations
//! - `aggregate`: exact activation counts, maxima, and histogram samples
//! - `sampler`: streaming driver tying the above together
//! - `result`: finalized per-channel results
//! - `store`: sharded MessagePack result sets on disk
//! - `tokens`: token id to display-bytes decoding
//! - `lookup`: cached per-feature lookup with MessagePack responses
//! - `config`: sampling and lookup configuration

pub mod aggregate;
pub mod config;
pub mod encoder;
pub mod lookup;
pub mod priority;
pub mod producer;
pub mod reservoir;
pub mod result;
pub mod sampler;
pub mod source;
pub mod store;
pub mod tokens;
pub mod trace;

pub use aggregate::{ChannelAggregates, HistogramSample};
pub use config::{AnalysisConfig, LookupConfig};
pub use encoder::SparseEncoder;
pub use lookup::{
    FeatureQuery, FeatureResponse, LookupError, LookupService, ResultCache, SampleView,
};
pub use priority::{BatchPriorities, PriorityTransform};
pub use producer::{ActivationProducer, EncodedHiddenStates, FnProducer};
pub use reservoir::{Candidate, TopKReservoir};
pub use result::{ChannelResult, ResultSet, TopSample};
pub use sampler::{sample_feature_activations, FeatureSampler};
pub use source::{BatchSource, TokenBatch, TokenCorpus, VecSource};
pub use tokens::{ByteLevelDecoder, IdentityDecoder, TokenDecoder};
pub use trace::ActivationTrace;
