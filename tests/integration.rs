//! Integration tests for feature-acts
//!
//! Note: Tests marked with #[ignore] require network access and model download.
//! Run them explicitly with: cargo test --ignored

use anyhow::Result;
use candle_core::{Device, Tensor};
use feature_acts::{
    sample_feature_activations, store, ActivationProducer, AnalysisConfig, FeatureQuery,
    FeatureResponse, FnProducer, IdentityDecoder, LookupConfig, LookupService, ResultSet,
    TokenBatch, VecSource,
};

const N_CHANNELS: usize = 4;
const CONTEXT_SIZE: usize = 3;

/// Deterministic synthetic encoder output in [-2.0, 3.0]
fn synthetic_act(token: u32, position: usize, channel: usize) -> f32 {
    let h = (token as usize * 31 + position * 7 + channel * 13) % 11;
    h as f32 * 0.5 - 2.0
}

fn synthetic_producer() -> impl ActivationProducer {
    FnProducer::new(N_CHANNELS, |batch: &TokenBatch, _hook_point: &str| -> Result<Tensor> {
        let mut data = Vec::with_capacity(batch.len() * batch.context_size() * N_CHANNELS);
        for context in batch.contexts() {
            for (p, &token) in context.iter().enumerate() {
                for c in 0..N_CHANNELS {
                    data.push(synthetic_act(token, p, c));
                }
            }
        }
        Ok(Tensor::from_vec(
            data,
            (batch.len(), batch.context_size(), N_CHANNELS),
            &Device::Cpu,
        )?)
    })
}

fn contexts(n: usize) -> Vec<Vec<u32>> {
    (0..n)
        .map(|i| {
            (0..CONTEXT_SIZE)
                .map(|p| ((i * CONTEXT_SIZE + p) * 17 % 101) as u32)
                .collect()
        })
        .collect()
}

fn config(batch_size: usize, n_samples: usize, enable_sampling: bool) -> AnalysisConfig {
    AnalysisConfig {
        total_analyzing_tokens: (15 * CONTEXT_SIZE) as u64,
        store_batch_size: batch_size,
        context_size: CONTEXT_SIZE,
        n_samples,
        sample_weight_exponent: 1.0,
        enable_sampling,
        seed: 7,
        ..Default::default()
    }
}

fn run(contexts: Vec<Vec<u32>>, config: &AnalysisConfig) -> ResultSet {
    let mut source = VecSource::new(contexts);
    sample_feature_activations(&mut source, &synthetic_producer(), config, |_| {}).unwrap()
}

/// Peak rectified activation of a context for a channel
fn peak(context: &[u32], channel: usize) -> f32 {
    context
        .iter()
        .enumerate()
        .map(|(p, &t)| synthetic_act(t, p, channel).max(0.0))
        .fold(0.0, f32::max)
}

/// End-to-end: 4 channels, N = 2, three batches of five contexts
#[test]
fn test_end_to_end_with_lookup() {
    let ctxs = contexts(15);
    let result = run(ctxs.clone(), &config(5, 2, true));
    assert_eq!(result.n_channels(), N_CHANNELS);

    for c in 0..N_CHANNELS {
        let channel = &result.channels[c];

        // Brute-force tallies
        let mut count = 0u64;
        let mut max = 0.0f32;
        for ctx in &ctxs {
            for (p, &t) in ctx.iter().enumerate() {
                let v = synthetic_act(t, p, c);
                if v > 0.0 {
                    count += 1;
                }
                max = max.max(v);
            }
        }
        let eligible = ctxs.iter().filter(|ctx| peak(ctx, c) > 0.0).count();

        assert_eq!(channel.activation_count, count, "channel {c}");
        assert_eq!(channel.max_activation, max, "channel {c}");
        assert!(channel.top_samples.len() <= 2);
        assert_eq!(channel.top_samples.len(), eligible.min(2), "channel {c}");
        for pair in channel.top_samples.windows(2) {
            assert!(pair[0].priority_key >= pair[1].priority_key);
        }
        for sample in &channel.top_samples {
            assert_eq!(sample.context.len(), CONTEXT_SIZE);
            assert_eq!(sample.activations.len(), CONTEXT_SIZE);
            assert!(sample.weight > 0.0);
        }
    }

    // Storage round trip and lookup
    let dir = tempfile::tempdir().unwrap();
    let lookup_config = LookupConfig {
        result_dir: dir.path().to_path_buf(),
        cache_capacity: 1,
        seed: 0,
    };
    let service = LookupService::new(lookup_config, Box::new(IdentityDecoder));
    store::save(&result, service.result_path("synthetic"), 3).unwrap();

    let bytes = service.feature_info("synthetic", "0").unwrap();
    let response = FeatureResponse::from_msgpack(&bytes).unwrap();
    let stored = &result.channels[0];

    assert_eq!(response.feature_index, 0);
    assert_eq!(response.act_times, stored.activation_count);
    assert_eq!(response.max_feature_act, stored.max_activation);
    assert_eq!(response.samples.len(), stored.top_samples.len());
    for (served, kept) in response.samples.iter().zip(&stored.top_samples) {
        assert_eq!(served.context_ids, kept.context);
        assert_eq!(served.feature_acts, kept.activations);
        assert_eq!(served.weight, kept.weight);
        assert_eq!(served.priority_key.to_bits(), kept.priority_key.to_bits());
        let expected: Vec<Vec<u8>> = kept
            .context
            .iter()
            .map(|id| id.to_string().into_bytes())
            .collect();
        let decoded: Vec<Vec<u8>> = served.context.iter().map(|b| b.to_vec()).collect();
        assert_eq!(decoded, expected);
    }

    let err = service.feature_info("synthetic", "4").unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[test]
fn test_same_seed_is_bit_identical() {
    let a = run(contexts(15), &config(5, 3, true));
    let b = run(contexts(15), &config(5, 3, true));
    assert_eq!(a, b);
    for (ca, cb) in a.channels.iter().zip(&b.channels) {
        for (sa, sb) in ca.top_samples.iter().zip(&cb.top_samples) {
            assert_eq!(sa.priority_key.to_bits(), sb.priority_key.to_bits());
        }
    }
}

#[test]
fn test_batch_split_does_not_change_result() {
    for enable_sampling in [true, false] {
        let mut whole_config = config(15, 3, enable_sampling);
        whole_config.histogram_interval = 1;
        let mut split_config = config(8, 3, enable_sampling);
        split_config.histogram_interval = 1;

        let whole = run(contexts(15), &whole_config);
        let split = run(contexts(15), &split_config);

        for (a, b) in whole.channels.iter().zip(&split.channels) {
            assert_eq!(a.top_samples, b.top_samples);
            assert_eq!(a.activation_count, b.activation_count);
            assert_eq!(a.max_activation, b.max_activation);
        }
    }
}

#[test]
fn test_deterministic_mode_is_top_by_weight() {
    let ctxs = contexts(15);
    let result = run(ctxs.clone(), &config(5, 4, false));

    for c in 0..N_CHANNELS {
        let mut ranked: Vec<(f32, usize)> = ctxs
            .iter()
            .enumerate()
            .map(|(i, ctx)| (peak(ctx, c), i))
            .filter(|(w, _)| *w > 0.0)
            .collect();
        // Highest weight first, earlier arrival on ties
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        let expected: Vec<Vec<u32>> = ranked
            .iter()
            .take(4)
            .map(|&(_, i)| ctxs[i].clone())
            .collect();

        let got: Vec<Vec<u32>> = result.channels[c]
            .top_samples
            .iter()
            .map(|s| s.context.clone())
            .collect();
        assert_eq!(got, expected, "channel {c}");
    }
}

#[test]
fn test_single_active_context_always_sampled() {
    let n_contexts = 12;
    let hot = 7;
    let hot_producer = move |batch: &TokenBatch, _hook_point: &str| -> Result<Tensor> {
        let mut data = Vec::new();
        for (i, _) in batch.contexts().iter().enumerate() {
            let global = batch.offset() + i;
            for p in 0..batch.context_size() {
                // channel 0 always fires, channel 1 only at one position of one context
                data.push(1.0 + p as f32);
                data.push(if global == hot && p == 1 { 0.25 } else { 0.0 });
            }
        }
        Ok(Tensor::from_vec(
            data,
            (batch.len(), batch.context_size(), 2),
            &Device::Cpu,
        )?)
    };
    let producer = FnProducer::new(2, hot_producer);

    for seed in 0..5 {
        let cfg = AnalysisConfig {
            total_analyzing_tokens: (n_contexts * 2) as u64,
            store_batch_size: 4,
            context_size: 2,
            n_samples: 3,
            sample_weight_exponent: 2.0,
            enable_sampling: true,
            seed,
            ..Default::default()
        };
        let ctxs: Vec<Vec<u32>> = (0..n_contexts as u32).map(|i| vec![i, i + 100]).collect();
        let mut source = VecSource::new(ctxs);
        let result = sample_feature_activations(&mut source, &producer, &cfg, |_| {}).unwrap();

        let samples = &result.channels[1].top_samples;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].context, vec![hot as u32, hot as u32 + 100]);
        assert_eq!(samples[0].activations, vec![0.0, 0.25]);
        assert_eq!(result.channels[0].top_samples.len(), 3);
    }
}

#[test]
fn test_histogram_cap_bounds_growth() {
    let mut cfg = config(1, 2, true);
    cfg.histogram_interval = 1;
    cfg.histogram_capacity = Some(4);
    let capped = run(contexts(15), &cfg);

    cfg.histogram_capacity = None;
    let unbounded = run(contexts(15), &cfg);

    for (a, b) in capped.channels.iter().zip(&unbounded.channels) {
        assert_eq!(a.histogram.len(), b.histogram.len().min(4));
        assert!(b.histogram.iter().all(|&v| v > 0.0));
    }
}

#[test]
fn test_random_lookup_hits_active_channel() {
    let result = run(contexts(15), &config(5, 2, true));
    let dir = tempfile::tempdir().unwrap();
    let service = LookupService::new(
        LookupConfig {
            result_dir: dir.path().to_path_buf(),
            cache_capacity: 2,
            seed: 3,
        },
        Box::new(IdentityDecoder),
    );
    store::save(&result, service.result_path("synthetic"), 2).unwrap();

    assert_eq!(service.list_dictionaries().unwrap(), vec!["synthetic".to_string()]);
    let response = service.feature("synthetic", FeatureQuery::Random).unwrap();
    assert!(result.nonzero_channels().contains(&response.feature_index));
}

/// Network-dependent test: byte-level decoding with the GPT-2 tokenizer
#[test]
#[ignore = "requires tokenizer download"]
fn test_gpt2_byte_decoding() {
    use feature_acts::{ByteLevelDecoder, TokenDecoder};

    let decoder = ByteLevelDecoder::from_pretrained("gpt2").unwrap();
    // 383 = "ĠThe"
    assert_eq!(decoder.decode_token(383).unwrap(), b" The".to_vec());
}
