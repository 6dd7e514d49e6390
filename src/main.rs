//! feature-acts CLI: sample top activating contexts and look them up

use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use feature_acts::{
    sample_feature_activations, store, AnalysisConfig, ByteLevelDecoder, EncodedHiddenStates,
    FeatureQuery, IdentityDecoder, LookupConfig, LookupService, SparseEncoder, TokenCorpus,
    TokenDecoder,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "feature-acts")]
#[command(about = "Top activating contexts for sparse encoder features")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a token corpus and record each feature's top contexts
    Sample(SampleArgs),
    /// List dictionaries that have a stored analysis
    Dictionaries {
        /// Result directory (defaults to $RESULT_DIR or "results")
        #[arg(long)]
        result_dir: Option<PathBuf>,
    },
    /// Look up one feature of a dictionary
    Feature(FeatureArgs),
}

#[derive(Args)]
struct SampleArgs {
    /// Pre-tokenized corpus JSON (`{"sequences": [[ids...], ...]}`)
    #[arg(long)]
    tokens: PathBuf,

    /// Safetensors dump of hook-point hidden states aligned with the corpus
    #[arg(long)]
    hidden_states: PathBuf,

    /// Encoder weights: local safetensors file or `HuggingFace` repo ID
    #[arg(long)]
    encoder: String,

    /// File name inside the `HuggingFace` repo when `--encoder` is a repo ID
    #[arg(long, default_value = "encoder.safetensors")]
    encoder_file: String,

    /// JSON config file; flags below override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hook point the hidden states were captured at
    #[arg(long)]
    hook_point: Option<String>,

    /// Token budget
    #[arg(long)]
    total_tokens: Option<u64>,

    /// Contexts per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Tokens per context
    #[arg(long)]
    context_size: Option<usize>,

    /// Top samples kept per feature
    #[arg(long)]
    n_samples: Option<usize>,

    /// Sample weight exponent
    #[arg(long)]
    exponent: Option<f32>,

    /// Keep the top contexts by weight instead of weighted sampling
    #[arg(long)]
    no_sampling: bool,

    /// Cap on histogram values per feature
    #[arg(long)]
    histogram_capacity: Option<usize>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Output directory for the result set
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of storage shards
    #[arg(long)]
    n_shards: Option<usize>,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,
}

#[derive(Args)]
struct FeatureArgs {
    /// Dictionary name
    dictionary: String,

    /// Feature index, or "random"
    index: String,

    /// Result directory (defaults to $RESULT_DIR or "results")
    #[arg(long)]
    result_dir: Option<PathBuf>,

    /// Local tokenizer.json for decoding contexts
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// `HuggingFace` model whose tokenizer decodes contexts (e.g. "gpt2")
    #[arg(long)]
    tokenizer_model: Option<String>,

    /// Write the MessagePack response here instead of printing a summary
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Sample(args) => run_sample(args),
        Command::Dictionaries { result_dir } => {
            let service = LookupService::new(lookup_config(result_dir), Box::new(IdentityDecoder));
            for name in service.list_dictionaries()? {
                println!("{name}");
            }
            Ok(())
        }
        Command::Feature(args) => run_feature(args),
    }
}

fn lookup_config(result_dir: Option<PathBuf>) -> LookupConfig {
    let mut config = LookupConfig::default();
    if let Some(dir) = result_dir {
        config.result_dir = dir;
    }
    config
}

fn analysis_config(args: &SampleArgs) -> Result<AnalysisConfig> {
    let mut config = match args.config {
        Some(ref path) => AnalysisConfig::load(path)?,
        None => AnalysisConfig::default(),
    };
    if let Some(ref v) = args.hook_point {
        config.hook_point.clone_from(v);
    }
    if let Some(v) = args.total_tokens {
        config.total_analyzing_tokens = v;
    }
    if let Some(v) = args.batch_size {
        config.store_batch_size = v;
    }
    if let Some(v) = args.context_size {
        config.context_size = v;
    }
    if let Some(v) = args.n_samples {
        config.n_samples = v;
    }
    if let Some(v) = args.exponent {
        config.sample_weight_exponent = v;
    }
    if args.no_sampling {
        config.enable_sampling = false;
    }
    if args.histogram_capacity.is_some() {
        config.histogram_capacity = args.histogram_capacity;
    }
    if let Some(v) = args.seed {
        config.seed = v;
    }
    if let Some(ref v) = args.output {
        config.analysis_save_path.clone_from(v);
    }
    if let Some(v) = args.n_shards {
        config.n_shards = v;
    }
    config.validate()?;
    Ok(config)
}

fn run_sample(args: SampleArgs) -> Result<()> {
    let config = analysis_config(&args)?;
    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    println!("=== feature-acts: sampling feature activations ===");
    println!("Tokens:  {}", args.tokens.display());
    println!("Hidden:  {}", args.hidden_states.display());
    println!("Encoder: {}", args.encoder);
    println!("Hook:    {}", config.hook_point);
    println!("Output:  {}", config.analysis_save_path.display());
    println!("Device:  {device:?}");

    let encoder = if Path::new(&args.encoder).is_file() {
        SparseEncoder::load(&args.encoder, &device)?
    } else {
        SparseEncoder::from_hub(&args.encoder, &args.encoder_file, &device)?
    };
    let producer = EncodedHiddenStates::load(&args.hidden_states, encoder, &device)?;

    let tokens_path = args.tokens.to_string_lossy();
    let mut corpus = TokenCorpus::load(&tokens_path, config.context_size)?;
    info!(
        "Corpus: {} contexts of {} tokens",
        corpus.remaining_contexts(),
        corpus.context_size()
    );

    let pb = ProgressBar::new(config.total_analyzing_tokens);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tokens ({eta})")?
            .progress_chars("#>-"),
    );
    pb.set_message("Sampling activations");

    let result = sample_feature_activations(&mut corpus, &producer, &config, |n| {
        pb.set_position(n);
    })?;
    pb.finish_and_clear();

    store::save(&result, &config.analysis_save_path, config.n_shards)?;

    println!("\n=== Results ===");
    println!("Features:        {}", result.n_channels());
    println!("Active features: {}", result.nonzero_channels().len());
    println!("Dead features:   {}", result.dead_channels());
    info!("Results saved to {}", config.analysis_save_path.display());

    Ok(())
}

fn run_feature(args: FeatureArgs) -> Result<()> {
    let decoder: Box<dyn TokenDecoder> = match (&args.tokenizer, &args.tokenizer_model) {
        (Some(path), _) => Box::new(ByteLevelDecoder::from_file(path)?),
        (None, Some(model)) => Box::new(ByteLevelDecoder::from_pretrained(model)?),
        (None, None) => Box::new(IdentityDecoder),
    };
    let service = LookupService::new(lookup_config(args.result_dir), decoder);

    let query = FeatureQuery::parse(&args.index)?;
    let response = service.feature(&args.dictionary, query)?;

    if let Some(out) = args.out {
        std::fs::write(&out, response.to_msgpack()?)?;
        info!("Response written to {}", out.display());
        return Ok(());
    }

    println!("Feature {}", response.feature_index);
    println!("  activations: {}", response.act_times);
    println!("  max:         {:.4}", response.max_feature_act);
    for (rank, sample) in response.samples.iter().enumerate() {
        let text: String = sample
            .context
            .iter()
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .collect();
        let peak = sample
            .feature_acts
            .iter()
            .copied()
            .fold(0.0f32, f32::max);
        println!("  #{rank:<3} peak {peak:.3}  {text:?}");
    }
    Ok(())
}
