use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use paged_serve::engine::simulated::{CacheStore, HostSwapper, SimulatedDraft, SimulatedExecutor};
use paged_serve::{EngineConfig, GenerationRequest, LLMEngine, SpeculativeConfig};

#[derive(Parser, Debug)]
#[command(name = "paged-serve")]
#[command(about = "Run a synthetic workload through the paged KV cache and scheduler")]
struct Args {
    /// Engine configuration as JSON (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of requests to submit
    #[arg(long, default_value = "16")]
    requests: usize,

    /// Prompt length in tokens
    #[arg(long, default_value = "48")]
    prompt_len: usize,

    /// Tokens shared by every prompt
    #[arg(long, default_value = "32")]
    shared_prefix: usize,

    /// Maximum tokens to generate per sequence
    #[arg(long, default_value = "64")]
    max_tokens: usize,

    /// Sequences per request
    #[arg(short, long, default_value = "1")]
    n: usize,

    /// Enable speculative decoding with this many draft tokens
    #[arg(long)]
    speculative: Option<usize>,

    /// Vocabulary size of the simulated model
    #[arg(long, default_value = "64")]
    vocab_size: usize,

    /// RNG seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(k) = args.speculative {
        config.speculative = Some(SpeculativeConfig::new().num_tokens(k).seed(args.seed));
    }

    let store = CacheStore::shared(config.cache.block_size);
    let executor = Box::new(SimulatedExecutor::new(args.vocab_size, args.seed, store.clone()));
    let swapper = Box::new(HostSwapper::new(store));
    let mut engine = if config.speculative.is_some() {
        let draft = Box::new(SimulatedDraft::new(args.vocab_size, args.seed.wrapping_add(1)));
        LLMEngine::with_draft(config, executor, swapper, draft)?
    } else {
        LLMEngine::new(config, executor, swapper)?
    };

    let mut rng = StdRng::seed_from_u64(args.seed);
    let vocab = args.vocab_size as u32;
    let prefix: Vec<u32> = (0..args.shared_prefix.min(args.prompt_len))
        .map(|_| rng.gen_range(0..vocab))
        .collect();
    for _ in 0..args.requests {
        let mut prompt = prefix.clone();
        prompt.extend((prompt.len()..args.prompt_len).map(|_| rng.gen_range(0..vocab)));
        engine.submit(GenerationRequest::new(prompt).max_tokens(args.max_tokens).n(args.n))?;
    }

    let mut generated = 0usize;
    let mut finished = 0usize;
    while engine.has_unfinished_requests() {
        for output in engine.step()? {
            generated += output.new_token_ids.len();
            if output.is_finished() {
                finished += 1;
            }
        }
    }

    info!(
        steps = engine.num_steps(),
        finished,
        generated,
        prefix_hit_rate = engine.prefix_cache_hit_rate(),
        "Workload complete"
    );
    if let Some(stats) = engine.spec_decode_stats() {
        info!(
            acceptance_rate = stats.acceptance_rate(),
            tokens_per_verification = stats.mean_emitted_per_verification(),
            fallbacks = stats.num_fallbacks,
            "Speculative decoding"
        );
    }

    println!(
        "{finished} sequences finished, {generated} tokens generated in {} steps",
        engine.num_steps()
    );
    Ok(())
}
