use anyhow::{Context, Result};
use clap::Parser;
use count_greater::driver::{
    Bench, BenchConfig, ChunkMode, DEFAULT_CHUNK_BYTES, DEFAULT_ELEMENTS, DEFAULT_VALUE_BOUND,
};
use count_greater::perf::PerfEvent;
use count_greater::probe::FIB_SIZES;
use count_greater::verify::THRESHOLDS;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Measure scalar and SIMD "count greater than" kernels over cache-sized chunks.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Length of the element stream.
    #[arg(long, default_value_t = DEFAULT_ELEMENTS)]
    elements: usize,

    /// Bytes scanned per kernel invocation; size this to the cache level under study.
    #[arg(long, default_value_t = DEFAULT_CHUNK_BYTES)]
    chunk_bytes: usize,

    #[arg(long, value_enum, default_value_t = ChunkMode::Resident)]
    mode: ChunkMode,

    /// Comma-separated thresholds to measure.
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true, default_values_t = THRESHOLDS)]
    thresholds: Vec<i8>,

    /// Generated values are drawn from 0..VALUE_BOUND.
    #[arg(long, default_value_t = DEFAULT_VALUE_BOUND)]
    value_bound: i8,

    /// Seed for the data generator; random when omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Report wall time only.
    #[arg(long)]
    no_hw_counters: bool,

    /// Skip the Fibonacci probe.
    #[arg(long)]
    skip_fib: bool,
}

impl From<Cli> for BenchConfig {
    fn from(cli: Cli) -> Self {
        Self {
            elements: cli.elements,
            chunk_bytes: cli.chunk_bytes,
            mode: cli.mode,
            thresholds: cli.thresholds,
            value_bound: cli.value_bound,
            seed: cli.seed,
            hw_counters: !cli.no_hw_counters,
            fib_sizes: if cli.skip_fib { Vec::new() } else { FIB_SIZES.to_vec() },
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = BenchConfig::from(Cli::parse());
    let mut perf = PerfEvent::new(config.hw_counters);

    let bench = Bench::prepare(config).context("benchmark setup failed, nothing was measured")?;
    bench.run(&mut perf);

    Ok(())
}
