//! Benchmark run: data generation, chunk planning and the measured loops.

use std::fmt;
use std::hint::black_box;
use std::ops::Range;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::info;

use crate::huge::HugeBuffer;
use crate::perf::{PerfEvent, PerfEventBlock};
use crate::probe::{self, FIB_SIZES};
use crate::verify::{self, THRESHOLDS};
use crate::{Error, Kernel, Result, GROUP_WIDTH};

pub const DEFAULT_ELEMENTS: usize = 128 * 1024 * 1024;

/// Sized to sit entirely in a typical 32 KiB L1d.
pub const DEFAULT_CHUNK_BYTES: usize = 32 * 1024;

pub const DEFAULT_VALUE_BOUND: i8 = 100;

/// Which part of the stream each chunked invocation reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ChunkMode {
    /// Every invocation rescans the chunk-sized prefix of the stream, so the
    /// working set stays resident in the cache level the chunk is sized for.
    #[default]
    Resident,
    /// Invocations walk consecutive chunks across the whole stream.
    Sweep,
}

impl fmt::Display for ChunkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChunkMode::Resident => "resident",
            ChunkMode::Sweep => "sweep",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BenchConfig {
    pub elements: usize,
    pub chunk_bytes: usize,
    pub mode: ChunkMode,
    pub thresholds: Vec<i8>,
    /// Generated values are drawn from `0..value_bound`.
    pub value_bound: i8,
    pub seed: Option<u64>,
    pub hw_counters: bool,
    pub fib_sizes: Vec<u32>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            elements: DEFAULT_ELEMENTS,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            mode: ChunkMode::default(),
            thresholds: THRESHOLDS.to_vec(),
            value_bound: DEFAULT_VALUE_BOUND,
            seed: None,
            hw_counters: true,
            fib_sizes: FIB_SIZES.to_vec(),
        }
    }
}

impl BenchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.value_bound <= 0 {
            return Err(Error::EmptyValueRange(self.value_bound));
        }
        ChunkPlan::new(self.elements, self.chunk_bytes, self.mode).map(drop)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub start: usize,
    pub len: usize,
}

impl Chunk {
    pub fn range(self) -> Range<usize> {
        self.start..self.start + self.len
    }
}

/// Splits a stream of `total` elements into chunk-sized kernel invocations.
///
/// The chunk length is `chunk_bytes` rounded down to whole groups. When it
/// does not divide `total`, one extra invocation covers the remainder, so the
/// plan always processes exactly `total` elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    total: usize,
    chunk_len: usize,
    mode: ChunkMode,
}

impl ChunkPlan {
    pub fn new(total: usize, chunk_bytes: usize, mode: ChunkMode) -> Result<Self> {
        if total % GROUP_WIDTH != 0 {
            return Err(Error::UnalignedLength {
                len: total,
                group: GROUP_WIDTH,
            });
        }

        let chunk_len = chunk_bytes / size_of::<i8>() / GROUP_WIDTH * GROUP_WIDTH;
        if chunk_len == 0 {
            return Err(Error::ChunkTooSmall {
                chunk_bytes,
                group: GROUP_WIDTH,
            });
        }

        Ok(Self {
            total,
            chunk_len,
            mode,
        })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    pub fn mode(&self) -> ChunkMode {
        self.mode
    }

    pub fn full_chunks(&self) -> usize {
        self.total / self.chunk_len
    }

    pub fn remainder(&self) -> usize {
        self.total % self.chunk_len
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        let full = self.full_chunks();
        let tail = (self.remainder() != 0).then(|| Chunk {
            start: self.start_of(full),
            len: self.remainder(),
        });

        (0..full)
            .map(move |i| Chunk {
                start: self.start_of(i),
                len: self.chunk_len,
            })
            .chain(tail)
    }

    /// Elements handed to the kernel over one pass of the plan.
    pub fn processed(&self) -> usize {
        self.chunks().map(|chunk| chunk.len).sum()
    }

    fn start_of(&self, index: usize) -> usize {
        match self.mode {
            ChunkMode::Resident => 0,
            ChunkMode::Sweep => index * self.chunk_len,
        }
    }
}

/// Fills `haystack` with values drawn uniformly from `0..bound`.
pub fn fill_random<R: Rng>(haystack: &mut [i8], rng: &mut R, bound: i8) {
    for x in haystack {
        *x = rng.random_range(0..bound);
    }
}

/// Invokes `kernel` once per chunk of `plan` and sums the counts.
pub fn run_chunks(kernel: Kernel, haystack: &[i8], plan: &ChunkPlan, threshold: i8) -> usize {
    plan.chunks()
        .map(|chunk| kernel.count(&haystack[chunk.range()], threshold))
        .sum()
}

/// Summed count of one measured (kernel, threshold) cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunRecord {
    pub kernel: Kernel,
    pub threshold: i8,
    pub count: usize,
    pub processed: usize,
}

/// A generated, verified element stream ready to be measured.
pub struct Bench {
    config: BenchConfig,
    plan: ChunkPlan,
    haystack: HugeBuffer,
}

impl Bench {
    /// Allocates and fills the stream, then checks every vector kernel
    /// against the scalar reference. Nothing is timed if this fails.
    pub fn prepare(config: BenchConfig) -> Result<Self> {
        config.validate()?;
        let plan = ChunkPlan::new(config.elements, config.chunk_bytes, config.mode)?;

        let mut haystack = HugeBuffer::zeroed(config.elements * size_of::<i8>())?;
        info!(elements = config.elements, "allocated element stream");

        let mut rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_rng(&mut rand::rng()),
        };
        fill_random(&mut haystack, &mut rng, config.value_bound);
        info!(bound = config.value_bound, seed = ?config.seed, "filled element stream");

        verify::verify_equivalence(&haystack, &config.thresholds, &Kernel::VECTOR)?;

        Ok(Self {
            config,
            plan,
            haystack,
        })
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn haystack(&self) -> &[i8] {
        &self.haystack
    }

    /// Measures every kernel at every threshold, one block per cell.
    pub fn run_kernels(&self, perf: &mut PerfEvent) -> Vec<RunRecord> {
        info!(
            chunk_len = self.plan.chunk_len(),
            invocations = self.plan.chunks().count(),
            mode = %self.plan.mode(),
            "measuring kernels"
        );

        let processed = self.plan.processed();
        let mut records = Vec::with_capacity(Kernel::ALL.len() * self.config.thresholds.len());
        for kernel in Kernel::ALL {
            for &threshold in &self.config.thresholds {
                perf.set_param("name", kernel.name());
                perf.set_param("selectivity", threshold);
                perf.set_param("chunk", self.plan.chunk_len());
                perf.set_param("mode", self.plan.mode());

                let count = {
                    let _block = PerfEventBlock::new(perf, processed as u64);
                    black_box(run_chunks(kernel, &self.haystack, &self.plan, threshold))
                };

                records.push(RunRecord {
                    kernel,
                    threshold,
                    count,
                    processed,
                });
            }
        }
        records
    }

    /// Times the recursive Fibonacci probe at each configured size.
    pub fn run_probe(&self, perf: &mut PerfEvent) {
        perf.clear_params();
        for &until in &self.config.fib_sizes {
            perf.set_param("name", "Fib");
            perf.set_param("until", until);
            let _block = PerfEventBlock::new(perf, 1);
            black_box(probe::fib(until));
        }
    }

    pub fn run(&self, perf: &mut PerfEvent) -> Vec<RunRecord> {
        let records = self.run_kernels(perf);
        self.run_probe(perf);
        records
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::count_gt_naive;

    fn small_config(mode: ChunkMode) -> BenchConfig {
        BenchConfig {
            elements: GROUP_WIDTH * 1000,
            chunk_bytes: 4096,
            mode,
            seed: Some(42),
            hw_counters: false,
            fib_sizes: vec![10],
            ..BenchConfig::default()
        }
    }

    #[test]
    fn default_matches_reference_run() {
        let config = BenchConfig::default();
        assert_eq!(config.elements, 128 << 20);
        assert_eq!(config.chunk_bytes, 32 << 10);
        assert_eq!(config.thresholds, [1i8, 10, 50, 90, 99]);
        assert_eq!(config.mode, ChunkMode::Resident);
        config.validate().unwrap();

        let plan = ChunkPlan::new(config.elements, config.chunk_bytes, config.mode).unwrap();
        assert_eq!(plan.full_chunks(), 4096);
        assert_eq!(plan.remainder(), 0);
    }

    #[test]
    fn sweep_covers_stream_with_tail() {
        let plan = ChunkPlan::new(GROUP_WIDTH * 10, GROUP_WIDTH * 3, ChunkMode::Sweep).unwrap();
        let chunks: Vec<Chunk> = plan.chunks().collect();

        assert_eq!(chunks.len(), 4);
        let mut next = 0;
        for chunk in &chunks {
            assert_eq!(chunk.start, next);
            assert_eq!(chunk.len % GROUP_WIDTH, 0);
            next = chunk.range().end;
        }
        assert_eq!(next, plan.total());
        assert_eq!(chunks[3].len, GROUP_WIDTH);
        assert_eq!(plan.processed(), plan.total());
    }

    #[test]
    fn resident_rescans_prefix() {
        let plan = ChunkPlan::new(GROUP_WIDTH * 10, GROUP_WIDTH * 3, ChunkMode::Resident).unwrap();
        let chunks: Vec<Chunk> = plan.chunks().collect();

        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|chunk| chunk.start == 0));
        assert_eq!(chunks[3].len, GROUP_WIDTH);
        assert_eq!(plan.processed(), plan.total());
    }

    #[test]
    fn chunk_rounds_down_to_groups() {
        let plan = ChunkPlan::new(GROUP_WIDTH * 4, GROUP_WIDTH * 2 + 5, ChunkMode::Sweep).unwrap();
        assert_eq!(plan.chunk_len(), GROUP_WIDTH * 2);
        assert_eq!(plan.remainder(), 0);
    }

    #[test]
    fn chunk_larger_than_stream() {
        let plan = ChunkPlan::new(GROUP_WIDTH, 1 << 20, ChunkMode::Sweep).unwrap();
        assert_eq!(
            plan.chunks().collect::<Vec<_>>(),
            [Chunk {
                start: 0,
                len: GROUP_WIDTH
            }]
        );

        let empty = ChunkPlan::new(0, 1 << 20, ChunkMode::Sweep).unwrap();
        assert_eq!(empty.chunks().count(), 0);
    }

    #[test]
    fn invalid_plans() {
        assert!(matches!(
            ChunkPlan::new(GROUP_WIDTH + 1, 4096, ChunkMode::Sweep),
            Err(Error::UnalignedLength { len, .. }) if len == GROUP_WIDTH + 1
        ));
        assert!(matches!(
            ChunkPlan::new(GROUP_WIDTH, GROUP_WIDTH - 1, ChunkMode::Sweep),
            Err(Error::ChunkTooSmall { .. })
        ));

        let config = BenchConfig {
            value_bound: 0,
            ..small_config(ChunkMode::Sweep)
        };
        assert!(matches!(config.validate(), Err(Error::EmptyValueRange(0))));
    }

    #[test]
    fn fill_stays_in_bound() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut haystack = vec![-1i8; 10_000];
        fill_random(&mut haystack, &mut rng, 100);

        assert!(haystack.iter().all(|&x| (0..100).contains(&x)));
        assert!(haystack.contains(&0));
        assert!(haystack.contains(&99));
    }

    #[test]
    fn seeded_streams_repeat() {
        let a = Bench::prepare(small_config(ChunkMode::Sweep)).unwrap();
        let b = Bench::prepare(small_config(ChunkMode::Sweep)).unwrap();
        assert_eq!(a.haystack(), b.haystack());
    }

    #[test]
    fn sweep_run_counts_whole_stream() {
        let bench = Bench::prepare(small_config(ChunkMode::Sweep)).unwrap();
        let mut perf = PerfEvent::new(false).quiet();

        let records = bench.run(&mut perf);

        assert_eq!(records.len(), Kernel::ALL.len() * THRESHOLDS.len());
        for record in &records {
            assert_eq!(record.processed, bench.config().elements);
            assert_eq!(
                record.count,
                count_gt_naive(bench.haystack(), record.threshold),
                "{} at {}",
                record.kernel,
                record.threshold
            );
        }

        let measurements = perf.measurements();
        assert_eq!(measurements.len(), records.len() + 1);
        assert_eq!(measurements[0].scale, bench.config().elements as u64);
        assert_eq!(measurements[0].params[0], ("name".to_owned(), "scalar  8".to_owned()));

        let fib = measurements.last().unwrap();
        assert_eq!(fib.scale, 1);
        assert_eq!(
            fib.params,
            [
                ("name".to_owned(), "Fib".to_owned()),
                ("until".to_owned(), "10".to_owned()),
            ]
        );
    }

    #[test]
    fn resident_run_counts_prefix() {
        let bench = Bench::prepare(small_config(ChunkMode::Resident)).unwrap();
        let mut perf = PerfEvent::new(false).quiet();
        let plan = bench.plan();

        let records = bench.run_kernels(&mut perf);

        for record in records {
            let prefix = &bench.haystack()[..plan.chunk_len()];
            let tail = &bench.haystack()[..plan.remainder()];
            let expected = plan.full_chunks() * count_gt_naive(prefix, record.threshold)
                + count_gt_naive(tail, record.threshold);
            assert_eq!(record.count, expected);
            assert_eq!(record.processed, bench.config().elements);
        }
    }
}
