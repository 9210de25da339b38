//! Throughput driver for nexus-bulk.
//!
//! Writers repeatedly append the batch `0..batch_size`. Readers drain with
//! `pop_all_or_stop`, recycling their buffer, and check that every drain is a
//! whole number of intact batches. After the run, writers are stopped first
//! so readers can empty the queue, then readers are stopped.
//!
//! Run: cargo run --release --features cli --bin nexus_bulk_throughput -- --writers 2 --readers 2
//! Profile: sudo taskset -c 0,2,4,6 ./target/release/nexus_bulk_throughput

use std::panic;
use std::process::ExitCode;
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use nexus_bulk::{Backpressure, Blocking, Queue, StopSource, StopToken, Unbounded};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Measure nexus-bulk throughput with concurrent writers and readers")]
struct Opts {
    /// Number of consumer threads.
    #[arg(long, default_value_t = 1)]
    readers: usize,

    /// Number of producer threads.
    #[arg(long, default_value_t = 1)]
    writers: usize,

    /// Elements per appended batch.
    #[arg(long, default_value_t = 2000)]
    batch_size: usize,

    /// How long writers run, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    duration_ms: u64,

    /// Backpressure policy.
    #[arg(long, value_enum, default_value_t = PolicyArg::Unbounded)]
    policy: PolicyArg,

    /// Queue size at which writers wait (blocking policy only).
    #[arg(long, default_value_t = 1_000_000)]
    capacity: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Unbounded,
    Blocking,
}

/// What one reader saw.
#[derive(Default)]
struct Tally {
    items: u64,
    corrupt: u64,
    peak: usize,
}

impl Tally {
    fn record(&mut self, drained: &[u64], batch_size: usize) {
        self.items += drained.len() as u64;
        self.peak = self.peak.max(drained.len());
        if !is_whole_batches(drained, batch_size) {
            self.corrupt += 1;
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.items += other.items;
        self.corrupt += other.corrupt;
        self.peak = self.peak.max(other.peak);
        self
    }
}

/// Returns `true` if `drained` is `0..batch_size` repeated.
fn is_whole_batches(drained: &[u64], batch_size: usize) -> bool {
    drained.len() % batch_size == 0
        && drained
            .chunks_exact(batch_size)
            .all(|chunk| chunk.iter().zip(0u64..).all(|(&v, i)| v == i))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let opts = Opts::parse();
    if opts.readers == 0 || opts.writers == 0 || opts.batch_size == 0 {
        error!("--readers, --writers and --batch-size must all be at least 1");
        return ExitCode::FAILURE;
    }

    match opts.policy {
        PolicyArg::Unbounded => run(&opts, &Queue::with_policy(Unbounded)),
        PolicyArg::Blocking => {
            if opts.capacity == 0 {
                error!("--capacity must be at least 1");
                return ExitCode::FAILURE;
            }
            run(&opts, &Queue::with_policy(Blocking::new(opts.capacity)))
        }
    }
}

fn run<P>(opts: &Opts, queue: &Queue<Vec<u64>, P>) -> ExitCode
where
    P: Backpressure + Sync,
{
    info!(
        readers = opts.readers,
        writers = opts.writers,
        batch_size = opts.batch_size,
        duration_ms = opts.duration_ms,
        "starting"
    );

    let writer_stop = StopSource::new();
    let reader_stop = StopSource::new();

    let (batches, elapsed, mut tally) = thread::scope(|s| {
        let readers: Vec<_> = (0..opts.readers)
            .map(|_| {
                let token = reader_stop.token();
                s.spawn(move || read(queue, &token, opts.batch_size))
            })
            .collect();

        let start = Instant::now();
        let writers: Vec<_> = (0..opts.writers)
            .map(|_| {
                let token = writer_stop.token();
                s.spawn(move || write(queue, &token, opts.batch_size))
            })
            .collect();

        thread::sleep(Duration::from_millis(opts.duration_ms));
        writer_stop.request_stop();
        let batches: u64 = writers.into_iter().map(join).sum();
        let elapsed = start.elapsed();

        reader_stop.request_stop();
        let tally = readers
            .into_iter()
            .map(join)
            .fold(Tally::default(), Tally::merge);

        (batches, elapsed, tally)
    });

    let leftover = queue.try_pop_all(Vec::new());
    if !leftover.is_empty() {
        tally.record(&leftover, opts.batch_size);
    }

    let expected = batches * opts.batch_size as u64;
    let rate = tally.items as f64 / elapsed.as_secs_f64() / 1e6;

    println!("{rate:.3} million messages / second");
    println!("peak elements on queue: {}", tally.peak);

    if tally.corrupt > 0 {
        error!(drains = tally.corrupt, "drained data was not whole batches");
        return ExitCode::FAILURE;
    }
    if tally.items != expected {
        error!(read = tally.items, expected, "item count mismatch");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn write<P>(queue: &Queue<Vec<u64>, P>, token: &StopToken, batch_size: usize) -> u64
where
    P: Backpressure,
{
    let mut batches = 0;
    while !token.stop_requested() {
        queue.append(0..batch_size as u64);
        batches += 1;
    }
    batches
}

fn read<P>(queue: &Queue<Vec<u64>, P>, token: &StopToken, batch_size: usize) -> Tally
where
    P: Backpressure + Sync,
{
    let mut tally = Tally::default();
    let mut storage = Vec::new();
    loop {
        storage = queue.pop_all_or_stop(token, storage);
        if storage.is_empty() {
            return tally;
        }
        tally.record(&storage, batch_size);
    }
}

fn join<T>(handle: ScopedJoinHandle<'_, T>) -> T {
    handle
        .join()
        .unwrap_or_else(|payload| panic::resume_unwind(payload))
}
