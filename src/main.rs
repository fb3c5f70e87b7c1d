use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use pktmbuf_rs::{CacheStats, Mempool, MempoolConfig};
use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line options.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// TOML file with the pool configuration.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// Number of buffers in the pool.
    #[clap(short, long)]
    capacity: Option<u32>,

    /// Per-core cache size.
    #[clap(long)]
    cache_size: Option<u32>,

    /// Number of worker cores (default: one per CPU).
    #[clap(short = 'n', long)]
    cores: Option<usize>,

    /// Data room of each buffer, headroom included.
    #[clap(long)]
    data_room_size: Option<u16>,

    /// Lock the pool memory into RAM.
    #[clap(long)]
    pin: bool,

    /// Buffers allocated per burst.
    #[clap(short, long, default_value_t = 32)]
    burst: usize,

    /// Pick each burst size at random in 1..=burst.
    #[clap(short, long)]
    jitter: bool,

    /// Bursts per core; 0 runs until Ctrl-C.
    #[clap(short, long, default_value_t = 10_000)]
    iterations: u64,

    /// Log filter used when RUST_LOG is not set.
    #[clap(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn pool_config(&self) -> Result<MempoolConfig> {
        let mut config = match &self.config {
            Some(path) => MempoolConfig::from_file(path)?,
            None => MempoolConfig::default(),
        };
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        if let Some(cache_size) = self.cache_size {
            config.cache_size = cache_size;
        }
        if let Some(cores) = self.cores {
            config.cores = cores;
        }
        if let Some(size) = self.data_room_size {
            config.data_room_size = size;
        }
        config.pin_memory |= self.pin;
        Ok(config)
    }
}

/// Flush the local counter to the shared one every this many buffers.
const BULK: u64 = 4096;

#[derive(Clone, Copy)]
struct Load {
    burst: usize,
    jitter: bool,
    iterations: u64,
}

fn worker(
    pool: Mempool,
    core: usize,
    load: Load,
    term: Arc<AtomicBool>,
    counter: Arc<AtomicU64>,
) -> Result<CacheStats> {
    let mut cache = pool.core_cache(core)?;
    let mut rng = rand::rng();
    let mut burst = Vec::with_capacity(load.burst);
    let mut local = 0;
    let mut round: u64 = 0;

    while !term.load(Ordering::Relaxed) && (load.iterations == 0 || round < load.iterations) {
        let n = if load.jitter {
            rng.random_range(1..=load.burst)
        } else {
            load.burst
        };
        match cache.allocate_bulk(n, &mut burst) {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                round += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        for mbuf in burst.iter_mut() {
            mbuf.extend_from_slice(&round.to_be_bytes())?;
        }
        local += burst.len() as u64;
        cache.release_bulk(burst.drain(..))?;

        if local >= BULK {
            counter.fetch_add(local, Ordering::Relaxed);
            local = 0;
        }
        round += 1;
    }
    counter.fetch_add(local, Ordering::Relaxed);
    Ok(cache.stats())
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    if args.burst == 0 {
        bail!("burst must be at least 1");
    }
    let pool = Mempool::new(args.pool_config()?)?;
    let cores = pool.config().cores;

    println!("Test {} started with parameters:", pool.name());
    println!("* capacity: {}", pool.capacity());
    println!("* cache size: {}", pool.config().cache_size);
    println!("* cores: {}", cores);
    println!("* burst: {}{}", args.burst, if args.jitter { " (jitter)" } else { "" });
    if args.iterations == 0 {
        println!("* iterations: until Ctrl-C");
    } else {
        println!("* iterations: {}", args.iterations);
    }

    let term = Arc::new(AtomicBool::new(false));
    {
        let term = term.clone();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
        })?;
    }

    let totals: Vec<Arc<AtomicU64>> = (0..cores).map(|_| Arc::new(AtomicU64::new(0))).collect();

    let done = Arc::new(AtomicBool::new(false));
    let stats_handle = {
        let totals = totals.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut old_total = 0;
            while !done.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(1));
                let sum: u64 = totals.iter().map(|c| c.load(Ordering::Relaxed)).sum();
                println!("Aggregated buf/sec: {}", sum.saturating_sub(old_total));
                old_total = sum;
            }
        })
    };

    let load = Load {
        burst: args.burst,
        jitter: args.jitter,
        iterations: args.iterations,
    };
    let start = Instant::now();
    let handles: Vec<_> = (0..cores)
        .map(|core| {
            let pool = pool.clone();
            let term = term.clone();
            let counter = totals[core].clone();
            thread::spawn(move || worker(pool, core, load, term, counter))
        })
        .collect();

    let mut results = Vec::with_capacity(cores);
    for handle in handles {
        results.push(handle.join().map_err(|_| anyhow!("worker thread panicked"))?);
    }
    done.store(true, Ordering::SeqCst);
    stats_handle
        .join()
        .map_err(|_| anyhow!("stats thread panicked"))?;
    let elapsed = start.elapsed();

    let mut total = 0;
    for (core, res) in results.into_iter().enumerate() {
        let stats = res?;
        total += stats.allocs;
        println!(
            "Core {core}: allocs {} failed {} releases {} refills {} flushes {}",
            stats.allocs, stats.alloc_failures, stats.releases, stats.refills, stats.flushes
        );
        if stats.alloc_failures > 0 {
            warn!(core, failures = stats.alloc_failures, "core saw an exhausted pool");
        }
    }
    info!(total, elapsed = ?elapsed, "stress run finished");
    println!(
        "Shared ring: {}/{} free, {:.0} buf/sec overall",
        pool.shared_available(),
        pool.capacity(),
        total as f64 / elapsed.as_secs_f64()
    );

    if pool.shared_available() != pool.capacity() {
        bail!(
            "pool did not return to full capacity: {} of {} free",
            pool.shared_available(),
            pool.capacity()
        );
    }
    Ok(())
}
