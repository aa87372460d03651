//! flowtask - CLI

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowtask::util::config::{apply_env_overrides, load_config_or_default, CONFIG_FILE};
use flowtask::util::logger;
use flowtask::{TaskGraph, WorkerPool, NAME, VERSION};
use tracing::info;

/// Dependency-graph task scheduler
#[derive(Parser, Debug)]
#[command(name = "flowtask")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Number of worker threads (overrides config file and environment)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a synthetic per-frame workload
    Demo {
        /// Number of frames to run
        #[arg(long, default_value_t = 8)]
        frames: u64,

        /// Pixels per frame processed by the parallel-for stage
        #[arg(long, default_value_t = 4096)]
        width: usize,
    },

    /// Print a snapshot of a freshly started pool
    Status {
        /// Print JSON instead of log lines
        #[arg(long)]
        json: bool,
    },
}

/// Frame-local data kept alive by the frame graph.
struct FrameBuffer {
    pixels: Vec<AtomicU64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let mut config = load_config_or_default(&path)
        .with_context(|| format!("Failed to load config: {}", path.display()))?;
    apply_env_overrides(&mut config).context("Invalid environment override")?;
    if let Some(workers) = args.workers {
        config.scheduler.num_workers = workers;
    }

    if args.verbose {
        logger::init_debug();
    } else {
        logger::init_with_level(config.log.level);
    }

    let pool = WorkerPool::new(config.scheduler).context("Failed to start worker pool")?;

    match args.command {
        Commands::Demo { frames, width } => run_demo(&pool, frames, width)?,
        Commands::Status { json } => {
            if json {
                let status = serde_json::to_string_pretty(&pool.status())
                    .context("Failed to serialize pool status")?;
                println!("{status}");
            } else {
                pool.log_status();
            }
        },
    }

    pool.shutdown();
    Ok(())
}

fn run_demo(
    pool: &WorkerPool,
    frames: u64,
    width: usize,
) -> Result<()> {
    let started = Instant::now();
    let checksum = Arc::new(AtomicU64::new(0));

    for frame in 0..frames {
        let buffer = Arc::new(FrameBuffer {
            pixels: (0..width).map(|_| AtomicU64::new(0)).collect(),
        });
        let graph = pool.new_graph(format!("frame-{frame}"));
        graph.add_resource(buffer.clone());

        let checksum = checksum.clone();
        graph.setup_functor(move |graph| build_frame(graph, frame, buffer, checksum));
        graph
            .run_and_wait()
            .with_context(|| format!("Frame {frame} failed"))?;
    }

    let elapsed = started.elapsed();
    let stats = pool.stats().snapshot();
    info!(
        frames,
        width,
        elapsed_ms = elapsed.as_millis() as u64,
        executed = stats.nodes_executed,
        peak = stats.peak_parallelism,
        "demo finished"
    );
    println!(
        "{frames} frame(s) in {:.2?} ({:.2?}/frame), checksum {}",
        elapsed,
        elapsed / frames.max(1) as u32,
        checksum.load(Ordering::SeqCst)
    );
    Ok(())
}

/// Per-frame structure, decided when the frame starts.
fn build_frame(
    graph: &TaskGraph,
    frame: u64,
    buffer: Arc<FrameBuffer>,
    checksum: Arc<AtomicU64>,
) -> Result<()> {
    let cull = graph.new_task();
    cull.name("cull").functor(|| {});

    let upload = graph.new_task();
    upload
        .name("upload")
        .functor(|| {})
        .signal_event("uploaded", frame)?;

    let shade = graph.new_task_parallel_for();
    let pixels = buffer.clone();
    shade
        .name("shade")
        .job_count(buffer.pixels.len())
        .func(move |i| {
            pixels.pixels[i].store((i as u64) ^ frame, Ordering::Relaxed);
        })
        .depends_on(&cull)?
        .wait_on_event("uploaded", frame)?;

    let present = graph.new_task();
    present
        .name("present")
        .functor(move || {
            let sum: u64 = buffer
                .pixels
                .iter()
                .map(|p| p.load(Ordering::Relaxed))
                .sum();
            checksum.fetch_add(sum, Ordering::SeqCst);
        })
        .depends_on(&shade)?
        .pin_to_main_thread()?;

    Ok(())
}
