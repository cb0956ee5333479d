/*
This program generates random input partitions for a distributed sort and
stores them in the local filesystem, optionally with one worker config per rank.
*/

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, ValueEnum};
use distsort_core::config::{LocalConfig, SortConfig, TcpConfig, WorkerConfig};
use distsort_core::storage::{LocalPartitionStore, PartitionStore};
use log::info;
use rand::prelude::*;
use rand_distr::Normal;
use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, TerminalMode, TermLogger};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Distribution {
    Uniform,
    Normal,
}

/// Program to generate per-worker input partitions for distsort.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The number of workers
    #[arg(short, long)]
    workers: usize,

    /// The mean number of elements per worker
    #[arg(short = 'n', long)]
    per_worker: usize,

    /// Draw each partition size uniformly from [1, 2 * per_worker]
    #[arg(long, default_value_t = false)]
    skew: bool,

    /// How element values are drawn
    #[arg(short, long, value_enum, default_value_t = Distribution::Uniform)]
    distribution: Distribution,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Directory the partitions are written to
    #[arg(short, long, default_value = "data")]
    root: PathBuf,

    /// The prefix for the output files
    #[arg(short, long, default_value_t = ("distsort-").to_string())]
    prefix: String,

    /// Also write worker-{rank}.json configs for a loopback mesh starting at this port
    #[arg(long)]
    base_port: Option<u16>,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn partition_sizes(rng: &mut SmallRng, args: &Args) -> Vec<usize> {
    (0..args.workers)
        .map(|_| {
            if args.skew {
                rng.random_range(1..=2 * args.per_worker.max(1))
            } else {
                args.per_worker.max(1)
            }
        })
        .collect()
}

fn draw(
    rng: &mut SmallRng,
    len: usize,
    distribution: Distribution,
) -> Result<Vec<i64>, rand_distr::NormalError> {
    let values = match distribution {
        Distribution::Uniform => (0..len)
            .map(|_| rng.random_range(-1_000_000..1_000_000))
            .collect(),
        Distribution::Normal => {
            let normal = Normal::new(0.0f64, 1.0e5)?;
            (0..len).map(|_| rng.sample(normal).round() as i64).collect()
        }
    };
    Ok(values)
}

fn write_worker_configs(args: &Args, base_port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let peers: Vec<String> = (0..args.workers)
        .map(|rank| format!("127.0.0.1:{}", base_port as usize + rank))
        .collect();
    for rank in 0..args.workers {
        let config = WorkerConfig {
            rank,
            tcp: TcpConfig::new(peers.clone()),
            sort: SortConfig::default().with_timeout_ms(60_000),
            storage: LocalConfig::new(&args.root, &args.prefix),
            input_id: format!("input-{}", rank),
            output_id: format!("sorted-{}", rank),
            timings_csv: None,
        };
        let path = args.root.join(format!("worker-{}.json", rank));
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        info!("[Main] Wrote {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    CombinedLogger::init(vec![TermLogger::new(
        args.log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])?;

    if args.workers == 0 {
        return Err("need at least one worker".into());
    }

    let start = Instant::now();
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let sizes = partition_sizes(&mut rng, &args);
    let store = LocalPartitionStore::<i64>::new(&LocalConfig::new(Path::new(&args.root), &args.prefix));

    info!(
        "[Main] Generating {} elements over {} workers",
        sizes.iter().sum::<usize>(),
        args.workers
    );
    for (rank, len) in sizes.iter().enumerate() {
        let partition = draw(&mut rng, *len, args.distribution)?;
        let id = format!("input-{}", rank);
        store.write(&id, &partition).await?;
        info!(
            "[Main] Wrote {} elements to {}",
            len,
            store.file_path(&id).display()
        );
    }

    if let Some(base_port) = args.base_port {
        write_worker_configs(&args, base_port)?;
    }

    info!("[Main] Done in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}
