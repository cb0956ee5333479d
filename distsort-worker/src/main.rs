use std::path::PathBuf;

use clap::Parser;
use distsort_core::config::WorkerConfig;
use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, TerminalMode, TermLogger};

mod handler;

/// One worker of a distributed sort over a TCP mesh.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to this worker's JSON config
    #[arg(short, long)]
    config: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
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

    let config = WorkerConfig::from_json_file(&args.config)?;
    let report = handler::run_worker(config).await?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}
