mod commands;
mod worker_entry;

use clap::{Parser, Subcommand};

use commands::{run_config, run_scan, run_stats, ConfigArgs, ScanArgs, StatsArgs};
use worker_entry::worker_main;

/// Verify real media specs from torrent data.
///
/// Inputs can be info hashes, magnet links, .torrent files, or directories
/// containing .torrent files.
#[derive(Parser)]
#[command(name = "truespec", version, about, max_term_width = 100)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Partially download torrents and extract verified media metadata.
    Scan(ScanArgs),
    /// Display accumulated scan statistics.
    Stats(StatsArgs),
    /// Show or change persisted TrueSpec settings.
    Config(ConfigArgs),
    /// Show version.
    Version,
    /// Internal: run a single scan as an isolated worker child.
    #[command(name = "_worker", hide = true)]
    Worker,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Worker => worker_main(),
        Command::Version => println!("truespec {}", env!("CARGO_PKG_VERSION")),
        Command::Scan(args) => run_blocking(|| Box::pin(run_scan(args))),
        Command::Stats(args) => {
            if let Err(e) = run_stats(args) {
                eprintln!("Error: {e:#}");
                std::process::exit(1);
            }
        }
        Command::Config(args) => {
            if let Err(e) = run_config(args) {
                eprintln!("Error: {e:#}");
                std::process::exit(1);
            }
        }
    }
}

fn run_blocking<F>(f: F)
where
    F: FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>>>>,
{
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(f()) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
