//! Ignis CLI: declarative, resumable deployment orchestration.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "ignis",
    version,
    about = "Declarative deployment orchestration with a resumable journal"
)]
struct Cli {
    /// Log filter when IGNIS_LOG and RUST_LOG are unset (e.g. "info", "ignis=debug")
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: ignis::cli::Commands,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env("IGNIS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(&cli.log))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = ignis::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
