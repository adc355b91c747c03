//! chunkload command-line entry point.

mod app;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::{Args, Config};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = match &args.config {
        Some(path) => path.clone(),
        None => config::config_path()?,
    };
    let mut config = Config::load(&path)?;
    args.apply(&mut config);

    // RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        "starting chunkload"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, args.files))?;

    Ok(())
}
