use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hexgraph_engine::{BackendConfig, OffloadBackend, SdkLibraries};

mod cli;

use cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("hexgraph v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => BackendConfig::from_json_file(path)?,
        None => BackendConfig::default(),
    };

    match cli.command {
        Command::Devices { format } => cli::print_devices(format)?,
        Command::Run {
            op,
            device,
            shape,
            n,
            broadcast,
            iterations,
            seed,
            format,
        } => {
            if let Some(device) = device {
                if device != config.device {
                    config.library_path = None;
                }
                config.device = device;
            }
            let shape = cli::parse_shape(&shape)?;
            let registry = Arc::new(SdkLibraries::new());
            let backend = OffloadBackend::open(config, registry)?;
            cli::run_op(&backend, op.into(), &shape, n, broadcast, iterations, seed, format)?;
            backend.finalize()?;
        }
    }

    Ok(())
}
