//! The `veilnet-relayd` rendezvous server binary.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info};
use veilnet_cli::{exit, load_config, logging};
use veilnet_core::config::LoggingSection;
use veilnet_core::Identity;
use veilnet_relay::{RelayServer, RelayServerConfig};

/// The relay's configuration file shape
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RelayFileConfig {
    #[serde(default)]
    server: RelayServerConfig,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Parser)]
#[command(name = "veilnet-relayd", about = "VEILNET rendezvous relay server")]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    show_config: bool,

    /// Create identity files if absent, then exit
    #[arg(long)]
    gen_keys: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config: RelayFileConfig = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(exit::CONFIG);
        }
    };

    if cli.show_config {
        match serde_yaml::to_string(&config) {
            Ok(yaml) => {
                print!("{yaml}");
                return ExitCode::from(exit::OK);
            }
            Err(e) => {
                eprintln!("cannot render configuration: {e}");
                return ExitCode::from(exit::CONFIG);
            }
        }
    }

    if let Err(e) = config.server.validate() {
        eprintln!("{e}");
        return ExitCode::from(exit::CONFIG);
    }

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("{e}");
        return ExitCode::from(exit::CONFIG);
    }

    let identity = match Identity::load_or_generate(
        Path::new(&config.server.keys_dir),
        "identity.key",
        "endpoint_id",
    ) {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "identity store failure");
            return ExitCode::from(exit::IDENTITY);
        }
    };

    if cli.gen_keys {
        return ExitCode::from(exit::OK);
    }

    let server = match RelayServer::new(config.server, identity) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(error = %e, "relay setup failed");
            return ExitCode::from(exit::CONFIG);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "runtime start failed");
            return ExitCode::from(exit::FATAL);
        }
    };

    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        });

        match server.run(shutdown_rx).await {
            Ok(()) => ExitCode::from(exit::OK),
            Err(e) => {
                error!(error = %e, "relay failed");
                ExitCode::from(exit::FATAL)
            }
        }
    })
}
