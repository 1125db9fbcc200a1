//! The `veilnet` endpoint binary.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use veilnet_cli::{exit, load_config, logging};
use veilnet_core::config::Config;
use veilnet_core::{endpoint, Identity};
use veilnet_device::FrameDevice;

#[derive(Parser)]
#[command(name = "veilnet", about = "Post-quantum layer-2 private network endpoint")]
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

    let config: Config = match load_config(cli.config.as_deref()) {
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

    if let Err(e) = config.validate() {
        eprintln!("{e}");
        return ExitCode::from(exit::CONFIG);
    }

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("{e}");
        return ExitCode::from(exit::CONFIG);
    }

    let identity = match Identity::load_or_generate(
        Path::new(&config.identity.keys_dir),
        &config.identity.private_key_file,
        &config.identity.client_id_file,
    ) {
        Ok(identity) => Arc::new(identity),
        Err(e) => {
            error!(error = %e, "identity store failure");
            return ExitCode::from(exit::IDENTITY);
        }
    };
    info!(id = %hex_id(&identity), "identity loaded");

    if cli.gen_keys {
        return ExitCode::from(exit::OK);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "runtime start failed");
            return ExitCode::from(exit::FATAL);
        }
    };

    runtime.block_on(async move {
        let device = match open_device(&config) {
            Ok(device) => device,
            Err(e) => {
                error!(error = %e, "cannot open virtual device");
                return ExitCode::from(exit::FATAL);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        });

        match endpoint::run(config, identity, device, shutdown_rx).await {
            Ok(()) => ExitCode::from(exit::OK),
            Err(e) => {
                error!(error = %e, "endpoint failed");
                ExitCode::from(exit::FATAL)
            }
        }
    })
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn open_device(config: &Config) -> Result<Box<dyn FrameDevice>, String> {
    use veilnet_device::{TapConfig, TapDevice};

    let ip_addr = config
        .tap
        .ip_addr
        .parse()
        .map_err(|e| format!("tap.ip_addr: {e}"))?;
    let netmask = config
        .tap
        .netmask
        .parse()
        .map_err(|e| format!("tap.netmask: {e}"))?;

    let device = TapDevice::open(&TapConfig {
        name: config.tap.name.clone(),
        mtu: config.tap.mtu,
        ip_addr,
        netmask,
    })
    .map_err(|e| e.to_string())?;

    Ok(Box::new(device))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn open_device(_config: &Config) -> Result<Box<dyn FrameDevice>, String> {
    Err("TAP devices are not supported on this platform".to_string())
}

fn hex_id(identity: &Identity) -> String {
    let id = identity.endpoint_id();
    id.iter().take(8).map(|b| format!("{b:02x}")).collect()
}
