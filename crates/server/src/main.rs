//! viiper
//!
//! Virtual USB input device server. `viiper server` runs the USB/IP and
//! management listeners; `viiper proxy` is a transparent TCP forwarder
//! for inspecting USB/IP traffic; `viiper config init` writes the default
//! configuration file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use server::config::ServerConfig;
use server::plugin::PluginSet;
use server::proxy::{self, ProxyConfig};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "viiper")]
#[command(author, version, about = "Virtual USB input device server")]
#[command(long_about = "
Synthesizes virtual USB input devices (keyboard, mouse, gamepad) and
exports them over the USB/IP protocol. Producers create and drive devices
through the management port; USB/IP initiators attach them like hardware.

EXAMPLES:
    # Run both listeners with the default config
    viiper server

    # Run without the authenticated session layer (trusted networks only)
    viiper server --no-auth

    # Put a debugging proxy in front of the USB/IP port
    viiper proxy --listen 127.0.0.1:3241 --upstream 127.0.0.1:3240

    # Write the default configuration file
    viiper config init
")]
struct Args {
    /// Path to configuration file (`~` is expanded)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the USB/IP and management listeners
    Server {
        /// USB/IP listener address
        #[arg(long, value_name = "ADDR")]
        usbip_addr: Option<String>,

        /// Management + stream listener address
        #[arg(long, value_name = "ADDR")]
        control_addr: Option<String>,

        /// Disable the authenticated session layer
        #[arg(long)]
        no_auth: bool,
    },

    /// Run the transparent pass-through TCP proxy
    Proxy {
        /// Listen address (falls back to VIIPER_PROXY_ADDR)
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Upstream address (falls back to VIIPER_PROXY_UPSTREAM)
        #[arg(long, value_name = "ADDR")]
        upstream: Option<String>,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration file
    Init {
        /// Destination path; defaults to the platform config directory
        #[arg(long, value_name = "PATH")]
        path: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if let Some(ref path) = args.config {
        ServerConfig::load(Some(ServerConfig::expand_path(path)))
            .context("failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.server.log_level.clone());
    setup_logging(&log_level).context("failed to setup logging")?;

    info!("viiper v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Server {
            usbip_addr,
            control_addr,
            no_auth,
        } => {
            if let Some(addr) = usbip_addr {
                config.server.usbip_addr = addr;
            }
            if let Some(addr) = control_addr {
                config.server.control_addr = addr;
            }
            if no_auth {
                config.security.auth = false;
            }
            config.validate()?;
            run_server(config).await
        }
        Command::Proxy { listen, upstream } => {
            let proxy_config = ProxyConfig::resolve(listen, upstream)?;
            proxy::run(proxy_config).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init { path } => {
                let path = path
                    .map(|p| ServerConfig::expand_path(&p))
                    .unwrap_or_else(ServerConfig::default_path);
                ServerConfig::default().save(&path)?;
                println!("configuration written to {}", path.display());
                Ok(())
            }
        },
    }
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let auth = if config.security.auth {
        let password = common::load_or_generate_password(config.security.key_file.as_deref())
            .context("failed to load server password")?;
        Some(common::SessionAuth::from_password(&password))
    } else {
        info!("session layer disabled, connections are unauthenticated");
        None
    };

    let handle = server::bind(&config, PluginSet::builtin(), auth)
        .await
        .context("failed to start listeners")?;

    info!("press ctrl-c to shut down");
    match signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c, shutting down"),
        Err(e) => error!("failed to wait for ctrl-c: {}", e),
    }

    handle.shutdown().await;
    Ok(())
}
