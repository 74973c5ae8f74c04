use anyhow::{Context, Result};
use aurora_core::config::{Properties, KNOWN_KEYS};
use aurora_core::IcebergServerConfig;
use aurora_server::ServerBuilder;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Aurora - Iceberg REST catalog server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "AURORA_CONF", default_value = "conf/aurora.yaml")]
    config: PathBuf,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("aurora=info,tower_http=info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .init();
    }
}

fn load_config(args: &Args) -> Result<IcebergServerConfig> {
    let mut props = Properties::from_file(&args.config)
        .with_context(|| format!("Failed to read config file: {:?}", args.config))?;
    props.apply_env_overrides(KNOWN_KEYS);

    if let Some(host) = &args.host {
        props.set("host", host.as_str());
    }
    if let Some(port) = args.port {
        props.set("http.port", port.to_string());
    }

    IcebergServerConfig::from_properties(props).context("Invalid configuration")
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_config(&args)?;

    info!("Starting Aurora Iceberg REST server");
    info!("Configuration loaded from {:?}", args.config);
    info!("Bind address: {}", config.server.bind_address());
    info!("HTTPS enabled: {}", config.server.enable_https);

    let server = ServerBuilder::new(config)
        .build()
        .context("Failed to build server")?;

    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
