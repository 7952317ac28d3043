//! Gateway Service (gatewaysrv)
//!
//! Polls field devices and mirrors them into the state store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use tracing::{error, info, Level};

use common::LogConfig;
use gatewaysrv::runtime::check_devices;
use gatewaysrv::{AppConfig, Gateway, MemoryStore, RuntimeContext, TemplateCatalog};

/// Command-line arguments for gatewaysrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gatewaysrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Multi-protocol device gateway",
    long_about = None
)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = "config/gatewaysrv.yaml")]
    config: PathBuf,

    /// Templates directory (overrides `service.templates_dir`)
    #[arg(short = 't', long)]
    templates: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Validation mode - check configuration and templates, then exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(dir) = args.templates.clone() {
        config.service.templates_dir = dir;
    }
    if let Some(level) = args.log_level.clone() {
        config.logging.level = level;
    }

    let level: Level = config
        .logging
        .level
        .parse()
        .map_err(|_| anyhow!("Invalid log level '{}'", config.logging.level))?;
    common::logging::init_with_config(LogConfig {
        service_name: config.service.name.clone(),
        level,
        log_dir: config.logging.dir.clone(),
        file_format: config.logging.format,
        ansi: !args.no_color,
    })?;

    config.validate()?;
    let catalog = TemplateCatalog::load_dir(&config.service.templates_dir)?;

    let ctx = RuntimeContext::new(Arc::new(MemoryStore::new()))
        .with_error_log_interval(Duration::from_millis(config.runtime.error_log_interval_ms));

    // Validation mode: validate and exit
    if args.validate {
        let problems = check_devices(&config, &catalog, &ctx.protocols);
        for (path, e) in catalog.rejected() {
            error!("Template {}: {}", path.display(), e);
        }
        for (device, e) in &problems {
            error!("Device '{}': {}", device, e);
        }
        if !catalog.rejected().is_empty() || !problems.is_empty() {
            bail!(
                "Validation failed: {} templates rejected, {} devices invalid",
                catalog.rejected().len(),
                problems.len()
            );
        }
        info!(
            "Validation completed successfully: {} templates, {} devices",
            catalog.len(),
            config.devices.len()
        );
        return Ok(());
    }

    let gateway = Gateway::new(ctx);
    let failures = gateway.start(&config, &catalog).await;
    if !failures.is_empty() {
        error!("{} devices failed to start", failures.len());
    }

    let signal = common::shutdown::wait_for_shutdown().await;
    info!("Received {}, shutting down", signal);
    gateway.stop_all();

    // Background disconnects get a moment to close their links
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("Shutdown complete");
    Ok(())
}
