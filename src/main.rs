//! TEM emulator daemon.
//!
//! Serves the TEM control and camera protocols on two TCP ports until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use tem_emulator::config::Settings;
use tem_emulator::emulator::Emulator;
use tem_emulator::logging;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command line arguments. Flags override the config file and environment.
#[derive(Parser, Debug)]
#[command(author, version, about = "Emulated TEM and camera servers")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the TEM control port
    #[arg(long)]
    tem_port: Option<u16>,

    /// Override the camera port
    #[arg(long)]
    camera_port: Option<u16>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(port) = self.tem_port {
            settings.tem.port = port;
        }
        if let Some(port) = self.camera_port {
            settings.camera.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.application.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings =
        Settings::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut settings);
    settings.validate().context("invalid command line overrides")?;

    logging::init_from_config(&settings)?;
    tracing::info!(config = ?args.config, "Starting TEM emulator");

    let emulator = Emulator::start(settings).await?;
    emulator
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await?;
    Ok(())
}
