use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use netsentry::api;
use netsentry::capture;
use netsentry::config::Config;
use netsentry::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "netsentry", about = "Real-time network intrusion detection pipeline")]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Force debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the detection pipeline and the API (default)
    Run {
        /// Start without capturing; capture can be started over the API
        #[arg(long)]
        no_capture: bool,
    },
    /// List capture-capable interfaces and exit
    Interfaces,
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };

    match cli.command.unwrap_or(Command::Run { no_capture: false }) {
        Command::Run { no_capture } => run_pipeline(config, no_capture).await,
        Command::Interfaces => {
            for name in capture::list_interfaces()? {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

async fn run_pipeline(config: Config, no_capture: bool) -> Result<()> {
    let bind_addr = config.api.bind_addr();
    let pipeline = Arc::new(Pipeline::new(config).await?);

    if !no_capture {
        if let Err(e) = pipeline.start() {
            // The API still serves status and analyze; capture can be
            // retried from there once permissions are sorted.
            warn!("pipeline not started: {}", e);
        }
    }

    let server = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { api::serve(pipeline, &bind_addr).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    pipeline.stop();
    server.abort();
    Ok(())
}
