use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use warden::directory::DirectoryDump;
use warden::{Config, Platform};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Monitor of a distributed isolate platform", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a monitor until interrupted or told to stop
    Run {
        #[arg(short, long, help = "TOML configuration file")]
        config: Option<PathBuf>,
    },
    /// Prints the directory known by a running isolate
    Dump {
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await?,
        Commands::Dump { host, port } => dump(&host, port).await?,
    }

    Ok(())
}

async fn run(path: Option<PathBuf>) -> Result<()> {
    let config = match path {
        Some(path) => Config::from_file(&path)?,
        None => Config::from_env()?,
    };

    let platform = Platform::new(config);
    platform.start().await?;

    let cancel = platform.cancel_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = cancel.cancelled() => {}
    }

    platform.stop().await;
    Ok(())
}

async fn dump(host: &str, port: u16) -> Result<()> {
    let url = format!("http://{}:{}/directory", host, port);
    let dump: DirectoryDump = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {}", url))?
        .error_for_status()?
        .json()
        .await
        .context("Invalid directory dump")?;

    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}
