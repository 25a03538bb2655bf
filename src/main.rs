//! peercall - peer-to-peer call negotiation core
//!
//! Runs offer/answer negotiation for one-to-one audio/video calls over an
//! out-of-band messaging channel. The CLI exercises the core against an
//! in-process simulated transport.

mod calling;
mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use calling::call_test::CallTestOptions;
use calling::signaling::InboundSignal;
use calling::MediaMode;
use config::Config;

#[derive(Parser)]
#[command(name = "peercall")]
#[command(about = "Peer-to-peer audio/video call negotiation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Load configuration from this file instead of the default location
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a loopback call between two in-process peers
    CallTest {
        /// Seconds to keep the call up once connected
        #[arg(short, long, default_value = "3")]
        duration: u64,

        /// Start the call without video
        #[arg(long)]
        audio_only: bool,

        /// Switch the caller's camera twice while connected
        #[arg(long)]
        toggle_camera: bool,
    },

    /// Show or initialize the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Decode an inbound signaling envelope
    Parse {
        /// JSON envelope, e.g. '{"info":{"topic":"usrX","seq":1,"what":"call","event":"accept"}}'
        json: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file (refuses to overwrite)
    Init,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::CallTest {
            duration,
            audio_only,
            toggle_camera,
        } => {
            let config = load_config(cli.config.as_ref()).context("Failed to load config")?;
            let options = CallTestOptions {
                media_mode: audio_only.then_some(MediaMode::AudioOnly),
                duration: Duration::from_secs(duration),
                toggle_camera,
            };
            let result = calling::call_test::run_call_test(&config, options).await?;
            anyhow::ensure!(result.connected, "Loopback call did not connect");
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = load_config(cli.config.as_ref()).context("Failed to load config")?;
                print!("{}", config.to_toml()?);
            }
            ConfigAction::Init => {
                let target = match &cli.config {
                    Some(path) => path.clone(),
                    None => Config::config_path()?,
                };
                anyhow::ensure!(!target.exists(), "{} already exists", target.display());
                let written = match cli.config {
                    Some(path) => {
                        Config::default().save_to(&path)?;
                        path
                    }
                    None => Config::default().save()?,
                };
                println!("Wrote {}", written.display());
            }
        },
        Commands::Parse { json } => match calling::parse_call_message(&json) {
            Some(InboundSignal::Message(msg)) => {
                println!("call={}", msg.key);
                println!("event={}", msg.event.name());
                if let Some(payload) = msg.event.payload() {
                    println!("payload={}", payload);
                }
            }
            Some(InboundSignal::Malformed { key, reason }) => {
                println!("call={}", key);
                println!("malformed={}", reason);
            }
            None => {
                println!("Not a call message");
            }
        },
    }

    Ok(())
}
