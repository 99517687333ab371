use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use smsgated::api::{generate_token, hash_token};
use smsgated::bootstrap::{restrict_umask, Server};
use smsgated::config::{check_permissions, Config};
use smsgated::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "smsgated")]
#[command(author, version, about = "SMS and USSD gateway for a pool of cellular modems")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/smsgated/smsgated.yaml")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an API token and print it with its hash for the config file
    HashToken {
        /// Hash this token instead of generating one
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::HashToken { token }) = args.command {
        let token = token.unwrap_or_else(generate_token);
        let hash = hash_token(&token).map_err(|e| anyhow::anyhow!("failed to hash token: {e}"))?;
        println!("token: {token}");
        println!("hash:  {hash}");
        return Ok(());
    }

    restrict_umask();
    check_permissions(&args.config)?;

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    init_tracing(&TracingConfig::from(&config.logging)).context("failed to initialize tracing")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        modems = config.modems.len(),
        "configuration loaded"
    );

    // Warnings raised while loading were emitted before tracing was up
    config.validate()?;

    // Validate only mode
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    Server::new(config).run().await
}
