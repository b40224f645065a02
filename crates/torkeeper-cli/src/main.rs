//! torkeeper command-line interface
//!
//! Runs a supervised Tor daemon in the foreground, optionally publishing a
//! local port as an onion service, or fetches a single URL through Tor.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

/// torkeeper - run and drive an embedded Tor daemon
#[derive(Parser)]
#[command(name = "torkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, default_value = "~/.torkeeper")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

/// Daemon options shared by every command.
#[derive(Args)]
pub struct DaemonArgs {
    /// SOCKS5 proxy port
    #[arg(long, default_value = "9050")]
    pub socks_port: u16,

    /// Fixed control port (picked by tor when omitted)
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Bootstrap timeout in milliseconds
    #[arg(long, default_value = "120000")]
    pub timeout_ms: u32,

    /// Attach to an already running tor at this control address instead of
    /// launching one
    #[arg(long)]
    pub attach: Option<SocketAddr>,

    /// Control auth cookie file for --attach
    #[arg(long, requires = "attach", conflicts_with = "password")]
    pub cookie: Option<PathBuf>,

    /// Control password for --attach
    #[arg(long, requires = "attach")]
    pub password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start tor and keep it running until Ctrl-C
    Run {
        #[command(flatten)]
        daemon: DaemonArgs,

        /// Publish this local port as an onion service
        #[arg(long)]
        target_port: Option<u16>,

        /// Port on the onion address (defaults to the target port)
        #[arg(long, requires = "target_port")]
        virtual_port: Option<u16>,

        /// Hex-encoded 64-byte expanded secret key for the onion service
        #[arg(long, requires = "target_port")]
        key: Option<String>,
    },

    /// Fetch a URL through tor and print the response
    Fetch {
        #[command(flatten)]
        daemon: DaemonArgs,

        /// URL to fetch (.onion hosts allowed)
        url: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request header as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(long)]
        body: Option<String>,

        /// Request timeout in milliseconds
        #[arg(long, default_value = "60000")]
        request_timeout_ms: u64,
    },

    /// Print the onion address for a hex-encoded secret key
    Address {
        /// Hex-encoded 64-byte expanded secret key
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Expand data directory
    let data_dir = shellexpand::tilde(&cli.data_dir).to_string();

    match cli.command {
        Commands::Run {
            daemon,
            target_port,
            virtual_port,
            key,
        } => {
            commands::run(&data_dir, &daemon, target_port, virtual_port, key.as_deref()).await?;
        }
        Commands::Fetch {
            daemon,
            url,
            method,
            headers,
            body,
            request_timeout_ms,
        } => {
            let request = commands::FetchRequest {
                url,
                method,
                headers,
                body,
                timeout_ms: request_timeout_ms,
            };
            commands::fetch(&data_dir, &daemon, request).await?;
        }
        Commands::Address { key } => {
            commands::show_address(&key)?;
        }
    }

    Ok(())
}
