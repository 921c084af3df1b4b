//! tandem-cli - Command-line interface for tandem
//!
//! Probes servers, issues calls and inspects the version table.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tandem_client::{Client, ConnectionConfig, TlsClientConfig};
use tandem_protocol::ProtocolVersion;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tandem-cli")]
#[command(about = "Command-line interface for the tandem RPC transport")]
#[command(version)]
pub struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7450", env = "TANDEM_SERVER")]
    server: SocketAddr,

    /// Lowest protocol version to offer
    #[arg(long, value_parser = parse_version)]
    min_version: Option<ProtocolVersion>,

    /// Highest protocol version to offer
    #[arg(long, value_parser = parse_version)]
    max_version: Option<ProtocolVersion>,

    // ===== TLS Options =====
    /// Offer the in-band TLS upgrade
    #[arg(long, env = "TANDEM_TLS")]
    tls: bool,

    /// Refuse to continue without TLS
    #[arg(long)]
    tls_required: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "TANDEM_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "TANDEM_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "TANDEM_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server IP)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect, report the negotiated parameters and disconnect
    Probe,

    /// Send a request and print the response
    Call {
        /// Payload text (or @file to read from file)
        payload: String,

        /// Per-call timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Pretty-print the response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Measure round trips with empty calls
    Ping {
        /// Number of calls
        #[arg(short, long, default_value = "1")]
        count: u32,
    },

    /// Print server events until interrupted
    Watch,

    /// Print the protocol version table
    Versions,
}

fn parse_version(s: &str) -> Result<ProtocolVersion, String> {
    let raw: u8 = s
        .trim_start_matches('v')
        .parse()
        .map_err(|_| format!("invalid version: {}", s))?;
    ProtocolVersion::new(raw)
        .filter(|v| v.is_known())
        .ok_or_else(|| format!("unknown version: {}", s))
}

fn connection_config(cli: &Cli) -> Result<ConnectionConfig, String> {
    let mut config = ConnectionConfig::new(cli.server);

    let min = cli.min_version.unwrap_or(ProtocolVersion::MIN);
    let max = cli.max_version.unwrap_or(ProtocolVersion::MAX);
    config = config.with_versions(min, max);

    let wants_tls = cli.tls
        || cli.tls_required
        || cli.ca_cert.is_some()
        || cli.client_cert.is_some()
        || cli.insecure;
    if wants_tls {
        let mut tls = TlsClientConfig::new().with_required(cli.tls_required);
        if let Some(ref path) = cli.ca_cert {
            tls = tls.with_ca_cert(path);
        }
        match (&cli.client_cert, &cli.client_key) {
            (Some(cert), Some(key)) => tls = tls.with_client_cert(cert, key),
            (None, None) => {}
            _ => return Err("--client-cert and --client-key must be used together".into()),
        }
        if cli.insecure {
            tls = tls.with_insecure();
        }
        if let Some(ref name) = cli.server_name {
            tls = tls.with_server_name(name);
        }
        config = config.with_tls(tls);
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Versions = cli.command {
        println!("{}", commands::version_table());
        return Ok(());
    }

    let config = match connection_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(2);
        }
    };
    let client = Client::new(config);

    let established = client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    let result = commands::execute(&client, &established, cli.command).await;
    let _ = client.close().await;

    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
