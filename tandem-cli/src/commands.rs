//! Command execution.

use crate::Commands;
use bytes::Bytes;
use colored::Colorize;
use std::time::Duration;
use tandem_client::{Client, ClientError, Established};
use tandem_protocol::{TlsResult, VERSION_TABLE};
use tokio::sync::broadcast::error::RecvError;

/// Executes a command on an established client and returns the formatted output.
pub async fn execute(
    client: &Client,
    established: &Established,
    cmd: Commands,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Versions => Ok(version_table()),

        Commands::Probe => Ok(describe(established)),

        Commands::Call {
            payload,
            timeout_ms,
            json,
        } => {
            let payload = read_payload(&payload)?;
            let response = match timeout_ms {
                Some(ms) => {
                    client
                        .call_with_timeout(payload, Duration::from_millis(ms))
                        .await?
                }
                None => client.call(payload).await?,
            };
            if json {
                let value: serde_json::Value = serde_json::from_slice(&response)?;
                Ok(serde_json::to_string_pretty(&value)?)
            } else {
                Ok(String::from_utf8_lossy(&response).into_owned())
            }
        }

        Commands::Ping { count } => {
            let mut lines = Vec::new();
            for seq in 1..=count.max(1) {
                let rtt = client.ping().await?;
                lines.push(format!(
                    "{} seq={} time={:.3}ms",
                    "PONG".green(),
                    seq,
                    rtt.as_secs_f64() * 1000.0
                ));
            }
            Ok(lines.join("\n"))
        }

        Commands::Watch => {
            let mut events = client.subscribe_events();
            eprintln!("{}", describe(established));
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(payload) => println!("{}", String::from_utf8_lossy(&payload)),
                        Err(RecvError::Lagged(n)) => {
                            eprintln!("{}: lagged {} events", "Warning".yellow(), n);
                        }
                        Err(RecvError::Closed) => {
                            return Err(ClientError::ConnectionClosed.into());
                        }
                    },
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{}", "Stopping watch...".dimmed());
                        return Ok(String::new());
                    }
                }
            }
        }
    }
}

/// Describes the negotiated session parameters.
fn describe(established: &Established) -> String {
    let tls = match established.tls {
        Some(TlsResult::Ssl) => "encrypted".green().to_string(),
        Some(TlsResult::Plaintext) => "plaintext".yellow().to_string(),
        Some(TlsResult::FailedNegotiation) => "failed".red().to_string(),
        None => "not available".dimmed().to_string(),
    };
    let capabilities = established.version.capabilities().names();
    format!(
        "{} {}\n  TLS: {}\n  capabilities: {}",
        "Connected using".green(),
        established.version.to_string().cyan(),
        tls,
        if capabilities.is_empty() {
            "none".to_string()
        } else {
            capabilities.join(", ")
        }
    )
}

/// Renders the version capability table.
pub fn version_table() -> String {
    let mut out = format!(
        "{:<8} {:<62} {}",
        "VERSION".bold(),
        "CAPABILITIES".bold(),
        "QUIRKS".bold()
    );
    for entry in VERSION_TABLE.iter() {
        let capabilities = entry.capabilities.names();
        let quirks = entry.quirks.names();
        out.push_str(&format!(
            "\n{:<8} {:<62} {}",
            entry.version.to_string(),
            if capabilities.is_empty() {
                "-".to_string()
            } else {
                capabilities.join(", ")
            },
            if quirks.is_empty() {
                "-".to_string()
            } else {
                quirks.join(", ")
            }
        ));
    }
    out
}

/// Reads a payload argument; `@path` reads the file.
fn read_payload(arg: &str) -> Result<Bytes, std::io::Error> {
    match arg.strip_prefix('@') {
        Some(path) => Ok(Bytes::from(std::fs::read(path)?)),
        None => Ok(Bytes::copy_from_slice(arg.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_table_lists_every_version() {
        colored::control::set_override(false);
        let table = version_table();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 1 + VERSION_TABLE.len());
        assert!(lines[1].starts_with("v1"));
        assert!(lines[1].contains("NARROW_PAYLOAD_LENGTH"));
        assert!(lines[3].contains("TLS_UPGRADE"));
        assert!(lines[3].contains("ENUMS_AS_STRINGS"));
        assert!(lines[5].contains("COMPOUND_UUID"));
    }

    #[test]
    fn test_read_payload_literal() {
        assert_eq!(read_payload("hello").unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_read_payload_missing_file() {
        assert!(read_payload("@/nonexistent/payload.bin").is_err());
    }
}
