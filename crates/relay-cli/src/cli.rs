use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tr_transport::{CredentialMode, PollingConfig, SocketConfig, TransportConfig};

/// Env var holding a bearer token for the remote server.
pub const AUTH_TOKEN_ENV: &str = "RELAY_AUTH_TOKEN";

/// tr-relay: pipe JSON-RPC envelopes between stdin/stdout and a tool server.
#[derive(Debug, Parser)]
#[command(name = "tr-relay", version, about)]
pub struct Cli {
    /// TOML file with a `[transport]` table.  Takes precedence over the
    /// channel subcommand.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Extra header sent on every connection, e.g. `X-Team=tools`.  Repeatable.
    #[arg(long = "header", value_name = "KEY=VALUE")]
    pub headers: Vec<String>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub channel: Option<Channel>,
}

#[derive(Debug, Subcommand)]
pub enum Channel {
    /// Persistent WebSocket channel with reconnects.
    Socket {
        /// Endpoint, e.g. `ws://localhost:3210/rpc`.
        url: String,
        /// Send the token as a handshake header instead of a query parameter.
        #[arg(long)]
        header_credentials: bool,
        #[arg(long, default_value_t = 5)]
        max_reconnect_attempts: u32,
    },
    /// HTTP polling channel.
    Polling {
        /// Base URL, e.g. `http://localhost:3210`.
        url: String,
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
}

#[derive(Debug, Deserialize)]
struct RelayFile {
    transport: TransportConfig,
}

/// Resolve the transport config from the file or subcommand, then layer
/// `--header` flags and the auth token env var on top.
pub fn resolve(cli: &Cli) -> anyhow::Result<TransportConfig> {
    let mut config = match (&cli.config, &cli.channel) {
        (Some(path), _) => load_file(path)?,
        (None, Some(channel)) => from_channel(channel),
        (None, None) => bail!("either --config or a channel subcommand is required"),
    };

    let headers = headers_mut(&mut config);
    for raw in &cli.headers {
        let (key, value) = parse_header(raw)?;
        headers.insert(key, value);
    }

    let token = std::env::var(AUTH_TOKEN_ENV).unwrap_or_default();
    apply_token(headers, &token);

    Ok(config)
}

fn load_file(path: &Path) -> anyhow::Result<TransportConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let file: RelayFile = toml::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(file.transport)
}

fn from_channel(channel: &Channel) -> TransportConfig {
    match channel {
        Channel::Socket {
            url,
            header_credentials,
            max_reconnect_attempts,
        } => {
            let mut cfg = SocketConfig::new(url.clone());
            cfg.max_reconnect_attempts = *max_reconnect_attempts;
            if *header_credentials {
                cfg.credentials = CredentialMode::Header;
            }
            TransportConfig::Socket(cfg)
        }
        Channel::Polling { url, interval_ms } => {
            let mut cfg = PollingConfig::new(url.clone());
            cfg.poll_interval_ms = *interval_ms;
            TransportConfig::Polling(cfg)
        }
    }
}

fn headers_mut(config: &mut TransportConfig) -> &mut BTreeMap<String, String> {
    match config {
        TransportConfig::Socket(c) => &mut c.headers,
        TransportConfig::Polling(c) => &mut c.headers,
    }
}

/// Split `KEY=VALUE`.  Whitespace around both halves is trimmed.
pub fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("header `{raw}` must look like KEY=VALUE");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("header `{raw}` has an empty name");
    }
    Ok((key.to_owned(), value.trim().to_owned()))
}

/// An explicit `Authorization` header wins over the env token.
fn apply_token(headers: &mut BTreeMap<String, String>, token: &str) {
    let token = token.trim();
    if token.is_empty() {
        return;
    }
    let present = headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case("authorization"));
    if !present {
        headers.insert("Authorization".into(), format!("Bearer {token}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_header_splits_on_first_equals() {
        assert_eq!(
            parse_header("X-Trace = a=b").unwrap(),
            ("X-Trace".to_owned(), "a=b".to_owned())
        );
        assert!(parse_header("no-separator").is_err());
        assert!(parse_header("=value").is_err());
    }

    #[test]
    fn token_does_not_override_explicit_authorization() {
        let mut headers = BTreeMap::new();
        headers.insert("authorization".to_owned(), "Basic xyz".to_owned());
        apply_token(&mut headers, "abc");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["authorization"], "Basic xyz");
    }

    #[test]
    fn token_becomes_bearer_header() {
        let mut headers = BTreeMap::new();
        apply_token(&mut headers, " abc ");
        assert_eq!(headers["Authorization"], "Bearer abc");

        let mut empty = BTreeMap::new();
        apply_token(&mut empty, "  ");
        assert!(empty.is_empty());
    }

    #[test]
    fn socket_subcommand_builds_socket_config() {
        let cli = Cli::parse_from([
            "tr-relay",
            "--header",
            "X-Team=tools",
            "socket",
            "ws://127.0.0.1:9/rpc",
            "--header-credentials",
            "--max-reconnect-attempts",
            "2",
        ]);
        let config = resolve(&cli).unwrap();
        let TransportConfig::Socket(cfg) = config else {
            panic!("expected socket config");
        };
        assert_eq!(cfg.url, "ws://127.0.0.1:9/rpc");
        assert_eq!(cfg.credentials, CredentialMode::Header);
        assert_eq!(cfg.max_reconnect_attempts, 2);
        assert_eq!(cfg.headers["X-Team"], "tools");
    }

    #[test]
    fn polling_subcommand_builds_polling_config() {
        let cli = Cli::parse_from(["tr-relay", "polling", "http://h:1", "--interval-ms", "250"]);
        let TransportConfig::Polling(cfg) = resolve(&cli).unwrap() else {
            panic!("expected polling config");
        };
        assert_eq!(cfg.poll_interval_ms, 250);
    }

    #[test]
    fn missing_channel_is_an_error() {
        let cli = Cli::parse_from(["tr-relay"]);
        assert!(resolve(&cli).is_err());
    }

    #[test]
    fn config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            "[transport]\nkind = \"polling\"\nurl = \"http://files:8\"\n",
        )
        .unwrap();
        let config = load_file(&path).unwrap();
        assert_eq!(config.url(), "http://files:8");
    }

    #[test]
    fn unreadable_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
