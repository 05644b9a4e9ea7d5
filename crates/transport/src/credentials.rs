//! How caller-supplied credentials reach the server during the socket
//! handshake.
//!
//! The transport never interprets credentials; it only moves the
//! `Authorization` header (or every caller header) to wherever the
//! substrate can carry it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Resolved connection target: final URL plus headers for the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

/// Strategy for attaching credentials to a socket handshake.
pub trait CredentialAttachment: Send + Sync + fmt::Debug {
    fn attach(&self, url: Url, headers: &BTreeMap<String, String>) -> ConnectTarget;
}

/// Case-insensitive lookup of the `Authorization` header value.
pub fn authorization_value(headers: &BTreeMap<String, String>) -> Option<&str> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
        .map(|(_, value)| value.as_str())
        .filter(|value| !value.trim().is_empty())
}

fn strip_bearer(value: &str) -> &str {
    let trimmed = value.trim();
    match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => trimmed[7..].trim_start(),
        _ => trimmed,
    }
}

/// Appends the authorization value as a query parameter (default `token`).
/// For handshakes that cannot carry headers; no headers are sent.
#[derive(Debug, Clone)]
pub struct QueryTokenCredentials {
    pub param: String,
}

impl Default for QueryTokenCredentials {
    fn default() -> Self {
        Self {
            param: "token".into(),
        }
    }
}

impl CredentialAttachment for QueryTokenCredentials {
    fn attach(&self, mut url: Url, headers: &BTreeMap<String, String>) -> ConnectTarget {
        if let Some(value) = authorization_value(headers) {
            url.query_pairs_mut()
                .append_pair(&self.param, strip_bearer(value));
        }
        ConnectTarget {
            url,
            headers: Vec::new(),
        }
    }
}

/// Sends every caller header on the handshake request unchanged.
#[derive(Debug, Clone, Default)]
pub struct HandshakeHeaderCredentials;

impl CredentialAttachment for HandshakeHeaderCredentials {
    fn attach(&self, url: Url, headers: &BTreeMap<String, String>) -> ConnectTarget {
        ConnectTarget {
            url,
            headers: headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Config-level selector for the built-in strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMode {
    #[default]
    Query,
    Header,
}

impl CredentialMode {
    pub fn strategy(self) -> Arc<dyn CredentialAttachment> {
        match self {
            Self::Query => Arc::new(QueryTokenCredentials::default()),
            Self::Header => Arc::new(HandshakeHeaderCredentials),
        }
    }
}
