//! The lightweight JSON-RPC handshake used to tell whether a Ganache endpoint is up.
//!
//! The handshake is issued with a plain HTTP client rather than an alloy provider so that a
//! refused connection ("nothing listening yet") can be told apart from every other failure.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

/// A read-only method every Ethereum JSON-RPC server answers.
pub const HANDSHAKE_METHOD: &str = "web3_clientVersion";

/// The outcome of a handshake which didn't fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Nothing accepted the connection.
    Refused,
    /// A well-formed JSON-RPC response came back.
    Responded(HandshakeResponse),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// The client version string; `None` when the server answered with a JSON-RPC error.
    pub client_version: Option<String>,
}

impl HandshakeResponse {
    pub fn is_ganache(&self) -> bool {
        self.client_version
            .as_deref()
            .is_some_and(|version| version.to_ascii_lowercase().contains("ganache"))
    }

    pub fn describe(&self) -> &str {
        self.client_version.as_deref().unwrap_or("no client version")
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Handshake request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Malformed JSON-RPC response: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// An HTTP client suitable for [`handshake`].
pub fn handshake_client(timeout: Duration) -> Result<reqwest::Client, HandshakeError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(HandshakeError::Request)
}

/// Sends a single [`HANDSHAKE_METHOD`] request to `uri`.
pub async fn handshake(
    client: &reqwest::Client,
    uri: &str,
) -> Result<HandshakeOutcome, HandshakeError> {
    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": HANDSHAKE_METHOD,
        "params": [],
    });

    let response = match client.post(uri).json(&request).send().await {
        Ok(response) => response,
        Err(error) if error.is_connect() => return Ok(HandshakeOutcome::Refused),
        Err(error) => return Err(HandshakeError::Request(error)),
    };
    let body = response.bytes().await.map_err(HandshakeError::Request)?;

    parse_response(&body).map(HandshakeOutcome::Responded)
}

fn parse_response(body: &[u8]) -> Result<HandshakeResponse, HandshakeError> {
    let response = serde_json::from_slice::<JsonRpcResponse>(body).map_err(|error| {
        HandshakeError::Malformed(format!(
            "{error}: {}",
            String::from_utf8_lossy(&body[..body.len().min(256)])
        ))
    })?;

    if response.jsonrpc != "2.0" {
        return Err(HandshakeError::Malformed(format!(
            "unsupported jsonrpc version '{}'",
            response.jsonrpc
        )));
    }

    match (response.result, response.error) {
        (Some(result), None) => Ok(HandshakeResponse {
            client_version: Some(match result {
                Value::String(version) => version,
                other => other.to_string(),
            }),
        }),
        (None, Some(_)) => Ok(HandshakeResponse {
            client_version: None,
        }),
        _ => Err(HandshakeError::Malformed(
            "expected exactly one of `result` and `error`".to_string(),
        )),
    }
}
