//! The errors surfaced by the provider.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::process::CapturedOutput;

/// A failure to bring up a usable Ganache endpoint.
///
/// Whenever one of these is returned, any subprocess started for the attempt has already been
/// killed.
#[derive(Debug, Error)]
pub enum ProviderStartError {
    /// The configured port was taken before Ganache could bind it. Retryable with another port.
    #[error("Port {port} is already in use\n{output}")]
    PortInUse { port: u16, output: CapturedOutput },

    /// The executable couldn't be found. Never retried.
    #[error(
        "Missing the Ganache executable '{}'; install it with `npm install --global ganache`",
        .binary.display()
    )]
    NotInstalled { binary: PathBuf },

    /// The subprocess couldn't be launched or exited before it answered the handshake.
    #[error("Failed to start Ganache: {reason}\n{output}")]
    ProcessStart {
        reason: String,
        output: CapturedOutput,
    },

    /// The subprocess kept running but didn't answer the handshake in time.
    #[error("Ganache didn't answer on port {port} within {timeout:?}\n{output}")]
    ReadinessTimeout {
        port: u16,
        timeout: Duration,
        output: CapturedOutput,
    },

    /// Something answered the readiness handshake with a response that isn't JSON-RPC.
    #[error("Invalid handshake response on port {port}: {reason}\n{output}")]
    Handshake {
        port: u16,
        reason: String,
        output: CapturedOutput,
    },

    #[error("Port '{port}' already in use by another process that isn't a Ganache server ({responder})")]
    IncompatibleEndpoint { port: u16, responder: String },

    #[error("Invalid upstream-fork URL '{url}'; it can't be the same as the local Ganache node")]
    ForkPointsAtSelf { url: String },

    #[error("Unable to find an available port between {start} and {end}")]
    NoFreePort { start: u16, end: u16 },

    /// `stop` was called before Ganache became ready.
    #[error("Starting Ganache was aborted by a stop request")]
    Aborted,
}

impl ProviderStartError {
    /// Whether starting again with a freshly selected port may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PortInUse { .. })
    }

    pub fn captured_output(&self) -> Option<&CapturedOutput> {
        match self {
            Self::PortInUse { output, .. }
            | Self::ProcessStart { output, .. }
            | Self::ReadinessTimeout { output, .. }
            | Self::Handshake { output, .. } => Some(output),
            Self::NotInstalled { .. }
            | Self::IncompatibleEndpoint { .. }
            | Self::ForkPointsAtSelf { .. }
            | Self::NoFreePort { .. }
            | Self::Aborted => None,
        }
    }
}

/// The errors of the host facing provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Start(#[from] ProviderStartError),

    #[error("Can't build URI before `connect()` is called.")]
    NotConnected,

    /// Ganache died after it was ready. Reported on the first use after the fact.
    #[error("Ganache on port {port} exited unexpectedly ({status})\n{output}")]
    UnexpectedExit {
        port: u16,
        status: String,
        output: CapturedOutput,
    },

    #[error("Invalid endpoint URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("JSON-RPC request '{method}' failed")]
    Rpc {
        method: String,
        #[source]
        source: alloy::transports::TransportError,
    },

    #[error("JSON-RPC request '{method}' didn't complete within {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    #[error("Unexpected response to '{method}': {reason}")]
    UnexpectedResponse { method: String, reason: String },
}
