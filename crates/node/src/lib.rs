//! This crate supervises the local Ganache process and implements the provider in front of it.

use std::pin::Pin;

use serde_json::Value;

pub mod command;
pub mod constants;
pub mod error;
pub mod handshake;
pub mod negotiator;
pub mod process;
pub mod provider;
pub mod supervisor;

pub use error::{ProviderError, ProviderStartError};
pub use provider::GanacheProvider;
pub use supervisor::{Endpoint, ProcessSupervisor, SupervisorState};

/// The lifecycle interface a host drives a network provider through.
pub trait NetworkProvider {
    /// Connects to the network, starting the local node if needed.
    ///
    /// Returns the existing endpoint when already connected.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Endpoint, ProviderError>> + '_>>;

    /// Disconnects from the network and stops the local node if this provider started it.
    ///
    /// Never fails.
    fn disconnect(&self) -> Pin<Box<dyn Future<Output = ()> + '_>>;

    fn is_connected(&self) -> bool;

    /// Forwards a JSON-RPC request.
    fn request<'a>(
        &'a self,
        method: &'a str,
        params: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + 'a>>;
}
