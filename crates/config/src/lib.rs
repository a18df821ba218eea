//! The configuration used across the ganache provider crates.
//!
//! Configuration enters through a YAML file ([`NetworkConfig`]) and the command line
//! ([`Arguments`]) and is frozen into a [`ProviderConfig`] for every connection attempt.

mod accounts;
mod arguments;
mod network;
mod port;
mod provider;
mod upstream;

pub use accounts::*;
pub use arguments::*;
pub use network::*;
pub use port::*;
pub use provider::*;
pub use upstream::*;
