use std::{path::PathBuf, time::Duration};

use crate::{
    DEFAULT_GANACHE_BINARY, DEFAULT_HOSTNAME, Hardfork, IncompatibleEndpointPolicy, NetworkConfig,
    PortSelection, UnlockedAccount,
};

/// The resolved settings of a single connection attempt.
///
/// It is built once per connection request and never mutated afterwards; the supervisor keeps its
/// own copy for the lifetime of the managed process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderConfig {
    /// The Ganache executable, looked up in `$PATH` when it's a bare name.
    pub ganache_binary: PathBuf,
    pub port: PortSelection,
    pub hostname: String,
    pub request_timeout: Duration,
    pub fork_request_timeout: Duration,
    pub fork: Option<ForkConfig>,
    /// Forwarded in order, one `--wallet.unlockedAccounts` flag per entry.
    pub unlocked_accounts: Vec<UnlockedAccount>,
    pub wallet: WalletOptions,
    pub gas_price: u64,
    pub hardfork: Hardfork,
    /// Raw arguments appended after everything else.
    pub process_args: Vec<String>,
    pub process_attempts: usize,
    pub on_incompatible: IncompatibleEndpointPolicy,
    /// When set the subprocess output is mirrored into log files in this directory.
    pub logs_directory: Option<PathBuf>,
}

impl ProviderConfig {
    pub fn is_fork(&self) -> bool {
        self.fork.is_some()
    }

    pub fn timeout_class(&self) -> TimeoutClass {
        match self.is_fork() {
            true => TimeoutClass::Fork,
            false => TimeoutClass::Plain,
        }
    }

    /// The timeout used both for requests and for waiting on the subprocess to become ready.
    pub fn timeout(&self) -> Duration {
        match self.timeout_class() {
            TimeoutClass::Plain => self.request_timeout,
            TimeoutClass::Fork => self.fork_request_timeout,
        }
    }

    pub fn uri(&self, port: u16) -> String {
        format!("http://{}:{port}", self.hostname)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let network_config = NetworkConfig::default();
        Self {
            ganache_binary: DEFAULT_GANACHE_BINARY.into(),
            port: network_config.server.port,
            hostname: DEFAULT_HOSTNAME.to_string(),
            request_timeout: Duration::from_secs(network_config.server.timeout),
            fork_request_timeout: Duration::from_secs(network_config.server.fork_timeout),
            fork: None,
            unlocked_accounts: Vec::new(),
            wallet: WalletOptions::default(),
            gas_price: network_config.miner.gas_price,
            hardfork: network_config.chain.hardfork,
            process_args: Vec::new(),
            process_attempts: network_config.process_attempts,
            on_incompatible: network_config.on_incompatible,
            logs_directory: None,
        }
    }
}

/// Which class of timeout applies to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeoutClass {
    Plain,
    Fork,
}

/// The upstream network a forked Ganache replays state from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ForkConfig {
    pub upstream_url: String,
    /// The block to pin the fork at; the upstream's latest block when unset.
    pub block_number: Option<u64>,
}

impl ForkConfig {
    /// Whether the upstream URL is the given local URI, which would make Ganache fork from itself.
    pub fn points_at(&self, uri: &str) -> bool {
        let normalize = |url: &str| {
            url.trim_end_matches('/')
                .replace("localhost", "127.0.0.1")
                .to_ascii_lowercase()
        };
        normalize(&self.upstream_url) == normalize(uri)
    }
}

/// Wallet settings usually owned by the host's test configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct WalletOptions {
    pub mnemonic: Option<String>,
    pub number_of_accounts: Option<u32>,
    pub hd_path: Option<String>,
}
