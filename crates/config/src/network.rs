//! The configuration file surface of the provider.
//!
//! This is the `ganache` section of a project configuration file. Every key is optional and falls
//! back to the same defaults Ganache itself is started with by the provider.

use std::{
    collections::BTreeMap,
    fmt::Display,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context as _, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{
    ForkConfig, PortSelection, ProviderConfig, UnlockedAccount, UpstreamResolver, WalletOptions,
};

/// The key under which the provider's section lives in a project configuration file.
pub const CONFIG_SECTION: &str = "ganache";

pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_FORK_REQUEST_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_GAS_PRICE: u64 = 2_000_000_000;
pub const DEFAULT_PROCESS_ATTEMPTS: usize = 3;
pub const DEFAULT_GANACHE_BINARY: &str = "ganache";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Values for the `--server.*` arguments. Used whenever Ganache is started.
    pub server: ServerConfig,

    /// Values for the `--fork.*` arguments, keyed by ecosystem and then by network name. Only used
    /// when a forked network is requested.
    pub fork: BTreeMap<String, BTreeMap<String, ForkNetworkConfig>>,

    /// Values for the `--wallet.*` arguments.
    pub wallet: WalletConfig,

    /// Values for the `--miner.*` arguments.
    pub miner: MinerConfig,

    /// Values for the `--chain.*` arguments.
    pub chain: ChainConfig,

    /// How many times a subprocess start on an automatically selected port is attempted before
    /// giving up. Try increasing this if parallel runs keep colliding on ports.
    pub process_attempts: usize,

    /// What to do when the configured port is taken by something that isn't Ganache.
    pub on_incompatible: IncompatibleEndpointPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server: Default::default(),
            fork: Default::default(),
            wallet: Default::default(),
            miner: Default::default(),
            chain: Default::default(),
            process_attempts: DEFAULT_PROCESS_ATTEMPTS,
            on_incompatible: Default::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: PortSelection,
    pub hostname: String,
    /// The request timeout in seconds.
    #[serde(alias = "request_timeout")]
    pub timeout: u64,
    /// The request timeout in seconds used when forking; forked nodes fetch state lazily from
    /// upstream and are much slower to answer.
    #[serde(alias = "fork_request_timeout")]
    pub fork_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: Default::default(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            fork_timeout: DEFAULT_FORK_REQUEST_TIMEOUT_SECONDS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkNetworkConfig {
    /// A URL, or the name of a provider the host knows how to turn into a URL. When not set the
    /// host's default provider for the network is used.
    pub upstream_provider: Option<String>,
    pub block_number: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub unlocked_accounts: Vec<UnlockedAccount>,
    pub mnemonic: Option<String>,
    pub number_of_accounts: Option<u32>,
    pub hd_path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub gas_price: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            gas_price: DEFAULT_GAS_PRICE,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub hardfork: Hardfork,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Hardfork {
    Constantinople,
    Byzantium,
    Petersburg,
    Istanbul,
    MuirGlacier,
    Berlin,
    #[default]
    London,
    ArrowGlacier,
    GrayGlacier,
}

impl Hardfork {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Constantinople => "constantinople",
            Self::Byzantium => "byzantium",
            Self::Petersburg => "petersburg",
            Self::Istanbul => "istanbul",
            Self::MuirGlacier => "muirGlacier",
            Self::Berlin => "berlin",
            Self::London => "london",
            Self::ArrowGlacier => "arrowGlacier",
            Self::GrayGlacier => "grayGlacier",
        }
    }
}

impl Display for Hardfork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The policy applied when the configured port answers but the responder isn't Ganache.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum IncompatibleEndpointPolicy {
    /// Refuse to start; the port is squatted by something else.
    #[default]
    Fail,
    /// Start our own Ganache on an automatically selected port instead.
    SpawnElsewhere,
}

/// The network a forked provider replays state from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ForkTarget {
    pub ecosystem: String,
    /// The network name, with or without the `-fork` suffix (`mainnet` and `mainnet-fork` are
    /// the same target).
    pub network: String,
}

impl ForkTarget {
    pub fn new(ecosystem: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            ecosystem: ecosystem.into(),
            network: network.into(),
        }
    }

    pub fn upstream_network(&self) -> &str {
        self.network
            .strip_suffix("-fork")
            .unwrap_or(self.network.as_str())
    }
}

impl NetworkConfig {
    /// Reads the configuration from a YAML file. The file can either be the provider's section on
    /// its own or a whole project configuration file containing a `ganache` section.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read the config file {}", path.display()))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Failed to parse the config file {}", path.display()))
    }

    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        let value = serde_yaml::from_str::<serde_yaml::Value>(contents)
            .context("Config is not valid YAML")?;
        let section = match value.get(CONFIG_SECTION) {
            Some(section) => section.clone(),
            None if value.is_null() => return Ok(Self::default()),
            None => value,
        };
        serde_yaml::from_value(section).context("Config doesn't match the expected layout")
    }

    pub fn fork_network_config(&self, target: &ForkTarget) -> Option<&ForkNetworkConfig> {
        let networks = self.fork.get(&target.ecosystem)?;
        networks
            .get(target.upstream_network())
            .or_else(|| networks.get(&target.network))
    }

    /// Takes an immutable snapshot of the settings for a single connection attempt.
    ///
    /// When a `fork_target` is given the upstream provider configured for it is resolved into a
    /// URL through the given `resolver`.
    pub fn provider_config(
        &self,
        ganache_binary: impl Into<PathBuf>,
        fork_target: Option<&ForkTarget>,
        resolver: &dyn UpstreamResolver,
    ) -> anyhow::Result<ProviderConfig> {
        if self.process_attempts == 0 {
            bail!("process_attempts must be at least 1");
        }
        if self.server.fork_timeout < self.server.timeout {
            bail!(
                "fork_timeout ({}s) must not be shorter than timeout ({}s)",
                self.server.fork_timeout,
                self.server.timeout
            );
        }

        let fork = match fork_target {
            Some(target) => {
                let fork_network_config = self.fork_network_config(target);
                let upstream_url = resolver
                    .resolve(
                        &target.ecosystem,
                        target.upstream_network(),
                        fork_network_config.and_then(|config| config.upstream_provider.as_deref()),
                    )
                    .with_context(|| {
                        format!(
                            "Failed to resolve the upstream provider of {}:{}",
                            target.ecosystem, target.network
                        )
                    })?;
                Some(ForkConfig {
                    upstream_url,
                    block_number: fork_network_config.and_then(|config| config.block_number),
                })
            }
            None => None,
        };

        Ok(ProviderConfig {
            ganache_binary: ganache_binary.into(),
            port: self.server.port,
            hostname: self.server.hostname.clone(),
            request_timeout: Duration::from_secs(self.server.timeout),
            fork_request_timeout: Duration::from_secs(self.server.fork_timeout),
            fork,
            unlocked_accounts: self.wallet.unlocked_accounts.clone(),
            wallet: WalletOptions {
                mnemonic: self.wallet.mnemonic.clone(),
                number_of_accounts: self.wallet.number_of_accounts,
                hd_path: self.wallet.hd_path.clone(),
            },
            gas_price: self.miner.gas_price,
            hardfork: self.chain.hardfork,
            process_args: Vec::new(),
            process_attempts: self.process_attempts,
            on_incompatible: self.on_incompatible,
            logs_directory: None,
        })
    }
}
