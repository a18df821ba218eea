use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use crate::{
    ForkConfig, IncompatibleEndpointPolicy, LiteralUrlResolver, NetworkConfig, PortSelection,
    ProviderConfig, UnlockedAccount,
};

#[derive(Debug, Parser, Clone)]
#[command(name = "ganache-provider")]
pub struct Arguments {
    /// A YAML config file; either the `ganache` section on its own or a whole project config.
    #[arg(long = "config", short)]
    pub config: Option<PathBuf>,

    /// The path to the `ganache` executable.
    ///
    /// By default it uses the `ganache` binary found in `$PATH`.
    #[arg(long = "ganache", default_value = "ganache")]
    pub ganache: PathBuf,

    /// The port to run on, or `auto` to pick an unused one. Overrides the config file.
    #[arg(long = "port", short)]
    pub port: Option<PortSelection>,

    /// The hostname to bind to. Overrides the config file.
    #[arg(long = "host")]
    pub hostname: Option<String>,

    /// Accounts to unlock, in addition to the ones in the config file.
    #[arg(long = "unlock")]
    pub unlock: Vec<UnlockedAccount>,

    /// Fork from this upstream RPC URL.
    #[arg(long = "fork-url")]
    pub fork_url: Option<String>,

    /// Pin the fork at this block number.
    #[arg(long = "fork-block-number", requires = "fork_url")]
    pub fork_block_number: Option<u64>,

    /// What to do when the port is taken by something that isn't Ganache.
    #[arg(long = "on-incompatible", value_enum)]
    pub on_incompatible: Option<IncompatibleEndpointPolicy>,

    /// Mirror the Ganache stdout and stderr into log files in this directory.
    #[arg(long = "logs-dir")]
    pub logs_directory: Option<PathBuf>,

    /// Extra arguments passed to Ganache verbatim.
    #[arg(last = true)]
    pub process_args: Vec<String>,
}

impl Arguments {
    /// Builds the connection settings: the config file (or the defaults) first, then the command
    /// line on top of it.
    pub fn provider_config(&self) -> anyhow::Result<ProviderConfig> {
        let network_config = match self.config.as_ref() {
            Some(path) => NetworkConfig::from_path(path)?,
            None => NetworkConfig::default(),
        };

        let mut config = network_config
            .provider_config(self.ganache.clone(), None, &LiteralUrlResolver)
            .context("Failed to build the provider config")?;

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(hostname) = self.hostname.as_ref() {
            config.hostname = hostname.clone();
        }
        config.unlocked_accounts.extend(self.unlock.iter().cloned());
        if let Some(upstream_url) = self.fork_url.as_ref() {
            config.fork = Some(ForkConfig {
                upstream_url: upstream_url.clone(),
                block_number: self.fork_block_number,
            });
        }
        if let Some(on_incompatible) = self.on_incompatible {
            config.on_incompatible = on_incompatible;
        }
        config.logs_directory = self.logs_directory.clone();
        config.process_args = self.process_args.clone();

        Ok(config)
    }
}

impl Default for Arguments {
    fn default() -> Self {
        Arguments::parse_from(["ganache-provider"])
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn defaults_match_the_config_file_defaults() {
        // Act
        let config = Arguments::default().provider_config().unwrap();

        // Assert
        assert_eq!(config, ProviderConfig::default());
    }

    #[test]
    fn command_line_overrides_are_applied() {
        // Arrange
        let arguments = Arguments::parse_from([
            "ganache-provider",
            "--port",
            "auto",
            "--host",
            "0.0.0.0",
            "--unlock",
            "0xabc",
            "--unlock",
            "0xdef",
            "--fork-url",
            "https://eth.example.org",
            "--fork-block-number",
            "42",
            "--on-incompatible",
            "spawn-elsewhere",
            "--",
            "--logging.quiet",
        ]);

        // Act
        let config = arguments.provider_config().unwrap();

        // Assert
        assert_eq!(config.port, PortSelection::Auto);
        assert_eq!(config.hostname, "0.0.0.0");
        assert_eq!(
            config
                .unlocked_accounts
                .iter()
                .map(UnlockedAccount::as_str)
                .collect::<Vec<_>>(),
            vec!["0xabc", "0xdef"]
        );
        assert_eq!(config.fork.as_ref().unwrap().block_number, Some(42));
        assert_eq!(config.timeout(), Duration::from_secs(300));
        assert_eq!(
            config.on_incompatible,
            IncompatibleEndpointPolicy::SpawnElsewhere
        );
        assert_eq!(config.process_args, vec!["--logging.quiet".to_string()]);
    }

    #[test]
    fn fork_block_number_requires_a_fork_url() {
        let result =
            Arguments::try_parse_from(["ganache-provider", "--fork-block-number", "42"]);
        assert!(result.is_err());
    }
}
