use std::{fmt::Display, str::FromStr};

use anyhow::{Context as _, bail};
use serde::{Deserialize, Serialize};

/// The port Ganache listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 8545;

/// The literal token which requests a dynamically selected free port.
pub const AUTO_PORT_TOKEN: &str = "auto";

/// The port requested for a connection: either a fixed port or the "auto" sentinel which asks for
/// an unused port to be picked at connection time (useful when running tests in parallel).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPortSelection", into = "RawPortSelection")]
pub enum PortSelection {
    Fixed(u16),
    Auto,
}

impl PortSelection {
    pub fn fixed(&self) -> Option<u16> {
        match self {
            Self::Fixed(port) => Some(*port),
            Self::Auto => None,
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }

    /// Port 0 would let Ganache bind a port nobody knows about.
    fn fixed_port(port: u16) -> anyhow::Result<Self> {
        if port == 0 {
            bail!("Port 0 can't be used, use \"{AUTO_PORT_TOKEN}\" to pick a free port");
        }
        Ok(Self::Fixed(port))
    }
}

impl Default for PortSelection {
    fn default() -> Self {
        Self::Fixed(DEFAULT_PORT)
    }
}

impl From<u16> for PortSelection {
    fn from(port: u16) -> Self {
        Self::Fixed(port)
    }
}

impl Display for PortSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(port) => Display::fmt(port, f),
            Self::Auto => f.write_str(AUTO_PORT_TOKEN),
        }
    }
}

impl FromStr for PortSelection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        if s == AUTO_PORT_TOKEN {
            return Ok(Self::Auto);
        }
        let port = s
            .parse::<u16>()
            .with_context(|| format!("'{s}' is neither a port number nor \"{AUTO_PORT_TOKEN}\""))?;
        Self::fixed_port(port)
    }
}

/// The two shapes a port can take in a configuration file: `port: 8545` or `port: auto`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RawPortSelection {
    Number(u16),
    Text(String),
}

impl TryFrom<RawPortSelection> for PortSelection {
    type Error = anyhow::Error;

    fn try_from(value: RawPortSelection) -> anyhow::Result<Self> {
        match value {
            RawPortSelection::Number(port) => Self::fixed_port(port),
            RawPortSelection::Text(text) => text.parse(),
        }
    }
}

impl From<PortSelection> for RawPortSelection {
    fn from(value: PortSelection) -> Self {
        match value {
            PortSelection::Fixed(port) => Self::Number(port),
            PortSelection::Auto => Self::Text(AUTO_PORT_TOKEN.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_token_parses_into_the_sentinel() {
        assert_eq!("auto".parse::<PortSelection>().unwrap(), PortSelection::Auto);
        assert_eq!(
            " 8555 ".parse::<PortSelection>().unwrap(),
            PortSelection::Fixed(8555)
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!("automatic".parse::<PortSelection>().is_err());
        assert!("70000".parse::<PortSelection>().is_err());
    }

    #[test]
    fn port_zero_is_rejected() {
        assert!("0".parse::<PortSelection>().is_err());
        assert!(serde_yaml::from_str::<PortSelection>("0").is_err());
        assert!(serde_yaml::from_str::<PortSelection>("\"0\"").is_err());
    }

    #[test]
    fn yaml_accepts_numbers_and_the_auto_token() {
        // Arrange
        let numeric = "8556";
        let auto = "auto";

        // Act
        let numeric = serde_yaml::from_str::<PortSelection>(numeric);
        let auto = serde_yaml::from_str::<PortSelection>(auto);

        // Assert
        assert_eq!(numeric.unwrap(), PortSelection::Fixed(8556));
        assert_eq!(auto.unwrap(), PortSelection::Auto);
    }
}
