use std::{fmt::Display, str::FromStr};

use alloy::primitives::{Address, B256, U256};
use anyhow::{Context as _, bail};
use serde::{Deserialize, Serialize};

/// An account Ganache should treat as unlocked.
///
/// The value is opaque to the provider: it may be a hex address or a name (such as an ENS name)
/// that was resolved, or is going to be resolved, outside of this crate. The only normalisation
/// performed is for purely decimal values, which is what a hex address written without quotes in a
/// YAML file turns into. Those are converted back into a checksummed hex address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawUnlockedAccount", into = "String")]
pub struct UnlockedAccount(String);

impl UnlockedAccount {
    pub fn new(value: impl Into<String>) -> anyhow::Result<Self> {
        let value = value.into();
        let value = value.trim();
        if value.is_empty() {
            bail!("An unlocked account can't be empty");
        }

        match value.bytes().all(|byte| byte.is_ascii_digit()) {
            true => decimal_to_checksum_address(value).map(Self),
            false => Ok(Self(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UnlockedAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UnlockedAccount {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for UnlockedAccount {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<UnlockedAccount> for String {
    fn from(value: UnlockedAccount) -> Self {
        value.0
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum RawUnlockedAccount {
    Number(u64),
    Text(String),
}

impl TryFrom<RawUnlockedAccount> for UnlockedAccount {
    type Error = anyhow::Error;

    fn try_from(value: RawUnlockedAccount) -> anyhow::Result<Self> {
        match value {
            RawUnlockedAccount::Number(number) => Self::new(number.to_string()),
            RawUnlockedAccount::Text(text) => Self::new(text),
        }
    }
}

fn decimal_to_checksum_address(value: &str) -> anyhow::Result<String> {
    let number = U256::from_str_radix(value, 10)
        .with_context(|| format!("Failed to parse '{value}' as a decimal number"))?;
    if number.bit_len() > 160 {
        bail!("'{value}' is too large to be an address");
    }
    Ok(Address::from_word(B256::from(number.to_be_bytes::<32>())).to_checksum(None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_addresses_and_names_are_kept_as_is() {
        let address = "0xd8da6bf26964af9d7eed9e03e53415d37aa96045";
        assert_eq!(UnlockedAccount::new(address).unwrap().as_str(), address);
        assert_eq!(
            UnlockedAccount::new("vitalik.eth").unwrap().as_str(),
            "vitalik.eth"
        );
    }

    #[test]
    fn decimal_values_become_padded_checksum_addresses() {
        // Arrange
        let decimal = "1";

        // Act
        let account = UnlockedAccount::new(decimal).unwrap();

        // Assert
        assert_eq!(
            account.as_str(),
            "0x0000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn unquoted_yaml_addresses_round_back_to_hex() {
        // Arrange
        let yaml = "[0xd8da6bf26964af9d7eed9e03e53415d37aa96045, 255, vitalik.eth]";

        // Act
        let accounts = serde_yaml::from_str::<Vec<UnlockedAccount>>(yaml).unwrap();

        // Assert
        assert_eq!(
            accounts[0].as_str().to_lowercase(),
            "0xd8da6bf26964af9d7eed9e03e53415d37aa96045"
        );
        assert_eq!(
            accounts[1].as_str().to_lowercase(),
            "0x00000000000000000000000000000000000000ff"
        );
        assert_eq!(accounts[2].as_str(), "vitalik.eth");
    }

    #[test]
    fn oversized_and_empty_values_are_rejected() {
        let too_large = U256::MAX.to_string();
        assert!(UnlockedAccount::new(too_large).is_err());
        assert!(UnlockedAccount::new("   ").is_err());
    }
}
