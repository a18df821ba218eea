//! Translation of a [`ProviderConfig`] into the Ganache command line.

use ganache_provider_config::ProviderConfig;

/// Builds the arguments Ganache is started with to listen on `port`.
///
/// This is a pure function of its inputs: the same config and port always produce the same
/// arguments in the same order. Unlocked accounts are passed through verbatim, one flag per
/// account, in the order they were configured. The fork arguments are only present in fork mode.
pub fn ganache_arguments(config: &ProviderConfig, port: u16) -> Vec<String> {
    let mut arguments = vec![
        "--server.port".to_string(),
        port.to_string(),
        "--server.host".to_string(),
        config.hostname.clone(),
    ];

    if let Some(mnemonic) = config.wallet.mnemonic.as_ref() {
        arguments.extend(["--wallet.mnemonic".to_string(), mnemonic.clone()]);
    }
    if let Some(number_of_accounts) = config.wallet.number_of_accounts {
        arguments.extend([
            "--wallet.totalAccounts".to_string(),
            number_of_accounts.to_string(),
        ]);
    }
    if let Some(hd_path) = config.wallet.hd_path.as_ref() {
        // Ganache wants the path of the account's parent, without the index placeholder.
        let hd_path = hd_path.trim_end_matches("/{}");
        arguments.extend(["--wallet.hdPath".to_string(), hd_path.to_string()]);
    }

    arguments.extend([
        "--chain.hardfork".to_string(),
        config.hardfork.to_string(),
        "--miner.defaultGasPrice".to_string(),
        config.gas_price.to_string(),
        "--chain.vmErrorsOnRPCResponse".to_string(),
        "true".to_string(),
    ]);

    for account in config.unlocked_accounts.iter() {
        arguments.extend([
            "--wallet.unlockedAccounts".to_string(),
            account.to_string(),
        ]);
    }

    if let Some(fork) = config.fork.as_ref() {
        arguments.extend(["--fork.url".to_string(), fork.upstream_url.clone()]);
        if let Some(block_number) = fork.block_number {
            arguments.extend(["--fork.blockNumber".to_string(), block_number.to_string()]);
        }
    }

    arguments.extend(config.process_args.iter().cloned());
    arguments
}
