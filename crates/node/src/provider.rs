//! The provider the host talks to.

use std::{
    pin::Pin,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use alloy::{
    network::Ethereum,
    providers::{Provider, RootProvider},
};
use ganache_provider_config::{ForkConfig, ProviderConfig};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::{
    NetworkProvider,
    constants::UNLOCK_DURATION_SECONDS,
    error::ProviderError,
    supervisor::{Endpoint, ProcessSupervisor, SupervisorState},
};

/// A JSON-RPC provider backed by a local Ganache.
///
/// [`connect`](Self::connect) starts (or attaches to) Ganache and [`disconnect`](Self::disconnect)
/// stops it again. In between, requests are forwarded to it unchanged.
#[derive(Debug)]
pub struct GanacheProvider {
    network_choice: String,
    config: ProviderConfig,
    supervisor: ProcessSupervisor,
    connection: Mutex<Option<Connection>>,
}

#[derive(Clone, Debug)]
struct Connection {
    endpoint: Endpoint,
    rpc: RootProvider<Ethereum>,
}

impl GanacheProvider {
    pub fn new(network_choice: impl Into<String>, config: ProviderConfig) -> Self {
        Self {
            network_choice: network_choice.into(),
            config,
            supervisor: ProcessSupervisor::new(),
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Connects to Ganache, starting it when needed. Returns the existing endpoint when already
    /// connected.
    #[instrument(level = "info", skip(self), fields(network = %self.network_choice))]
    pub async fn connect(&self) -> Result<Endpoint, ProviderError> {
        let endpoint = self.supervisor.start(&self.config).await?;

        let url = reqwest::Url::parse(&endpoint.uri).map_err(|error| ProviderError::InvalidUri {
            uri: endpoint.uri.clone(),
            reason: error.to_string(),
        });
        let url = match url {
            Ok(url) => url,
            Err(error) => {
                self.supervisor.stop().await;
                return Err(error);
            }
        };

        *self.lock_connection() = Some(Connection {
            endpoint: endpoint.clone(),
            rpc: RootProvider::new_http(url),
        });
        info!(uri = %endpoint.uri, "Connected");

        match self.fork_genesis_matches().await {
            Ok(Some(false)) => warn!("Upstream network has a mismatching genesis block"),
            Ok(_) => {}
            Err(error) => warn!(%error, "Unable to compare the genesis block with the upstream"),
        }
        Ok(endpoint)
    }

    /// Drops the connection and stops Ganache if this provider started it. Never fails.
    #[instrument(level = "info", skip(self), fields(network = %self.network_choice))]
    pub async fn disconnect(&self) {
        self.lock_connection().take();
        self.supervisor.stop().await;
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.state() == SupervisorState::Ready && self.lock_connection().is_some()
    }

    pub fn uri(&self) -> Result<String, ProviderError> {
        self.lock_connection()
            .as_ref()
            .map(|connection| connection.endpoint.uri.clone())
            .ok_or(ProviderError::NotConnected)
    }

    pub fn port(&self) -> Option<u16> {
        self.lock_connection()
            .as_ref()
            .map(|connection| connection.endpoint.port)
    }

    /// Identifies the connection as `{network}:{port}`.
    pub fn connection_id(&self) -> Option<String> {
        self.port()
            .map(|port| format!("{}:{port}", self.network_choice))
    }

    /// Forwards a JSON-RPC request to Ganache.
    ///
    /// Fails with [`ProviderError::UnexpectedExit`] if the Ganache we started has died since.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        if let Err(error) = self.supervisor.ensure_running().await {
            if matches!(error, ProviderError::UnexpectedExit { .. }) {
                self.lock_connection().take();
            }
            return Err(error);
        }

        let rpc = self
            .lock_connection()
            .as_ref()
            .map(|connection| connection.rpc.clone())
            .ok_or(ProviderError::NotConnected)?;

        forward(&rpc, method, params, self.config.timeout()).await
    }

    pub async fn chain_id(&self) -> Result<u64, ProviderError> {
        let result = self.request("eth_chainId", json!([])).await?;
        parse_quantity("eth_chainId", &result)
    }

    pub async fn client_version(&self) -> Result<String, ProviderError> {
        let result = self.request("web3_clientVersion", json!([])).await?;
        match result {
            Value::String(version) => Ok(version),
            other => Err(unexpected("web3_clientVersion", &other)),
        }
    }

    /// Mines `blocks` blocks.
    pub async fn mine(&self, blocks: u64) -> Result<(), ProviderError> {
        for _ in 0..blocks {
            self.request("evm_mine", json!([])).await?;
        }
        Ok(())
    }

    /// Takes a snapshot of the chain and returns its identifier.
    pub async fn snapshot(&self) -> Result<String, ProviderError> {
        let result = self.request("evm_snapshot", json!([])).await?;
        match result {
            Value::String(id) => Ok(id),
            Value::Number(id) => Ok(id.to_string()),
            other => Err(unexpected("evm_snapshot", &other)),
        }
    }

    /// Reverts the chain to a snapshot. Returns whether the snapshot existed.
    pub async fn revert(&self, snapshot_id: &str) -> Result<bool, ProviderError> {
        let params = match snapshot_id.parse::<u64>() {
            Ok(id) => json!([id]),
            Err(_) => json!([snapshot_id]),
        };
        let result = self.request("evm_revert", params).await?;
        result
            .as_bool()
            .ok_or_else(|| unexpected("evm_revert", &result))
    }

    /// Sets the timestamp of the next block, in seconds since the epoch.
    pub async fn set_timestamp(&self, seconds: u64) -> Result<(), ProviderError> {
        self.request("evm_setTime", json!([seconds.saturating_mul(1000)]))
            .await?;
        Ok(())
    }

    /// Adds `address` to Ganache's accounts and unlocks it, so transactions can be sent from it
    /// without its key. Returns whether Ganache unlocked it.
    pub async fn unlock_account(&self, address: &str) -> Result<bool, ProviderError> {
        self.request("evm_addAccount", json!([address, ""])).await?;
        let result = self
            .request(
                "personal_unlockAccount",
                json!([address, "", UNLOCK_DURATION_SECONDS]),
            )
            .await?;
        result
            .as_bool()
            .ok_or_else(|| unexpected("personal_unlockAccount", &result))
    }

    /// The struct logs of a transaction, one frame per executed opcode.
    pub async fn transaction_trace(&self, hash: &str) -> Result<Vec<Value>, ProviderError> {
        let result = self.request("debug_traceTransaction", json!([hash])).await?;
        match result.get("structLogs") {
            Some(Value::Array(frames)) => Ok(frames.clone()),
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(_) => Err(unexpected("debug_traceTransaction", &result)),
        }
    }

    /// The hash of the local chain's block 0.
    pub async fn genesis_hash(&self) -> Result<String, ProviderError> {
        let block = self
            .request("eth_getBlockByNumber", json!(["0x0", false]))
            .await?;
        block_hash(&block)
    }

    /// Whether the local and the upstream chain share their genesis block. `None` when not
    /// forking.
    pub async fn fork_genesis_matches(&self) -> Result<Option<bool>, ProviderError> {
        let Some(fork) = self.config.fork.as_ref() else {
            return Ok(None);
        };
        let local = self.genesis_hash().await?;
        let upstream = upstream_genesis_hash(fork, self.config.timeout()).await?;
        Ok(Some(local == upstream))
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl NetworkProvider for GanacheProvider {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Endpoint, ProviderError>> + '_>> {
        Box::pin(GanacheProvider::connect(self))
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = ()> + '_>> {
        Box::pin(GanacheProvider::disconnect(self))
    }

    fn is_connected(&self) -> bool {
        GanacheProvider::is_connected(self)
    }

    fn request<'a>(
        &'a self,
        method: &'a str,
        params: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + 'a>> {
        Box::pin(GanacheProvider::request(self, method, params))
    }
}

async fn forward(
    rpc: &RootProvider<Ethereum>,
    method: &str,
    params: Value,
    timeout: Duration,
) -> Result<Value, ProviderError> {
    match tokio::time::timeout(
        timeout,
        rpc.raw_request::<_, Value>(method.to_string().into(), params),
    )
    .await
    {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(source)) => Err(ProviderError::Rpc {
            method: method.to_string(),
            source,
        }),
        Err(_) => Err(ProviderError::RequestTimeout {
            method: method.to_string(),
            timeout,
        }),
    }
}

async fn upstream_genesis_hash(
    fork: &ForkConfig,
    timeout: Duration,
) -> Result<String, ProviderError> {
    let url =
        reqwest::Url::parse(&fork.upstream_url).map_err(|error| ProviderError::InvalidUri {
            uri: fork.upstream_url.clone(),
            reason: error.to_string(),
        })?;
    let upstream = RootProvider::<Ethereum>::new_http(url);
    let block = forward(
        &upstream,
        "eth_getBlockByNumber",
        json!(["0x0", false]),
        timeout,
    )
    .await?;
    block_hash(&block)
}

fn block_hash(block: &Value) -> Result<String, ProviderError> {
    block
        .get("hash")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| unexpected("eth_getBlockByNumber", block))
}

fn parse_quantity(method: &str, value: &Value) -> Result<u64, ProviderError> {
    match value {
        Value::String(hex) => u64::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|_| unexpected(method, value)),
        Value::Number(number) => number.as_u64().ok_or_else(|| unexpected(method, value)),
        _ => Err(unexpected(method, value)),
    }
}

fn unexpected(method: &str, value: &Value) -> ProviderError {
    ProviderError::UnexpectedResponse {
        method: method.to_string(),
        reason: format!("unexpected result {value}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ganache_provider_config::PortSelection;
    use tokio::net::TcpListener;

    use crate::{
        constants::GANACHE_CHAIN_ID,
        handshake::tests::{FakeEndpoint, GANACHE_GENESIS_HASH, Reply},
    };

    use super::*;

    fn attaching_config(port: u16) -> ProviderConfig {
        ProviderConfig {
            ganache_binary: "/nonexistent/bin/ganache".into(),
            port: PortSelection::Fixed(port),
            hostname: "127.0.0.1".to_string(),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[test]
    fn quantities_are_parsed_from_hex_and_numbers() {
        assert_eq!(parse_quantity("eth_chainId", &json!("0x539")).unwrap(), 1337);
        assert_eq!(parse_quantity("eth_chainId", &json!(1)).unwrap(), 1);
        assert!(parse_quantity("eth_chainId", &json!("chain")).is_err());
        assert!(parse_quantity("eth_chainId", &json!(null)).is_err());
    }

    #[tokio::test]
    async fn uri_is_unavailable_before_connecting() {
        // Arrange
        let provider = GanacheProvider::new("development", ProviderConfig::default());

        // Act
        let uri = provider.uri();

        // Assert
        let error = uri.unwrap_err();
        assert_eq!(
            error.to_string(),
            "Can't build URI before `connect()` is called."
        );
        assert!(!provider.is_connected());
        assert_eq!(provider.port(), None);
        assert_eq!(provider.connection_id(), None);
        assert!(matches!(
            provider.request("eth_chainId", json!([])).await,
            Err(ProviderError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connects_to_a_running_ganache_and_forwards_requests() {
        // Arrange
        let endpoint = FakeEndpoint::ganache().await;
        let provider = GanacheProvider::new("development", attaching_config(endpoint.port()));

        // Act
        let connected = provider.connect().await.unwrap();
        let chain_id = provider.chain_id().await.unwrap();
        let client_version = provider.client_version().await.unwrap();

        // Assert
        assert!(!connected.owned_by_us);
        assert!(provider.is_connected());
        assert_eq!(provider.uri().unwrap(), endpoint.uri());
        assert_eq!(
            provider.connection_id(),
            Some(format!("development:{}", endpoint.port()))
        );
        assert_eq!(chain_id, GANACHE_CHAIN_ID);
        assert!(client_version.starts_with("Ganache"));

        provider.disconnect().await;
        assert!(!provider.is_connected());
        assert!(provider.uri().is_err());
    }

    #[tokio::test]
    async fn development_helpers_send_the_expected_requests() {
        // Arrange
        let endpoint = FakeEndpoint::ganache().await;
        let provider = GanacheProvider::new("development", attaching_config(endpoint.port()));
        provider.connect().await.unwrap();

        // Act
        provider.mine(2).await.unwrap();
        let snapshot = provider.snapshot().await.unwrap();
        let reverted_by_number = provider.revert("1").await.unwrap();
        let reverted_by_hex = provider.revert(&snapshot).await.unwrap();
        provider.set_timestamp(1_700_000_000).await.unwrap();

        // Assert
        assert_eq!(snapshot, "0x1");
        assert!(reverted_by_number);
        assert!(reverted_by_hex);

        let requests = endpoint.requests();
        let calls = requests
            .iter()
            .filter(|request| request["method"] != "web3_clientVersion")
            .map(|request| (request["method"].clone(), request["params"].clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            calls,
            vec![
                (json!("evm_mine"), json!([])),
                (json!("evm_mine"), json!([])),
                (json!("evm_snapshot"), json!([])),
                (json!("evm_revert"), json!([1])),
                (json!("evm_revert"), json!(["0x1"])),
                (json!("evm_setTime"), json!([1_700_000_000_000u64])),
            ]
        );
    }

    #[tokio::test]
    async fn accounts_are_added_before_being_unlocked() {
        // Arrange
        let endpoint = FakeEndpoint::ganache().await;
        let provider = GanacheProvider::new("development", attaching_config(endpoint.port()));
        provider.connect().await.unwrap();
        let address = "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045";

        // Act
        let unlocked = provider.unlock_account(address).await.unwrap();

        // Assert
        assert!(unlocked);
        let calls = endpoint
            .requests()
            .iter()
            .filter(|request| request["method"] != "web3_clientVersion")
            .map(|request| (request["method"].clone(), request["params"].clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            calls,
            vec![
                (json!("evm_addAccount"), json!([address, ""])),
                (
                    json!("personal_unlockAccount"),
                    json!([address, "", 9_999_999_999u64])
                ),
            ]
        );
    }

    #[tokio::test]
    async fn transaction_trace_returns_the_struct_logs() {
        // Arrange
        let endpoint = FakeEndpoint::ganache().await;
        let provider = GanacheProvider::new("development", attaching_config(endpoint.port()));
        provider.connect().await.unwrap();
        let hash = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";

        // Act
        let frames = provider.transaction_trace(hash).await.unwrap();

        // Assert
        let opcodes = frames
            .iter()
            .map(|frame| frame["op"].clone())
            .collect::<Vec<_>>();
        assert_eq!(opcodes, vec![json!("PUSH1"), json!("STOP")]);
        let traced = endpoint
            .requests()
            .into_iter()
            .find(|request| request["method"] == "debug_traceTransaction")
            .unwrap();
        assert_eq!(traced["params"], json!([hash]));
    }

    fn forked_chain_reply(method: &str, _: &Value) -> Value {
        match method {
            "eth_getBlockByNumber" => json!({
                "number": "0x0",
                "hash": "0x0000000000000000000000000000000000000000000000000000000000000001",
            }),
            _ => Value::Null,
        }
    }

    fn forking_config(port: u16, upstream_url: String) -> ProviderConfig {
        ProviderConfig {
            fork: Some(ganache_provider_config::ForkConfig {
                upstream_url,
                block_number: None,
            }),
            ..attaching_config(port)
        }
    }

    #[tokio::test]
    async fn genesis_blocks_are_compared_with_the_upstream_when_forking() {
        // Arrange
        let endpoint = FakeEndpoint::ganache().await;
        let same_chain = FakeEndpoint::ganache().await;
        let other_chain = FakeEndpoint::serve(
            TcpListener::bind("127.0.0.1:0").await.unwrap(),
            Reply::JsonRpc(forked_chain_reply),
        );
        let matching =
            GanacheProvider::new("mainnet-fork", forking_config(endpoint.port(), same_chain.uri()));
        let mismatching = GanacheProvider::new(
            "mainnet-fork",
            forking_config(endpoint.port(), other_chain.uri()),
        );

        // Act
        matching.connect().await.unwrap();
        mismatching.connect().await.unwrap();
        let matches = matching.fork_genesis_matches().await.unwrap();
        let mismatches = mismatching.fork_genesis_matches().await.unwrap();

        // Assert
        assert_eq!(matching.genesis_hash().await.unwrap(), GANACHE_GENESIS_HASH);
        assert_eq!(matches, Some(true));
        assert_eq!(mismatches, Some(false));
        assert!(
            other_chain
                .requests()
                .iter()
                .any(|request| request["method"] == "eth_getBlockByNumber"
                    && request["params"] == json!(["0x0", false]))
        );
    }

    #[tokio::test]
    async fn genesis_check_is_skipped_without_a_fork() {
        // Arrange
        let endpoint = FakeEndpoint::ganache().await;
        let provider = GanacheProvider::new("development", attaching_config(endpoint.port()));
        provider.connect().await.unwrap();

        // Act
        let matches = provider.fork_genesis_matches().await.unwrap();

        // Assert
        assert_eq!(matches, None);
        assert!(
            endpoint
                .requests()
                .iter()
                .all(|request| request["method"] != "eth_getBlockByNumber")
        );
    }

    #[tokio::test]
    #[ignore = "Requires the ganache binary in $PATH"]
    async fn spawns_a_real_ganache() {
        // Arrange
        let provider = GanacheProvider::new(
            "development",
            ProviderConfig {
                port: PortSelection::Auto,
                ..Default::default()
            },
        );

        // Act
        let endpoint = provider.connect().await.unwrap();
        let chain_id = provider.chain_id().await.unwrap();
        provider.mine(3).await.unwrap();
        let block_number = provider.request("eth_blockNumber", json!([])).await.unwrap();
        provider.disconnect().await;

        // Assert
        assert!(endpoint.owned_by_us);
        assert_eq!(chain_id, GANACHE_CHAIN_ID);
        assert_eq!(block_number, json!("0x3"));
        assert_eq!(provider.supervisor().state(), SupervisorState::Idle);
    }
}
