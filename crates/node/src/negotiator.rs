//! Port selection and the probing of endpoints which may already be serving.

use std::{
    collections::BTreeSet,
    net::TcpListener,
    ops::RangeInclusive,
    sync::{LazyLock, Mutex, PoisonError},
    time::Instant,
};

use ganache_provider_config::PortSelection;
use tracing::{debug, instrument, trace};

use crate::{
    constants::{EPHEMERAL_PORTS_END, EPHEMERAL_PORTS_START, PROBE_TIMEOUT},
    error::ProviderStartError,
    handshake::{HandshakeOutcome, handshake, handshake_client},
};

/// The ports handed out by [`ConnectionNegotiator::reserve_unused_port`] in this process.
///
/// A port is never handed out twice, even when the caller that got it never bound it.
static RESERVED_PORTS: LazyLock<Mutex<BTreeSet<u16>>> =
    LazyLock::new(|| Mutex::new(BTreeSet::new()));

/// A port which was free when it was checked. Nothing stops another process from taking it
/// before Ganache binds it, which the supervisor reports as [`ProviderStartError::PortInUse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortReservation {
    pub port: u16,
    /// When the port was resolved. The window between this and the bind is where it can be lost.
    pub checked_at: Instant,
}

/// What was found listening on a port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Probe {
    /// Nothing accepted the connection.
    Absent,
    /// A Ganache server is already serving on the port.
    Compatible { client_version: String },
    /// Something which isn't Ganache answered on the port.
    Incompatible { responder: String },
}

#[derive(Clone, Debug)]
pub struct ConnectionNegotiator {
    hostname: String,
    scan_range: RangeInclusive<u16>,
}

impl ConnectionNegotiator {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            scan_range: EPHEMERAL_PORTS_START..=EPHEMERAL_PORTS_END,
        }
    }

    pub fn with_scan_range(mut self, scan_range: RangeInclusive<u16>) -> Self {
        self.scan_range = scan_range;
        self
    }

    /// Turns the port selection into a concrete port. Fixed ports are returned as they are,
    /// without being checked.
    pub fn resolve_port(
        &self,
        selection: PortSelection,
    ) -> Result<PortReservation, ProviderStartError> {
        match selection {
            PortSelection::Fixed(port) => Ok(PortReservation {
                port,
                checked_at: Instant::now(),
            }),
            PortSelection::Auto => self.reserve_unused_port(),
        }
    }

    /// Finds a port in the scan range which nothing in this process was handed before and which
    /// can currently be bound.
    #[instrument(level = "debug", skip(self), fields(hostname = %self.hostname))]
    pub fn reserve_unused_port(&self) -> Result<PortReservation, ProviderStartError> {
        let mut reserved_ports = RESERVED_PORTS.lock().unwrap_or_else(PoisonError::into_inner);

        for port in self.scan_range.clone() {
            if reserved_ports.contains(&port) {
                continue;
            }
            if !self.is_bindable(port) {
                trace!(port, "Port is taken");
                continue;
            }
            reserved_ports.insert(port);
            debug!(port, "Reserved port");
            return Ok(PortReservation {
                port,
                checked_at: Instant::now(),
            });
        }

        Err(ProviderStartError::NoFreePort {
            start: *self.scan_range.start(),
            end: *self.scan_range.end(),
        })
    }

    fn is_bindable(&self, port: u16) -> bool {
        TcpListener::bind((self.hostname.as_str(), port)).is_ok()
    }

    /// Checks whether something already serves JSON-RPC on `port`.
    #[instrument(level = "debug", skip(self), fields(hostname = %self.hostname))]
    pub async fn probe_existing(&self, port: u16) -> Result<Probe, ProviderStartError> {
        let uri = format!("http://{}:{port}", self.hostname);
        let client =
            handshake_client(PROBE_TIMEOUT).map_err(|error| ProviderStartError::Handshake {
                port,
                reason: error.to_string(),
                output: Default::default(),
            })?;

        let probe = match handshake(&client, &uri).await {
            Ok(HandshakeOutcome::Refused) => Probe::Absent,
            Ok(HandshakeOutcome::Responded(response)) if response.is_ganache() => {
                Probe::Compatible {
                    client_version: response.describe().to_string(),
                }
            }
            Ok(HandshakeOutcome::Responded(response)) => Probe::Incompatible {
                responder: response.describe().to_string(),
            },
            // Something accepted the connection but didn't speak JSON-RPC.
            Err(error) => Probe::Incompatible {
                responder: error.to_string(),
            },
        };
        debug!(?probe, "Probed port");
        Ok(probe)
    }
}

#[cfg(test)]
mod tests {
    use crate::handshake::tests::FakeEndpoint;

    use super::*;

    #[test]
    fn fixed_ports_are_used_as_they_are() {
        // Arrange
        let negotiator = ConnectionNegotiator::new("127.0.0.1");

        // Act
        let port = negotiator.resolve_port(PortSelection::Fixed(8555));

        // Assert
        assert_eq!(port.unwrap().port, 8555);
    }

    #[test]
    fn auto_ports_are_distinct_and_bindable() {
        // Arrange
        let negotiator = ConnectionNegotiator::new("127.0.0.1");

        // Act
        let first = negotiator.resolve_port(PortSelection::Auto).unwrap().port;
        let second = negotiator.resolve_port(PortSelection::Auto).unwrap().port;

        // Assert
        assert_ne!(first, second);
        for port in [first, second] {
            assert!((EPHEMERAL_PORTS_START..=EPHEMERAL_PORTS_END).contains(&port));
            assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
        }
    }

    #[test]
    fn occupied_ports_are_skipped() {
        // Arrange
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let negotiator = ConnectionNegotiator::new("127.0.0.1").with_scan_range(port..=port);

        // Act
        let reservation = negotiator.reserve_unused_port();

        // Assert
        assert!(matches!(
            reservation,
            Err(ProviderStartError::NoFreePort { start, end }) if start == port && end == port
        ));
    }

    #[tokio::test]
    async fn closed_port_probes_as_absent() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let negotiator = ConnectionNegotiator::new("127.0.0.1");

        // Act
        let probe = negotiator.probe_existing(port).await;

        // Assert
        assert_eq!(probe.unwrap(), Probe::Absent);
    }

    #[tokio::test]
    async fn running_ganache_probes_as_compatible() {
        // Arrange
        let endpoint = FakeEndpoint::ganache().await;
        let negotiator = ConnectionNegotiator::new("127.0.0.1");

        // Act
        let probe = negotiator.probe_existing(endpoint.port()).await;

        // Assert
        assert!(matches!(probe.unwrap(), Probe::Compatible { .. }));
    }

    #[tokio::test]
    async fn foreign_json_rpc_server_probes_as_incompatible() {
        // Arrange
        let endpoint =
            FakeEndpoint::raw(r#"{"jsonrpc":"2.0","id":1,"result":"Geth/v1.14.0"}"#).await;
        let negotiator = ConnectionNegotiator::new("127.0.0.1");

        // Act
        let probe = negotiator.probe_existing(endpoint.port()).await;

        // Assert
        assert_eq!(
            probe.unwrap(),
            Probe::Incompatible {
                responder: "Geth/v1.14.0".to_string()
            }
        );
    }

    #[tokio::test]
    async fn non_json_rpc_server_probes_as_incompatible() {
        // Arrange
        let endpoint = FakeEndpoint::raw("<html>hello</html>").await;
        let negotiator = ConnectionNegotiator::new("127.0.0.1");

        // Act
        let probe = negotiator.probe_existing(endpoint.port()).await;

        // Assert
        assert!(matches!(probe.unwrap(), Probe::Incompatible { .. }));
    }
}
