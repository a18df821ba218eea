use std::time::Duration;

/// The chain id Ganache runs with unless told otherwise.
pub const GANACHE_CHAIN_ID: u64 = 1337;

/// The interval between two readiness handshakes while Ganache is starting.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long Ganache gets to exit after the termination signal before it's killed.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// The request timeout used when checking whether something is already listening on a port.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// The first port of the IANA ephemeral range, where automatically selected ports come from.
pub const EPHEMERAL_PORTS_START: u16 = 49152;

/// The last port automatically selected ports come from.
pub const EPHEMERAL_PORTS_END: u16 = 60999;

/// How long `personal_unlockAccount` keeps an account unlocked, in seconds.
pub const UNLOCK_DURATION_SECONDS: u64 = 9_999_999_999;
