//! The lifecycle of the Ganache endpoint a provider talks to.

use std::{io, ops::ControlFlow, process::ExitStatus};

use ganache_provider_common::futures::{PollingError, PollingWaitBehavior, poll};
use ganache_provider_config::{IncompatibleEndpointPolicy, PortSelection, ProviderConfig};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, instrument, warn};

use crate::{
    command::ganache_arguments,
    constants::{PROBE_TIMEOUT, READINESS_POLL_INTERVAL, STOP_GRACE_PERIOD},
    error::{ProviderError, ProviderStartError},
    handshake::{HandshakeOutcome, HandshakeResponse, handshake, handshake_client},
    negotiator::{ConnectionNegotiator, Probe},
    process::{CapturedOutput, Process},
};

/// The prefix of the log files the subprocess output is mirrored into.
const LOG_FILE_PREFIX: &str = "ganache";

/// Markers Ganache (node) prints when it can't bind its port.
const ADDRESS_IN_USE_MARKERS: [&str; 2] = ["EADDRINUSE", "address already in use"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    #[default]
    Idle,
    Starting,
    Ready,
    Stopping,
    Errored,
}

/// The endpoint the supervisor is managing; at most one exists per supervisor.
#[derive(Debug)]
pub struct ManagedProcess {
    pub bound_port: u16,
    pub uri: String,
    /// False when an already running Ganache was attached to. Such a process is never signalled.
    pub owned_by_us: bool,
    process: Option<Process>,
}

impl ManagedProcess {
    fn attached(bound_port: u16, uri: String) -> Self {
        Self {
            bound_port,
            uri,
            owned_by_us: false,
            process: None,
        }
    }

    fn spawned(bound_port: u16, uri: String, process: Process) -> Self {
        Self {
            bound_port,
            uri,
            owned_by_us: true,
            process: Some(process),
        }
    }

    /// Only known for processes we spawned, and only while they're alive.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Process::id)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            port: self.bound_port,
            uri: self.uri.clone(),
            owned_by_us: self.owned_by_us,
            pid: self.pid(),
        }
    }
}

/// A live JSON-RPC endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub port: u16,
    pub uri: String,
    pub owned_by_us: bool,
    pub pid: Option<u32>,
}

/// Owns at most one Ganache endpoint and drives it through
/// `Idle -> Starting -> Ready -> Stopping -> Idle`, with `Errored` reachable from `Starting` and
/// `Ready`.
///
/// `start` and `stop` are serialized, so they may be called from different tasks. The endpoint
/// itself is only locked for as long as a transition takes to record, which keeps `is_alive`,
/// `endpoint` and `ensure_running` answering while a start is in flight. A `stop` issued during a
/// start aborts it. Dropping a `start` or `stop` future half way leaves the supervisor `Idle` and
/// kills any process it had spawned.
#[derive(Debug)]
pub struct ProcessSupervisor {
    transitions: Mutex<()>,
    managed: Mutex<Option<ManagedProcess>>,
    state: watch::Sender<SupervisorState>,
    /// Bumped by every `stop`; a start gives up once it changes.
    stop_requests: watch::Sender<u64>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        let (stop_requests, _) = watch::channel(0);
        Self {
            transitions: Mutex::new(()),
            managed: Mutex::new(None),
            state,
            stop_requests,
        }
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// A receiver which observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// The current endpoint, if the supervisor is `Ready`.
    pub async fn endpoint(&self) -> Option<Endpoint> {
        let managed = self.managed.lock().await;
        match self.state() {
            SupervisorState::Ready => managed.as_ref().map(ManagedProcess::endpoint),
            _ => None,
        }
    }

    /// Brings up an endpoint for `config` and returns it once it answers JSON-RPC.
    ///
    /// Returns the existing endpoint when already `Ready`. Otherwise, a compatible Ganache
    /// already serving on the configured port is attached to; if nothing serves there, Ganache is
    /// spawned and polled until it answers the handshake or the timeout of the config's timeout
    /// class passes. Auto ports that turn out to be taken are re-resolved, at most
    /// `process_attempts` times. A `stop` call in the meantime makes this return
    /// [`ProviderStartError::Aborted`].
    #[instrument(
        level = "info",
        skip_all,
        fields(port = %config.port, hostname = %config.hostname, fork = config.is_fork())
    )]
    pub async fn start(&self, config: &ProviderConfig) -> Result<Endpoint, ProviderStartError> {
        let mut stop = StopRequest::new(self.stop_requests.subscribe());
        let _transitions = self.transitions.lock().await;
        if self.state() == SupervisorState::Ready {
            if let Some(managed) = self.managed.lock().await.as_ref() {
                debug!(port = managed.bound_port, "Already running");
                return Ok(managed.endpoint());
            }
        }

        let transition = Transition::begin(&self.state, SupervisorState::Starting);
        match bring_up(config, &mut stop).await {
            Ok(managed) => {
                let endpoint = managed.endpoint();
                info!(
                    port = endpoint.port,
                    owned_by_us = endpoint.owned_by_us,
                    pid = endpoint.pid,
                    "Ganache is ready"
                );
                *self.managed.lock().await = Some(managed);
                transition.settle(SupervisorState::Ready);
                Ok(endpoint)
            }
            Err(ProviderStartError::Aborted) => {
                info!("Start was aborted by a stop request");
                transition.settle(SupervisorState::Idle);
                Err(ProviderStartError::Aborted)
            }
            Err(error) => {
                warn!(%error, "Failed to start Ganache");
                transition.settle(SupervisorState::Errored);
                Err(error)
            }
        }
    }

    /// Stops the endpoint and returns to `Idle`, aborting a start which is still in flight.
    ///
    /// An attached endpoint is only forgotten. A spawned one is sent a graceful termination
    /// signal and killed if it's still running after the grace period. Never fails; problems are
    /// logged.
    #[instrument(level = "info", skip_all)]
    pub async fn stop(&self) {
        self.stop_requests
            .send_modify(|requests| *requests = requests.wrapping_add(1));
        let _transitions = self.transitions.lock().await;

        let Some(mut current) = self.managed.lock().await.take() else {
            if self.state() != SupervisorState::Idle {
                self.state.send_replace(SupervisorState::Idle);
            }
            return;
        };

        let transition = Transition::begin(&self.state, SupervisorState::Stopping);
        match current.process.as_mut() {
            Some(process) => {
                let status = process.shutdown(STOP_GRACE_PERIOD).await;
                info!(port = current.bound_port, ?status, "Stopped Ganache");
            }
            None => info!(port = current.bound_port, "Detached from Ganache"),
        }
        transition.settle(SupervisorState::Idle);
    }

    /// Whether the endpoint is still there: the spawned process is still running, or the
    /// attached endpoint still answers the handshake. False in every state but `Ready`. Doesn't
    /// change the state.
    pub async fn is_alive(&self) -> bool {
        if self.state() != SupervisorState::Ready {
            return false;
        }

        let attached_uri = {
            let mut managed = self.managed.lock().await;
            let Some(current) = managed.as_mut() else {
                return false;
            };
            match current.process.as_mut() {
                Some(process) => return matches!(process.try_wait(), Ok(None)),
                None => current.uri.clone(),
            }
        };
        endpoint_answers(&attached_uri).await
    }

    /// Returns the endpoint if it's still usable.
    ///
    /// A spawned process which died since it became ready moves the supervisor to `Errored` and
    /// is reported as [`ProviderError::UnexpectedExit`] once.
    pub async fn ensure_running(&self) -> Result<Endpoint, ProviderError> {
        let mut managed = self.managed.lock().await;
        if self.state() != SupervisorState::Ready {
            return Err(ProviderError::NotConnected);
        }
        let Some(current) = managed.as_mut() else {
            return Err(ProviderError::NotConnected);
        };

        let exit = match current.process.as_mut() {
            Some(process) => match process.try_wait() {
                Ok(Some(status)) => {
                    process.drain_output().await;
                    Some((status.to_string(), process.captured_output()))
                }
                Ok(None) => None,
                Err(error) => Some((error.to_string(), process.captured_output())),
            },
            None => None,
        };

        match exit {
            None => Ok(current.endpoint()),
            Some((status, output)) => {
                let port = current.bound_port;
                warn!(port, %status, "Ganache exited unexpectedly");
                *managed = None;
                self.state.send_replace(SupervisorState::Errored);
                Err(ProviderError::UnexpectedExit {
                    port,
                    status,
                    output,
                })
            }
        }
    }
}

/// Moves the supervisor into a transient state and guarantees that it leaves it again.
///
/// If the guard is dropped without being settled, i.e. the future driving the transition was
/// cancelled, the supervisor returns to `Idle`. The process the transition was working on is
/// dropped along with that future, which kills it.
struct Transition<'a> {
    state: &'a watch::Sender<SupervisorState>,
    settled: bool,
}

impl<'a> Transition<'a> {
    fn begin(state: &'a watch::Sender<SupervisorState>, to: SupervisorState) -> Self {
        state.send_replace(to);
        Self {
            state,
            settled: false,
        }
    }

    fn settle(mut self, to: SupervisorState) {
        self.state.send_replace(to);
        self.settled = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let state = *self.state.borrow();
        warn!(?state, "Transition was cancelled, resetting to idle");
        self.state.send_replace(SupervisorState::Idle);
    }
}

/// Completes once `stop` is called after the start holding it began.
struct StopRequest {
    requests: watch::Receiver<u64>,
    seen: u64,
}

impl StopRequest {
    fn new(requests: watch::Receiver<u64>) -> Self {
        let seen = *requests.borrow();
        Self { requests, seen }
    }

    async fn requested(&mut self) {
        let seen = self.seen;
        if self
            .requests
            .wait_for(|requests| *requests != seen)
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    }
}

/// Attaches to a compatible Ganache on the configured port or spawns a new one.
async fn bring_up(
    config: &ProviderConfig,
    stop: &mut StopRequest,
) -> Result<ManagedProcess, ProviderStartError> {
    let negotiator = ConnectionNegotiator::new(config.hostname.clone());
    let attempts = config.process_attempts.max(1);
    let mut selection = config.port;

    if let PortSelection::Fixed(port) = selection {
        check_fork_target(config, port)?;
        let probe = tokio::select! {
            probe = negotiator.probe_existing(port) => probe?,
            _ = stop.requested() => return Err(ProviderStartError::Aborted),
        };
        match probe {
            Probe::Absent => {}
            Probe::Compatible { client_version } => {
                info!(port, %client_version, "Attaching to a running Ganache");
                return Ok(ManagedProcess::attached(port, config.uri(port)));
            }
            Probe::Incompatible { responder } => match config.on_incompatible {
                IncompatibleEndpointPolicy::Fail => {
                    return Err(ProviderStartError::IncompatibleEndpoint { port, responder });
                }
                IncompatibleEndpointPolicy::SpawnElsewhere => {
                    warn!(port, %responder, "Port is taken, using another one");
                    selection = PortSelection::Auto;
                }
            },
        }
    }

    let mut attempt = 1;
    loop {
        let reservation = negotiator.resolve_port(selection)?;
        let port = reservation.port;
        check_fork_target(config, port)?;

        match spawn_and_wait(config, port, stop).await {
            Ok(process) => return Ok(ManagedProcess::spawned(port, config.uri(port), process)),
            Err(error) if error.is_retryable() && selection.is_auto() && attempt < attempts => {
                warn!(
                    port,
                    attempt,
                    attempts,
                    since_check = ?reservation.checked_at.elapsed(),
                    "Port was taken before Ganache bound it, retrying"
                );
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

fn check_fork_target(config: &ProviderConfig, port: u16) -> Result<(), ProviderStartError> {
    match config.fork.as_ref() {
        Some(fork) if fork.points_at(&config.uri(port)) => {
            Err(ProviderStartError::ForkPointsAtSelf {
                url: fork.upstream_url.clone(),
            })
        }
        _ => Ok(()),
    }
}

async fn endpoint_answers(uri: &str) -> bool {
    let Ok(client) = handshake_client(PROBE_TIMEOUT) else {
        return false;
    };
    matches!(
        handshake(&client, uri).await,
        Ok(HandshakeOutcome::Responded(_))
    )
}

/// Why a spawned process never became ready.
enum ReadinessFailure {
    Exited(ExitStatus),
    TimedOut,
    Handshake(String),
    Wait(io::Error),
    Aborted,
}

/// Spawns Ganache on `port` and waits until it answers the handshake. On failure the process has
/// been killed and its output is attached to the error.
#[instrument(level = "debug", skip(config, stop))]
async fn spawn_and_wait(
    config: &ProviderConfig,
    port: u16,
    stop: &mut StopRequest,
) -> Result<Process, ProviderStartError> {
    let arguments = ganache_arguments(config, port);
    debug!(binary = %config.ganache_binary.display(), ?arguments, "Spawning Ganache");

    let mut process = Process::new(
        LOG_FILE_PREFIX,
        config.logs_directory.as_deref(),
        &config.ganache_binary,
        |command| {
            command.args(&arguments);
        },
    )
    .map_err(|error| match error.kind() {
        io::ErrorKind::NotFound => ProviderStartError::NotInstalled {
            binary: config.ganache_binary.clone(),
        },
        _ => ProviderStartError::ProcessStart {
            reason: error.to_string(),
            output: CapturedOutput::default(),
        },
    })?;

    let failure = match wait_ready(&mut process, config, port, stop).await {
        Ok(response) => {
            debug!(client_version = response.describe(), "Ganache answered the handshake");
            return Ok(process);
        }
        Err(failure) => failure,
    };

    process.kill_and_wait().await;
    process.drain_output().await;
    let output = process.captured_output();

    Err(match failure {
        ReadinessFailure::Aborted => ProviderStartError::Aborted,
        _ if ADDRESS_IN_USE_MARKERS
            .iter()
            .any(|marker| output.contains(marker)) =>
        {
            ProviderStartError::PortInUse { port, output }
        }
        ReadinessFailure::Exited(status) => ProviderStartError::ProcessStart {
            reason: format!("Ganache exited with {status} before it was ready"),
            output,
        },
        ReadinessFailure::Wait(error) => ProviderStartError::ProcessStart {
            reason: format!("Failed to observe the Ganache process: {error}"),
            output,
        },
        ReadinessFailure::TimedOut => ProviderStartError::ReadinessTimeout {
            port,
            timeout: config.timeout(),
            output,
        },
        ReadinessFailure::Handshake(reason) => ProviderStartError::Handshake {
            port,
            reason,
            output,
        },
    })
}

/// Polls the handshake until it succeeds while watching the process for an early exit.
async fn wait_ready(
    process: &mut Process,
    config: &ProviderConfig,
    port: u16,
    stop: &mut StopRequest,
) -> Result<HandshakeResponse, ReadinessFailure> {
    let client = handshake_client(config.timeout())
        .map_err(|error| ReadinessFailure::Handshake(error.to_string()))?;
    let uri = config.uri(port);

    let readiness = poll(
        config.timeout(),
        PollingWaitBehavior::Constant(READINESS_POLL_INTERVAL),
        || {
            let client = &client;
            let uri = uri.as_str();
            async move {
                match handshake(client, uri).await {
                    Ok(HandshakeOutcome::Refused) => Ok(ControlFlow::Continue(())),
                    Ok(HandshakeOutcome::Responded(response)) => Ok(ControlFlow::Break(response)),
                    Err(error) => Err(error),
                }
            }
        },
    );

    let response = tokio::select! {
        readiness = readiness => readiness.map_err(|error| match error {
            PollingError::TimedOut { .. } => ReadinessFailure::TimedOut,
            PollingError::Failed(error) => ReadinessFailure::Handshake(error.to_string()),
        })?,
        status = process.wait() => {
            return Err(match status {
                Ok(status) => ReadinessFailure::Exited(status),
                Err(error) => ReadinessFailure::Wait(error),
            });
        }
        _ = stop.requested() => return Err(ReadinessFailure::Aborted),
    };

    // Whatever answered may not be our process if it died right after another one took the port.
    match process.try_wait() {
        Ok(None) => Ok(response),
        Ok(Some(status)) => Err(ReadinessFailure::Exited(status)),
        Err(error) => Err(ReadinessFailure::Wait(error)),
    }
}
