//! Starter Service
//!
//! One starter instance: decides between relaunch and fresh start, commits the
//! peer list, starts local slaves and database servers, and serves the control
//! plane until it is shut down.

mod id;
mod local_slaves;
mod peers;
mod runner;
mod setup;
mod state;

pub use id::create_unique_id;
pub use local_slaves::{
    LocalSlaves, allocate_local_slaves, master_address, slave_config, slave_port,
    start_local_slaves,
};
pub use peers::{PORT_OFFSET_INCREMENT, Peer, Peers, join_host_port};
pub use runner::{ProcessRunner, Runner, ServerHandle, ServerSpec};
pub use setup::{
    FreshStartReason, Relaunch, RelaunchOutcome, SETUP_CONFIG_VERSION, SETUP_FILE_NAME,
    SetupConfigFile, SetupRecord, SetupStore,
};
pub use state::{ServiceState, StateCell};

use crate::client::{ProcessList, ServerProcess, ServerType, StarterClient};
use crate::server::{self, ControlSurface};
use crate::waiter::What;
use crate::{Error, Result};
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const DEFAULT_STARTER_PORT: u16 = 8528;

pub const DEFAULT_AGENCY_SIZE: usize = 3;

/// Grace period for database servers to stop before they are killed.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(60);

const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

const PROBE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    Single,
    Cluster,
}

impl ServiceMode {
    pub fn what(self) -> What {
        match self {
            ServiceMode::Single => What::SingleServer,
            ServiceMode::Cluster => What::Cluster,
        }
    }
}

/// Starter configuration. Local slaves get a modified clone of their
/// parent's.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed peer ID. Generated when absent.
    pub id: Option<String>,

    pub data_dir: PathBuf,

    /// Address announced to other peers. Empty means loopback.
    pub own_address: String,

    /// Control-plane port, also the base of this peer's server ports.
    pub port: u16,

    /// `host:port` of the master to join.
    pub master_address: Option<String>,

    pub mode: ServiceMode,

    pub start_local_slaves: bool,

    pub agency_size: usize,

    pub secure: bool,

    pub ready_timeout: Duration,

    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: None,
            data_dir: PathBuf::from("."),
            own_address: String::new(),
            port: DEFAULT_STARTER_PORT,
            master_address: None,
            mode: ServiceMode::Cluster,
            start_local_slaves: false,
            agency_size: DEFAULT_AGENCY_SIZE,
            secure: false,
            ready_timeout: SERVER_READY_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.agency_size == 0 {
            return Err(Error::InvalidConfig {
                reason: "agency size must be at least 1".to_string(),
            });
        }
        if self.start_local_slaves && self.mode == ServiceMode::Single {
            return Err(Error::InvalidConfig {
                reason: "local slaves require cluster mode".to_string(),
            });
        }
        if self.port.checked_add(ServerType::MAX_PORT_DELTA).is_none() {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "starter port {} leaves no room for server ports (at most {})",
                    self.port,
                    u16::MAX - ServerType::MAX_PORT_DELTA
                ),
            });
        }
        if self.master_address.as_deref().is_some_and(str::is_empty) {
            return Err(Error::InvalidConfig {
                reason: "master address must not be empty".to_string(),
            });
        }
        Ok(())
    }

    fn listen_address(&self) -> String {
        let host = if self.own_address.is_empty() {
            "0.0.0.0"
        } else {
            self.own_address.as_str()
        };
        join_host_port(host, self.port)
    }
}

/// State shared between a running service, its control plane and handles.
struct Shared {
    id: String,
    state: StateCell,
    peers: RwLock<Option<Arc<Peers>>>,
    processes: RwLock<Vec<ServerProcess>>,
    shutdown_requested: AtomicBool,
    force: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    /// Replaces the published peer list. Readers keep the snapshot they hold.
    fn publish_peers(&self, peers: Arc<Peers>) {
        *self.peers.write().unwrap_or_else(|e| e.into_inner()) = Some(peers);
    }

    fn publish_processes(&self, processes: Vec<ServerProcess>) {
        *self.processes.write().unwrap_or_else(|e| e.into_inner()) = processes;
    }

    fn request_shutdown(&self, force: bool) -> bool {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return false;
        }
        self.force.store(force, Ordering::SeqCst);
        self.state.advance(ServiceState::ShuttingDown);
        info!(force, "Shutdown requested");
        self.cancel.cancel();
        true
    }
}

impl ControlSurface for Shared {
    fn processes(&self) -> ProcessList {
        ProcessList {
            servers: self
                .processes
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    fn peers(&self) -> Option<Arc<Peers>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn shutdown(&self, force: bool) -> bool {
        self.request_shutdown(force)
    }

    fn state(&self) -> ServiceState {
        self.state.get()
    }
}

/// Cheap handle for observing and stopping a service from outside.
#[derive(Clone)]
pub struct ServiceHandle {
    shared: Arc<Shared>,
}

impl ServiceHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> ServiceState {
        self.shared.state.get()
    }

    pub fn peers(&self) -> Option<Arc<Peers>> {
        ControlSurface::peers(self.shared.as_ref())
    }

    pub fn processes(&self) -> ProcessList {
        ControlSurface::processes(self.shared.as_ref())
    }

    /// Starts shutting down. Returns `false` when a shutdown was already
    /// under way; that call changes nothing.
    pub fn shutdown(&self, force: bool) -> bool {
        self.shared.request_shutdown(force)
    }
}

pub struct Service {
    config: Config,
    is_local_slave: bool,
    runner: Arc<dyn Runner>,
    setup: SetupStore,
    outcome: RelaunchOutcome,
    master: Option<StarterClient>,
    shared: Arc<Shared>,
}

impl Service {
    /// Creates a top-level starter. Cancelling `parent` stops it.
    pub fn new(
        config: Config,
        runner: Arc<dyn Runner>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        Self::create(config, runner, parent, false)
    }

    pub(crate) fn new_local_slave(
        config: Config,
        runner: Arc<dyn Runner>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        Self::create(config, runner, parent, true)
    }

    fn create(
        mut config: Config,
        runner: Arc<dyn Runner>,
        parent: &CancellationToken,
        is_local_slave: bool,
    ) -> Result<Self> {
        if is_local_slave {
            config.start_local_slaves = false;
        }
        config.validate()?;

        let master = config
            .master_address
            .as_deref()
            .map(|addr| StarterClient::new(&format!("http://{}", addr)))
            .transpose()?;

        let setup = SetupStore::new(&config.data_dir);
        let outcome = setup.try_relaunch();
        let id = match (&outcome, &config.id) {
            (RelaunchOutcome::Relaunched(relaunch), _) => relaunch.id.clone(),
            (RelaunchOutcome::FreshStart(_), Some(id)) => id.clone(),
            (RelaunchOutcome::FreshStart(_), None) => create_unique_id()?,
        };

        let shared = Arc::new(Shared {
            id,
            state: StateCell::default(),
            peers: RwLock::new(None),
            processes: RwLock::new(Vec::new()),
            shutdown_requested: AtomicBool::new(false),
            force: AtomicBool::new(false),
            cancel: parent.child_token(),
        });

        Ok(Self {
            config,
            is_local_slave,
            runner,
            setup,
            outcome,
            master,
            shared,
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn is_local_slave(&self) -> bool {
        self.is_local_slave
    }

    pub fn outcome(&self) -> &RelaunchOutcome {
        &self.outcome
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs the starter until it is shut down.
    ///
    /// Boxed because local slaves run this same future inside their parent's.
    pub fn run(self) -> BoxFuture<'static, Result<()>> {
        let span = info_span!("starter", id = %self.shared.id);
        Box::pin(self.run_inner().instrument(span))
    }

    async fn run_inner(self) -> Result<()> {
        let Service {
            config,
            runner,
            setup,
            outcome,
            master,
            shared,
            ..
        } = self;
        let cancel = shared.cancel.clone();

        let listen = config.listen_address();
        let listener = server::bind(&listen).await?;
        let surface: Arc<dyn ControlSurface> = shared.clone();
        let control_plane = tokio::spawn(server::serve(listener, surface, cancel.clone()));

        let mut slaves = LocalSlaves::default();
        let committed = match outcome {
            RelaunchOutcome::Relaunched(relaunch) => {
                shared.state.advance(ServiceState::Relaunching);
                info!(
                    "Relaunching service with id '{}' on {}...",
                    shared.id,
                    join_host_port(host_or_loopback(&config.own_address), config.port)
                );
                let peers = Arc::new(relaunch.peers);
                shared.publish_peers(Arc::clone(&peers));
                if relaunch.start_local_slaves {
                    slaves =
                        start_local_slaves(&config, &shared.id, &peers.peers, &runner, &cancel);
                }
                Some(peers)
            }
            RelaunchOutcome::FreshStart(reason) => {
                shared.state.advance(ServiceState::Negotiating);
                debug!(?reason, "Starting fresh");
                match master {
                    Some(master) => {
                        let peers = join_master(&master, &shared.id, &cancel).await;
                        if let Some(peers) = &peers {
                            save_setup(&setup, peers, &shared.id, false);
                            shared.publish_peers(Arc::clone(peers));
                        }
                        peers
                    }
                    None => {
                        let peers = bootstrap_peers(&config, &shared.id);
                        let with_slaves = config.start_local_slaves;
                        save_setup(&setup, &peers, &shared.id, with_slaves);
                        shared.publish_peers(Arc::clone(&peers));
                        if with_slaves {
                            slaves = start_local_slaves(
                                &config,
                                &shared.id,
                                &peers.peers,
                                &runner,
                                &cancel,
                            );
                        }
                        Some(peers)
                    }
                }
            }
        };

        let mut servers = Vec::new();
        if let Some(peers) = committed {
            if shared.state.advance(ServiceState::Running) {
                servers = start_servers(runner.as_ref(), &peers, &shared.id, config.mode);
                let processes: Vec<ServerProcess> =
                    servers.iter().map(|s| s.process().clone()).collect();
                shared.publish_processes(processes.clone());

                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = announce_when_ready(&processes, config.mode, config.ready_timeout) => {}
                }
            }
        }

        cancel.cancelled().await;
        shared.state.advance(ServiceState::ShuttingDown);
        info!("Shutting down starter...");

        let force = shared.force.load(Ordering::SeqCst);
        let grace = if force {
            Duration::ZERO
        } else {
            config.shutdown_timeout
        };
        stop_servers(&mut servers, force, grace).await;
        if !slaves.is_empty() {
            info!("Waiting for {} local slaves to stop...", slaves.len());
            slaves.wait_timeout(config.shutdown_timeout).await;
        }
        match tokio::time::timeout(config.shutdown_timeout, control_plane).await {
            Ok(Ok(Err(err))) => warn!("Control plane stopped with error: {}", err),
            Ok(Err(err)) => warn!("Control plane task failed: {}", err),
            Err(_) => warn!("Control plane did not stop in time"),
            Ok(Ok(Ok(()))) => {}
        }

        shared.state.advance(ServiceState::Terminated);
        info!("Starter stopped");
        Ok(())
    }
}

fn host_or_loopback(address: &str) -> &str {
    if address.is_empty() {
        "127.0.0.1"
    } else {
        address
    }
}

/// Peer list of a fresh master: itself plus its local slaves, if any.
fn bootstrap_peers(config: &Config, id: &str) -> Arc<Peers> {
    let agency_size = match config.mode {
        ServiceMode::Single => 1,
        ServiceMode::Cluster => config.agency_size,
    };
    let mut peers = Peers::new(agency_size);
    let me = Peer::new(id, config.own_address.clone(), config.port, config.data_dir.clone())
        .with_agent(config.mode == ServiceMode::Cluster)
        .with_secure(config.secure);
    if let Err(err) = peers.add(me) {
        error!("Cannot register own peer: {}", err);
    }
    if config.start_local_slaves {
        for slave in allocate_local_slaves(config, agency_size) {
            if let Err(err) = peers.add(slave) {
                error!("Cannot register local slave: {}", err);
            }
        }
    }
    Arc::new(peers)
}

fn save_setup(setup: &SetupStore, peers: &Peers, id: &str, start_local_slaves: bool) {
    if let Err(err) = setup.save(peers, id, start_local_slaves) {
        error!(
            "{}. The starter keeps running, but a restart will not resume this setup",
            err
        );
    }
}

/// Fetches the committed peer list from the master until it includes us.
/// Returns `None` when cancelled first.
async fn join_master(
    master: &StarterClient,
    id: &str,
    cancel: &CancellationToken,
) -> Option<Arc<Peers>> {
    info!("Joining master at {}...", master.endpoint());
    loop {
        match master.hello().await {
            Ok(peers) if peers.find(id).is_some() => {
                info!("Joined cluster of {} peers", peers.len());
                return Some(Arc::new(peers));
            }
            Ok(_) => warn!("Master at {} does not list this peer", master.endpoint()),
            Err(err) => debug!("Master not reachable yet: {}", err),
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(JOIN_RETRY_INTERVAL) => {}
        }
    }
}

fn server_types(peer: &Peer, mode: ServiceMode) -> Vec<ServerType> {
    match mode {
        ServiceMode::Single => vec![ServerType::Single],
        ServiceMode::Cluster => {
            let mut types = Vec::with_capacity(3);
            if peer.has_agent {
                types.push(ServerType::Agent);
            }
            types.push(ServerType::DbServer);
            types.push(ServerType::Coordinator);
            types
        }
    }
}

fn start_servers(
    runner: &dyn Runner,
    peers: &Peers,
    id: &str,
    mode: ServiceMode,
) -> Vec<Box<dyn ServerHandle>> {
    let Some(me) = peers.find(id) else {
        error!("Own peer '{}' is missing from the peer list", id);
        return Vec::new();
    };
    let mut handles = Vec::new();
    for server_type in server_types(me, mode) {
        let spec = match ServerSpec::for_peer(me, peers, server_type) {
            Ok(spec) => spec,
            Err(err) => {
                error!("Cannot start {}: {}", server_type, err);
                continue;
            }
        };
        match runner.start(&spec) {
            Ok(handle) => {
                info!("Started {} on {}:{}", server_type, spec.ip, spec.port);
                handles.push(handle);
            }
            Err(err) => error!("Failed to start {}: {}", server_type, err),
        }
    }
    handles
}

async fn probe(process: &ServerProcess, timeout: Duration) -> Result<()> {
    let address = join_host_port(&process.ip, process.port);
    let deadline = Instant::now() + timeout;
    loop {
        let last = match tokio::net::TcpStream::connect(&address).await {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        if Instant::now() >= deadline {
            return Err(Error::Unreachable {
                endpoint: process.endpoint(),
                reason: last.to_string(),
            });
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

/// Probes every server and logs the readiness line once the entry server
/// answers.
async fn announce_when_ready(processes: &[ServerProcess], mode: ServiceMode, timeout: Duration) {
    let results =
        futures::future::join_all(processes.iter().map(|p| probe(p, timeout))).await;
    let mut all_ready = true;
    for result in results {
        if let Err(err) = result {
            all_ready = false;
            warn!("{}", err);
        }
    }

    let entry = match mode {
        ServiceMode::Single => ServerType::Single,
        ServiceMode::Cluster => ServerType::Coordinator,
    };
    let Some(entry) = processes.iter().find(|p| p.server_type == entry) else {
        warn!("No {} server running, nothing to announce", entry);
        return;
    };
    if all_ready {
        info!(
            "Your {} can now be accessed with a browser at {}",
            mode.what().label(),
            entry.endpoint()
        );
    }
}

async fn stop_servers(servers: &mut [Box<dyn ServerHandle>], force: bool, grace: Duration) {
    for server in servers.iter_mut() {
        let process = server.process().clone();
        let result = if force {
            server.kill()
        } else {
            server.terminate()
        };
        if let Err(err) = result {
            warn!("Failed to stop {} on port {}: {}", process.server_type, process.port, err);
        }
    }

    let deadline = Instant::now() + grace;
    loop {
        let mut remaining = 0;
        for server in servers.iter_mut() {
            if !server.has_exited().unwrap_or(true) {
                remaining += 1;
            }
        }
        if remaining == 0 {
            return;
        }
        if Instant::now() >= deadline {
            warn!("{} servers did not stop in time, killing them", remaining);
            for server in servers.iter_mut() {
                if let Err(err) = server.kill() {
                    warn!("Failed to kill {}: {}", server.process().server_type, err);
                }
            }
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let zero_agency = Config {
            agency_size: 0,
            ..Config::default()
        };
        assert!(zero_agency.validate().is_err());

        let single_with_slaves = Config {
            mode: ServiceMode::Single,
            start_local_slaves: true,
            ..Config::default()
        };
        assert!(single_with_slaves.validate().is_err());
    }

    #[test]
    fn starter_port_must_leave_room_for_servers() {
        let edge = Config {
            port: 65532,
            ..Config::default()
        };
        assert!(edge.validate().is_ok());

        for port in [65533, 65535] {
            let err = Config {
                port,
                ..Config::default()
            }
            .validate()
            .unwrap_err();
            assert_eq!(err.kind(), "invalid_config");
        }
    }

    #[test]
    fn bootstrap_single_has_one_peer() {
        let config = Config {
            mode: ServiceMode::Single,
            ..Config::default()
        };
        let peers = bootstrap_peers(&config, "me");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers.agency_size, 1);
        assert!(peers.is_master("me"));
        assert_eq!(peers.agent_count(), 0);
    }

    #[test]
    fn bootstrap_local_cluster_fills_agency() {
        let config = Config {
            start_local_slaves: true,
            agency_size: 3,
            ..Config::default()
        };
        let peers = bootstrap_peers(&config, "me");
        assert_eq!(peers.len(), 3);
        assert_eq!(peers.agent_count(), 3);
        assert!(peers.is_master("me"));
    }

    #[test]
    fn server_roles_per_mode() {
        let agent = Peer::new("a", "", 8528, PathBuf::from("/a")).with_agent(true);
        let plain = Peer::new("b", "", 8533, PathBuf::from("/b"));

        assert_eq!(server_types(&agent, ServiceMode::Single), vec![ServerType::Single]);
        assert_eq!(
            server_types(&agent, ServiceMode::Cluster),
            vec![ServerType::Agent, ServerType::DbServer, ServerType::Coordinator]
        );
        assert_eq!(
            server_types(&plain, ServiceMode::Cluster),
            vec![ServerType::DbServer, ServerType::Coordinator]
        );
    }

    #[test]
    fn listen_address_defaults_to_any() {
        let config = Config {
            port: 9000,
            ..Config::default()
        };
        assert_eq!(config.listen_address(), "0.0.0.0:9000");
    }
}
