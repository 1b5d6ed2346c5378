//! Local Slaves
//!
//! A starter started with `--starter.local` fills the agency on its own host:
//! it allocates `agency_size - 1` extra peers and runs one starter instance
//! for each of them inside the same process.

use super::id::create_unique_id;
use super::peers::{PORT_OFFSET_INCREMENT, join_host_port};
use super::runner::Runner;
use super::{Config, Peer, Service};
use crate::client::ServerType;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Allocates the peers for local slaves 2..=agency_size.
///
/// A slave whose ID cannot be generated, or whose ports would lie beyond the
/// last TCP port, is left out; the agency then runs short, which shows up
/// later as a readiness problem.
pub fn allocate_local_slaves(parent: &Config, agency_size: usize) -> Vec<Peer> {
    allocate_with(parent, agency_size, create_unique_id)
}

pub(crate) fn allocate_with<F>(parent: &Config, agency_size: usize, mut generate: F) -> Vec<Peer>
where
    F: FnMut() -> Result<String>,
{
    let mut peers = Vec::with_capacity(agency_size.saturating_sub(1));
    for index in 2..=agency_size {
        let ordinal = index - 1;
        let Some(port) = slave_port(parent.port, ordinal) else {
            error!(
                "No port left for local slave {} above starter port {}",
                ordinal, parent.port
            );
            continue;
        };
        let id = match generate() {
            Ok(id) => id,
            Err(err) => {
                error!("Failed to create unique ID for local slave {}: {}", ordinal, err);
                continue;
            }
        };
        let data_dir = parent.data_dir.join(format!("local-slave-{}", ordinal));
        peers.push(
            Peer::new(id, parent.own_address.clone(), port, data_dir)
                .with_agent(true)
                .with_secure(parent.secure),
        );
    }
    peers
}

/// Starter port of local slave `ordinal`. `None` unless the slave and all
/// of its servers fit below the last TCP port.
pub fn slave_port(parent_port: u16, ordinal: usize) -> Option<u16> {
    let offset = u16::try_from(ordinal)
        .ok()?
        .checked_mul(PORT_OFFSET_INCREMENT)?;
    let port = parent_port.checked_add(offset)?;
    port.checked_add(ServerType::MAX_PORT_DELTA)?;
    Some(port)
}

/// `host:port` of the master as seen by its local slaves.
pub fn master_address(parent: &Config) -> String {
    let host = if parent.own_address.is_empty() {
        "127.0.0.1"
    } else {
        parent.own_address.as_str()
    };
    join_host_port(host, parent.port)
}

/// Derives a slave's configuration from its parent's.
pub fn slave_config(parent: &Config, peer: &Peer, master: &str) -> Config {
    let mut config = parent.clone();
    config.id = Some(peer.id.clone());
    config.data_dir = peer.data_dir.clone();
    config.port = peer.port;
    config.master_address = Some(master.to_string());
    config.start_local_slaves = false;
    config
}

/// Running local slave instances.
#[derive(Debug, Default)]
pub struct LocalSlaves {
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl LocalSlaves {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits until every slave has exited.
    pub async fn wait(self) {
        for (id, task) in self.tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(slave = %id, "Local slave failed: {}", err),
                Err(err) => error!(slave = %id, "Local slave task aborted: {}", err),
            }
        }
    }

    /// Like [`LocalSlaves::wait`], but gives up after `timeout` and aborts
    /// whatever is still running.
    pub async fn wait_timeout(self, timeout: Duration) {
        let aborts: Vec<_> = self.tasks.iter().map(|(_, t)| t.abort_handle()).collect();
        if tokio::time::timeout(timeout, self.wait()).await.is_err() {
            warn!("Local slaves did not stop within {:?}, aborting them", timeout);
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

/// Starts a starter instance for every peer in `peers` except `self_id`.
///
/// Each slave's configuration is complete before it starts. All slaves run
/// under `cancel`, so cancelling it stops every one of them. A slave that
/// cannot be created is logged and skipped.
pub fn start_local_slaves(
    parent: &Config,
    self_id: &str,
    peers: &[Peer],
    runner: &Arc<dyn Runner>,
    cancel: &CancellationToken,
) -> LocalSlaves {
    let expected = peers.iter().filter(|p| p.id != self_id).count();
    info!("Starting {} local slaves...", expected);

    let master = master_address(parent);
    let mut slaves = LocalSlaves::default();
    for (index, peer) in peers.iter().enumerate() {
        if peer.id == self_id {
            continue;
        }
        let config = slave_config(parent, peer, &master);
        if let Err(err) = std::fs::create_dir_all(&config.data_dir) {
            error!(
                "{}",
                Error::Spawn {
                    index,
                    reason: format!("cannot create {}: {}", config.data_dir.display(), err),
                }
            );
            continue;
        }
        let slave = match Service::new_local_slave(config, Arc::clone(runner), cancel) {
            Ok(slave) => slave,
            Err(err) => {
                error!(
                    "{}",
                    Error::Spawn {
                        index,
                        reason: err.to_string(),
                    }
                );
                continue;
            }
        };
        let id = slave.id().to_string();
        slaves.tasks.push((id, tokio::spawn(slave.run())));
    }
    slaves
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn parent() -> Config {
        Config {
            id: Some("parent".to_string()),
            data_dir: PathBuf::from("/var/lib/starter"),
            port: 8528,
            agency_size: 3,
            start_local_slaves: true,
            ..Config::default()
        }
    }

    #[test]
    fn allocates_agency_size_minus_one() {
        for n in 1..=5 {
            let peers = allocate_local_slaves(&parent(), n);
            assert_eq!(peers.len(), n.saturating_sub(1));

            let ids: HashSet<_> = peers.iter().map(|p| p.id.clone()).collect();
            let dirs: HashSet<_> = peers.iter().map(|p| p.data_dir.clone()).collect();
            assert_eq!(ids.len(), peers.len());
            assert_eq!(dirs.len(), peers.len());
            assert!(!ids.contains("parent"));
            assert!(peers.iter().all(|p| p.has_agent));
        }
    }

    #[test]
    fn slave_layout() {
        let peers = allocate_local_slaves(&parent(), 3);
        assert_eq!(peers[0].data_dir, PathBuf::from("/var/lib/starter/local-slave-1"));
        assert_eq!(peers[1].data_dir, PathBuf::from("/var/lib/starter/local-slave-2"));
        assert_eq!(peers[0].port, 8533);
        assert_eq!(peers[1].port, 8538);
    }

    #[test]
    fn failed_id_generation_skips_only_that_slave() {
        let mut calls = 0;
        let peers = allocate_with(&parent(), 4, || {
            calls += 1;
            if calls == 2 {
                Err(Error::Generation("no entropy".to_string()))
            } else {
                Ok(format!("id{}", calls))
            }
        });
        let ids: Vec<_> = peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["id1", "id3"]);
        assert_eq!(peers[1].data_dir, PathBuf::from("/var/lib/starter/local-slave-3"));
    }

    #[test]
    fn slave_ports_near_the_top_are_skipped() {
        assert_eq!(slave_port(65522, 2), Some(65532));
        assert_eq!(slave_port(65523, 2), None);
        assert_eq!(slave_port(8528, 70_000), None);

        let mut config = parent();
        config.port = 65524;
        let peers = allocate_local_slaves(&config, 3);
        let ports: Vec<u16> = peers.iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![65529]);
        assert_eq!(peers[0].data_dir, PathBuf::from("/var/lib/starter/local-slave-1"));

        config.port = 65530;
        assert!(allocate_local_slaves(&config, 3).is_empty());
    }

    #[test]
    fn master_address_defaults_to_loopback() {
        assert_eq!(master_address(&parent()), "127.0.0.1:8528");

        let mut config = parent();
        config.own_address = "db1.example.com".to_string();
        assert_eq!(master_address(&config), "db1.example.com:8528");
    }

    #[test]
    fn slave_config_never_starts_slaves() {
        let parent = parent();
        let peer = Peer::new("s1", "", 8533, PathBuf::from("/var/lib/starter/local-slave-1"));
        let config = slave_config(&parent, &peer, "127.0.0.1:8528");

        assert_eq!(config.id.as_deref(), Some("s1"));
        assert_eq!(config.data_dir, peer.data_dir);
        assert_eq!(config.port, 8533);
        assert_eq!(config.master_address.as_deref(), Some("127.0.0.1:8528"));
        assert!(!config.start_local_slaves);
        assert_eq!(config.agency_size, parent.agency_size);
    }
}
