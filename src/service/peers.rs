//! Peer Registry
//!
//! The ordered list of starters forming one cluster. Insertion order is join
//! order, so the first peer is the master.

use crate::client::ServerType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Distance between the starter ports of two peers sharing one host.
pub const PORT_OFFSET_INCREMENT: u16 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Peer {
    pub id: String,

    /// Host other peers use to reach this starter. Empty means loopback.
    #[serde(default)]
    pub address: String,

    pub port: u16,

    pub data_dir: PathBuf,

    #[serde(default)]
    pub has_agent: bool,

    #[serde(default)]
    pub is_secure: bool,
}

impl Peer {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            data_dir,
            has_agent: false,
            is_secure: false,
        }
    }

    pub fn with_agent(mut self, has_agent: bool) -> Self {
        self.has_agent = has_agent;
        self
    }

    pub fn with_secure(mut self, is_secure: bool) -> Self {
        self.is_secure = is_secure;
        self
    }

    /// Host part of the peer's address, falling back to loopback.
    pub fn host(&self) -> &str {
        if self.address.is_empty() {
            "127.0.0.1"
        } else {
            &self.address
        }
    }

    /// Port of the database server of the given role run by this peer.
    /// `None` when it would lie beyond the last TCP port.
    pub fn server_port(&self, server: ServerType) -> Option<u16> {
        self.port.checked_add(server.port_delta())
    }

    /// URL of this peer's control plane.
    pub fn starter_url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", join_host_port(self.host(), self.port), path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Peers {
    pub peers: Vec<Peer>,

    /// Target number of agents in the cluster.
    pub agency_size: usize,
}

impl Peers {
    pub fn new(agency_size: usize) -> Self {
        Self {
            peers: Vec::new(),
            agency_size,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Appends a peer. IDs and data directories must stay unique.
    pub fn add(&mut self, peer: Peer) -> Result<()> {
        if self.find(&peer.id).is_some() {
            return Err(Error::InvalidConfig {
                reason: format!("peer id '{}' is already registered", peer.id),
            });
        }
        if let Some(other) = self.peers.iter().find(|p| p.data_dir == peer.data_dir) {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "data directory {} is already owned by peer '{}'",
                    peer.data_dir.display(),
                    other.id
                ),
            });
        }
        self.peers.push(peer);
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn master(&self) -> Option<&Peer> {
        self.peers.first()
    }

    pub fn is_master(&self, id: &str) -> bool {
        self.master().is_some_and(|p| p.id == id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.has_agent)
    }

    pub fn agent_count(&self) -> usize {
        self.agents().count()
    }

    /// Cluster endpoints of all agents, in join order. Agents without a
    /// valid agent port are left out.
    pub fn agency_endpoints(&self) -> Vec<String> {
        self.agents()
            .filter_map(|p| {
                let port = p.server_port(ServerType::Agent)?;
                Some(format!("tcp://{}", join_host_port(p.host(), port)))
            })
            .collect()
    }
}

/// Joins host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, dir: &str) -> Peer {
        Peer::new(id, "", 8528, PathBuf::from(dir))
    }

    #[test]
    fn first_peer_is_master() {
        let mut peers = Peers::new(3);
        peers.add(peer("a", "/d/a").with_agent(true)).unwrap();
        peers.add(peer("b", "/d/b")).unwrap();

        assert!(peers.is_master("a"));
        assert!(!peers.is_master("b"));
        assert_eq!(peers.agent_count(), 1);
    }

    #[test]
    fn duplicate_id_or_data_dir_is_rejected() {
        let mut peers = Peers::new(1);
        peers.add(peer("a", "/d/a")).unwrap();

        assert!(peers.add(peer("a", "/d/other")).is_err());
        assert!(peers.add(peer("b", "/d/a")).is_err());
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn server_ports_follow_starter_port() {
        let p = Peer::new("x", "10.0.0.5", 8533, PathBuf::from("/d"));
        assert_eq!(p.server_port(ServerType::Coordinator), Some(8534));
        assert_eq!(p.server_port(ServerType::DbServer), Some(8535));
        assert_eq!(p.server_port(ServerType::Agent), Some(8536));
        assert_eq!(p.starter_url("/version"), "http://10.0.0.5:8533/version");
    }

    #[test]
    fn server_ports_stop_at_last_tcp_port() {
        let edge = Peer::new("x", "", 65532, PathBuf::from("/d"));
        assert_eq!(edge.server_port(ServerType::Agent), Some(65535));

        let top = Peer::new("y", "", 65535, PathBuf::from("/d"));
        assert_eq!(top.server_port(ServerType::Single), None);
        assert_eq!(top.server_port(ServerType::Agent), None);
    }

    #[test]
    fn agents_without_valid_port_have_no_endpoint() {
        let mut peers = Peers::new(2);
        peers.add(peer("a", "/d/a").with_agent(true)).unwrap();
        peers
            .add(Peer::new("b", "", 65534, PathBuf::from("/d/b")).with_agent(true))
            .unwrap();
        assert_eq!(peers.agency_endpoints(), vec!["tcp://127.0.0.1:8531"]);
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        assert_eq!(join_host_port("::1", 8528), "[::1]:8528");
        assert_eq!(join_host_port("127.0.0.1", 8528), "127.0.0.1:8528");
    }

    #[test]
    fn json_uses_kebab_case_keys() {
        let mut peers = Peers::new(3);
        peers.add(peer("a", "/d/a").with_agent(true)).unwrap();
        let json = serde_json::to_value(&peers).unwrap();

        assert_eq!(json["agency-size"], 3);
        assert_eq!(json["peers"][0]["data-dir"], "/d/a");
        assert_eq!(json["peers"][0]["has-agent"], true);
    }
}
