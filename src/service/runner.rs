//! Runner
//!
//! Boundary to the database server processes a starter supervises. The
//! starter only decides which servers to run and where; a [`Runner`] turns
//! that into running processes.

use super::{Peer, Peers};
use crate::client::{ServerProcess, ServerType};
use crate::{Error, Result};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

/// Everything needed to launch one database server.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub server_type: ServerType,

    pub ip: String,

    pub port: u16,

    pub data_dir: PathBuf,

    pub is_secure: bool,

    pub agency_size: usize,

    /// `tcp://host:port` of every agent, this one included.
    pub agency_endpoints: Vec<String>,
}

impl ServerSpec {
    /// Fails when the role's port lies beyond the last TCP port.
    pub fn for_peer(peer: &Peer, peers: &Peers, server_type: ServerType) -> Result<Self> {
        let port = peer
            .server_port(server_type)
            .ok_or_else(|| Error::InvalidConfig {
                reason: format!(
                    "{} port of peer '{}' exceeds {} (starter port {})",
                    server_type,
                    peer.id,
                    u16::MAX,
                    peer.port
                ),
            })?;
        Ok(Self {
            server_type,
            ip: peer.host().to_string(),
            port,
            data_dir: peer.data_dir.join(format!("{}{}", server_type, port)),
            is_secure: peer.is_secure,
            agency_size: peers.agency_size,
            agency_endpoints: peers.agency_endpoints(),
        })
    }

    pub fn process(&self) -> ServerProcess {
        ServerProcess {
            server_type: self.server_type,
            ip: self.ip.clone(),
            port: self.port,
            is_secure: self.is_secure,
        }
    }

    fn endpoint(&self) -> String {
        let scheme = if self.is_secure { "ssl" } else { "tcp" };
        format!(
            "{}://{}",
            scheme,
            super::join_host_port(&self.ip, self.port)
        )
    }

    /// Command line options for the server binary.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--server.endpoint".to_string(),
            self.endpoint(),
            "--database.directory".to_string(),
            self.data_dir.join("data").display().to_string(),
        ];
        match self.server_type {
            ServerType::Single => {}
            ServerType::Agent => {
                args.extend([
                    "--agency.activate".to_string(),
                    "true".to_string(),
                    "--agency.size".to_string(),
                    self.agency_size.to_string(),
                    "--agency.my-address".to_string(),
                    self.endpoint(),
                ]);
                for endpoint in self.agency_endpoints.iter().filter(|e| **e != self.endpoint()) {
                    args.push("--agency.endpoint".to_string());
                    args.push(endpoint.clone());
                }
            }
            ServerType::Coordinator | ServerType::DbServer => {
                let role = if self.server_type == ServerType::Coordinator {
                    "COORDINATOR"
                } else {
                    "PRIMARY"
                };
                args.extend([
                    "--cluster.my-role".to_string(),
                    role.to_string(),
                    "--cluster.my-address".to_string(),
                    self.endpoint(),
                ]);
                for endpoint in &self.agency_endpoints {
                    args.push("--cluster.agency-endpoint".to_string());
                    args.push(endpoint.clone());
                }
            }
        }
        args
    }
}

/// Starts database servers.
pub trait Runner: Send + Sync {
    fn start(&self, spec: &ServerSpec) -> Result<Box<dyn ServerHandle>>;
}

/// A started database server.
pub trait ServerHandle: Send {
    fn process(&self) -> &ServerProcess;

    /// Asks the server to stop.
    fn terminate(&mut self) -> Result<()>;

    fn kill(&mut self) -> Result<()>;

    fn has_exited(&mut self) -> Result<bool>;
}

/// Runs each server as a child process of the given executable.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    executable: PathBuf,

    extra_args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(executable: impl Into<PathBuf>, extra_args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            extra_args,
        }
    }
}

impl Runner for ProcessRunner {
    fn start(&self, spec: &ServerSpec) -> Result<Box<dyn ServerHandle>> {
        std::fs::create_dir_all(spec.data_dir.join("data"))?;

        let child = Command::new(&self.executable)
            .args(spec.args())
            .args(&self.extra_args)
            .current_dir(&spec.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                Error::other(format!(
                    "Failed to start {} ({}): {}",
                    spec.server_type,
                    self.executable.display(),
                    err
                ))
            })?;

        Ok(Box::new(ChildServer {
            process: spec.process(),
            child,
        }))
    }
}

struct ChildServer {
    process: ServerProcess,
    child: Child,
}

impl ServerHandle for ChildServer {
    fn process(&self) -> &ServerProcess {
        &self.process
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(self.child.id() as i32);
        kill(pid, Signal::SIGTERM)
            .map_err(|err| Error::other(format!("SIGTERM to {} failed: {}", pid, err)))
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn has_exited(&mut self) -> Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }
}
