//! Starter Client
//!
//! HTTP client for the control plane of a running starter. Used by operators,
//! by joining peers and by the lifecycle waiters.

use crate::service::Peers;
use crate::version::VersionInfo;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Agent,
    Coordinator,
    #[serde(rename = "dbserver")]
    DbServer,
    Single,
}

impl ServerType {
    /// Largest [`ServerType::port_delta`] of any role.
    pub const MAX_PORT_DELTA: u16 = 3;

    /// Offset of this server's port from its starter's port.
    pub fn port_delta(self) -> u16 {
        match self {
            ServerType::Coordinator | ServerType::Single => 1,
            ServerType::DbServer => 2,
            ServerType::Agent => 3,
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerType::Agent => write!(f, "agent"),
            ServerType::Coordinator => write!(f, "coordinator"),
            ServerType::DbServer => write!(f, "dbserver"),
            ServerType::Single => write!(f, "single"),
        }
    }
}

/// A database server started by a starter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerProcess {
    #[serde(rename = "type")]
    pub server_type: ServerType,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub is_secure: bool,
}

impl ServerProcess {
    pub fn endpoint(&self) -> String {
        let scheme = if self.is_secure { "https" } else { "http" };
        format!(
            "{}://{}",
            scheme,
            crate::service::join_host_port(&self.ip, self.port)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessList {
    #[serde(default)]
    pub servers: Vec<ServerProcess>,
}

impl ProcessList {
    pub fn server_by_type(&self, server_type: ServerType) -> Option<&ServerProcess> {
        self.servers.iter().find(|s| s.server_type == server_type)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,

    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: format!("starter/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StarterClient {
    endpoint: String,
    http: reqwest::Client,
}

impl StarterClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::with_config(endpoint, ClientConfig::default())
    }

    pub fn with_config(endpoint: &str, config: ClientConfig) -> Result<Self> {
        let parsed = reqwest::Url::parse(endpoint).map_err(|err| Error::InvalidConfig {
            reason: format!("invalid starter endpoint '{}': {}", endpoint, err),
        })?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| Error::other(format!("Failed to create HTTP client: {}", err)))?;
        Ok(Self {
            endpoint: parsed.as_str().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    pub async fn version(&self) -> Result<VersionInfo> {
        let response = self.http.get(self.url("version")).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn processes(&self) -> Result<ProcessList> {
        let response = self.http.get(self.url("process")).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }

    /// Asks the starter to shut down. Returns once the request is accepted,
    /// not when the starter is gone.
    pub async fn shutdown(&self, force: bool) -> Result<()> {
        let mut request = self.http.post(self.url("shutdown"));
        if force {
            request = request.query(&[("force", "true")]);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }

    /// Fetches the committed peer list from a master.
    pub async fn hello(&self) -> Result<Peers> {
        let response = self.http.get(self.url("hello")).send().await?;
        Ok(response.error_for_status()?.json().await?)
    }
}
