//! Setup Persistence
//!
//! A starter records its identity and the committed peer list in
//! `<data-dir>/setup.json`. On the next start that record decides between
//! relaunching into the previous role assignment and a fresh negotiation.

use super::Peers;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Version of the setup record layout. Bump it whenever the structure or
/// meaning of [`SetupConfigFile`] changes; older records are then ignored.
pub const SETUP_CONFIG_VERSION: &str = "0.2.1";

pub const SETUP_FILE_NAME: &str = "setup.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SetupConfigFile {
    pub version: String,

    pub id: String,

    pub peers: Peers,

    #[serde(default, skip_serializing_if = "is_false")]
    pub start_local_slaves: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Deserialize)]
struct VersionTag {
    version: String,
}

/// A setup file as found on disk, classified by its version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupRecord {
    Current(SetupConfigFile),
    Unknown { version: String },
}

/// State restored from a matching setup record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relaunch {
    pub id: String,
    pub peers: Peers,
    pub start_local_slaves: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreshStartReason {
    Missing,
    Unreadable(String),
    Corrupt(String),
    Outdated { found: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelaunchOutcome {
    Relaunched(Relaunch),
    FreshStart(FreshStartReason),
}

impl RelaunchOutcome {
    pub fn is_relaunch(&self) -> bool {
        matches!(self, RelaunchOutcome::Relaunched(_))
    }
}

#[derive(Debug, Clone)]
pub struct SetupStore {
    path: PathBuf,
    expected_version: String,
}

impl SetupStore {
    pub fn new(data_dir: &Path) -> Self {
        Self::with_version(data_dir, SETUP_CONFIG_VERSION)
    }

    pub fn with_version(data_dir: &Path, version: &str) -> Self {
        Self {
            path: data_dir.join(SETUP_FILE_NAME),
            expected_version: version.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the setup record, replacing any previous one.
    ///
    /// The record goes to a temporary file in the same directory first and
    /// is renamed over the old one, so readers see either record whole.
    pub fn save(&self, peers: &Peers, id: &str, start_local_slaves: bool) -> Result<()> {
        let record = SetupConfigFile {
            version: self.expected_version.clone(),
            id: id.to_string(),
            peers: peers.clone(),
            start_local_slaves,
        };
        let content = serde_json::to_vec_pretty(&record)?;

        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).map_err(|err| self.persist_error(err))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".setup")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|err| self.persist_error(err))?;
        tmp.write_all(&content)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|err| self.persist_error(err))?;
        tmp.persist(&self.path)
            .map_err(|err| self.persist_error(err.error))?;

        debug!(path = %self.path.display(), peers = peers.len(), "Saved setup");
        Ok(())
    }

    fn persist_error(&self, err: impl std::fmt::Display) -> Error {
        Error::Persist {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }

    /// Reads and classifies the record. `Ok(None)` when there is no file.
    pub fn load(&self) -> Result<Option<SetupRecord>> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.persist_error(err)),
        };

        let tag: VersionTag = serde_json::from_slice(&content)?;
        semver::Version::parse(&tag.version).map_err(|err| {
            Error::Serialization(format!("invalid setup version '{}': {}", tag.version, err))
        })?;
        if tag.version != self.expected_version {
            return Ok(Some(SetupRecord::Unknown {
                version: tag.version,
            }));
        }

        let record: SetupConfigFile = serde_json::from_slice(&content)?;
        Ok(Some(SetupRecord::Current(record)))
    }

    /// Decides whether this start resumes a previous setup.
    ///
    /// Never fails: anything short of a readable record with the expected
    /// version means a fresh start. Nothing is written here.
    pub fn try_relaunch(&self) -> RelaunchOutcome {
        match self.load() {
            Ok(Some(SetupRecord::Current(record))) => {
                info!(
                    id = %record.id,
                    peers = record.peers.len(),
                    "Found setup from previous run"
                );
                RelaunchOutcome::Relaunched(Relaunch {
                    id: record.id,
                    peers: record.peers,
                    start_local_slaves: record.start_local_slaves,
                })
            }
            Ok(Some(SetupRecord::Unknown { version })) => {
                let mismatch = Error::VersionMismatch {
                    expected: self.expected_version.clone(),
                    found: version.clone(),
                };
                warn!("{} is outdated ({}). Starting fresh...", SETUP_FILE_NAME, mismatch);
                RelaunchOutcome::FreshStart(FreshStartReason::Outdated { found: version })
            }
            Ok(None) => RelaunchOutcome::FreshStart(FreshStartReason::Missing),
            Err(Error::Persist { reason, .. }) => {
                warn!("Cannot read existing {}: {}", SETUP_FILE_NAME, reason);
                RelaunchOutcome::FreshStart(FreshStartReason::Unreadable(reason))
            }
            Err(err) => {
                warn!("Failed to parse existing {}: {}", SETUP_FILE_NAME, err);
                RelaunchOutcome::FreshStart(FreshStartReason::Corrupt(err.to_string()))
            }
        }
    }
}
