//! Process Lifecycle Waiters
//!
//! Helpers for whoever drives a starter from the outside: wait for its
//! readiness line, stop it and wait until it is really gone.

use crate::client::StarterClient;
use crate::version::VersionInfo;
use crate::{Error, Result};
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error};

pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

pub const GONE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Consecutive failed version queries after which a starter counts as gone.
pub const GONE_FAILURE_THRESHOLD: u32 = 3;

pub const TERMINATION_TIMEOUT: Duration = Duration::from_secs(30);

/// What a starter announces once it is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum What {
    Cluster,
    SingleServer,
}

impl What {
    pub fn label(self) -> &'static str {
        match self {
            What::Cluster => "cluster",
            What::SingleServer => "single server",
        }
    }
}

pub fn ready_pattern(what: What) -> Result<Regex> {
    let pattern = format!(
        "Your {} can now be accessed with a browser at",
        regex::escape(what.label())
    );
    Regex::new(&pattern).map_err(|err| Error::other(format!("invalid readiness pattern: {}", err)))
}

/// Reads `output` line by line until the readiness line for `what` shows
/// up. Gives up after `timeout` or at end of output and returns `false`.
pub async fn wait_until_ready<R>(output: R, what: What, timeout: Duration) -> bool
where
    R: AsyncBufRead + Unpin,
{
    let pattern = match ready_pattern(what) {
        Ok(pattern) => pattern,
        Err(err) => {
            error!("{}", err);
            return false;
        }
    };
    let scan = async {
        let mut lines = output.lines();
        while let Some(line) = lines.next_line().await? {
            if pattern.is_match(&line) {
                return Ok(true);
            }
        }
        Ok::<_, std::io::Error>(false)
    };
    match tokio::time::timeout(timeout, scan).await {
        Ok(Ok(true)) => true,
        Ok(Ok(false)) => {
            error!("Starter output ended before the {} was ready", what.label());
            false
        }
        Ok(Err(err)) => {
            error!("Failed to read starter output: {}", err);
            false
        }
        Err(_) => {
            error!("Starter is not ready in time ({:?})", timeout);
            false
        }
    }
}

/// Waits for several starters at once. True only if all became ready.
pub async fn wait_until_all_ready<R>(outputs: Vec<R>, what: What, timeout: Duration) -> bool
where
    R: AsyncBufRead + Unpin,
{
    let waits = outputs
        .into_iter()
        .map(|output| wait_until_ready(output, what, timeout));
    futures::future::join_all(waits)
        .await
        .into_iter()
        .all(|ready| ready)
}

/// Something answering version queries, normally a [`StarterClient`].
pub trait VersionProbe {
    fn probe(&self) -> impl Future<Output = Result<VersionInfo>> + Send;
}

impl VersionProbe for StarterClient {
    fn probe(&self) -> impl Future<Output = Result<VersionInfo>> + Send {
        self.version()
    }
}

/// Debounces version query results into a "gone" verdict.
#[derive(Debug, Clone)]
pub struct GoneDetector {
    failures: u32,
    threshold: u32,
}

impl Default for GoneDetector {
    fn default() -> Self {
        Self::new(GONE_FAILURE_THRESHOLD)
    }
}

impl GoneDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: 0,
            threshold,
        }
    }

    /// Records one query result. Returns true once the target counts as gone.
    pub fn record(&mut self, answered: bool) -> bool {
        if answered {
            self.failures = 0;
        } else {
            self.failures += 1;
        }
        self.failures >= self.threshold
    }
}

/// Polls `probe` every `interval` until it fails
/// [`GONE_FAILURE_THRESHOLD`] times in a row. Never times out by itself.
pub async fn wait_until_gone<P: VersionProbe>(probe: &P, interval: Duration) {
    let mut detector = GoneDetector::default();
    loop {
        let answered = match probe.probe().await {
            Ok(_) => true,
            Err(err) => {
                debug!("Version query failed: {}", err);
                false
            }
        };
        if detector.record(answered) {
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Requests a shutdown through the API and waits until the starter is gone.
pub async fn shutdown_and_wait(
    client: &StarterClient,
    force: bool,
    timeout: Duration,
) -> Result<()> {
    client.shutdown(force).await?;
    tokio::time::timeout(timeout, wait_until_gone(client, GONE_POLL_INTERVAL))
        .await
        .map_err(|_| {
            Error::other(format!(
                "{} still answers after {:?}",
                client.endpoint(),
                timeout
            ))
        })
}

/// Sends an interrupt to `child` and waits up to `timeout` for it to exit.
#[cfg(unix)]
pub async fn send_intr_and_wait(
    child: &mut tokio::process::Child,
    timeout: Duration,
) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    #[allow(clippy::cast_possible_wrap)]
    kill(Pid::from_raw(pid as i32), Signal::SIGINT)
        .map_err(|err| Error::other(format!("SIGINT to {} failed: {}", pid, err)))?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status?;
            debug!(pid, %status, "Process terminated");
            Ok(())
        }
        Err(_) => Err(Error::other(format!(
            "process {} is not stopped in time ({:?})",
            pid, timeout
        ))),
    }
}
