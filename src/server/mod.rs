//! Control Plane
//!
//! HTTP API of a running starter.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/version` | Starter version and build |
//! | `GET` | `/process` | Database servers run by this starter |
//! | `POST` | `/shutdown` | Begin graceful shutdown (`?force=true` kills servers) |
//! | `GET` | `/hello` | Committed peer list, used by joining peers |

use crate::client::ProcessList;
use crate::service::{Peers, ServiceState};
use crate::version;
use crate::{Error, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What the control plane needs from a starter.
pub trait ControlSurface: Send + Sync {
    fn processes(&self) -> ProcessList;

    /// The committed peer list, if there is one yet.
    fn peers(&self) -> Option<Arc<Peers>>;

    /// Starts shutting down. Returns `false` if already shutting down.
    fn shutdown(&self, force: bool) -> bool;

    fn state(&self) -> ServiceState;
}

type AppState = Arc<dyn ControlSurface>;

#[derive(Debug, Default, Deserialize)]
struct ShutdownQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: msg.into() })).into_response()
}

pub fn router(surface: AppState) -> Router {
    Router::new()
        .route("/version", get(get_version))
        .route("/process", get(get_processes))
        .route("/shutdown", post(post_shutdown))
        .route("/hello", get(get_hello))
        .with_state(surface)
}

/// Binds the control-plane listener. Failing here is fatal for the starter.
pub async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address).await.map_err(|err| Error::Bind {
        address: address.to_string(),
        reason: err.to_string(),
    })
}

/// Serves the API until `cancel` fires, then finishes in-flight requests.
pub async fn serve(
    listener: TcpListener,
    surface: AppState,
    cancel: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Control plane listening on {}", addr);
    }
    axum::serve(listener, router(surface))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    debug!("Control plane stopped");
    Ok(())
}

async fn get_version() -> Json<version::VersionInfo> {
    Json(version::info())
}

async fn get_processes(State(surface): State<AppState>) -> Json<ProcessList> {
    Json(surface.processes())
}

async fn post_shutdown(
    State(surface): State<AppState>,
    Query(query): Query<ShutdownQuery>,
) -> impl IntoResponse {
    if !surface.shutdown(query.force) {
        debug!("Ignoring repeated shutdown request");
    }
    (StatusCode::OK, "OK")
}

async fn get_hello(State(surface): State<AppState>) -> Response {
    match surface.peers() {
        Some(peers) => Json(peers.as_ref().clone()).into_response(),
        None => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("peer list not committed yet (state: {})", surface.state()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ServerProcess, ServerType, StarterClient};
    use crate::service::Peer;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeSurface {
        peers: Mutex<Option<Arc<Peers>>>,
        shutdowns: AtomicUsize,
    }

    impl ControlSurface for FakeSurface {
        fn processes(&self) -> ProcessList {
            ProcessList {
                servers: vec![ServerProcess {
                    server_type: ServerType::Single,
                    ip: "127.0.0.1".to_string(),
                    port: 8529,
                    is_secure: false,
                }],
            }
        }

        fn peers(&self) -> Option<Arc<Peers>> {
            self.peers.lock().unwrap().clone()
        }

        fn shutdown(&self, _force: bool) -> bool {
            self.shutdowns.fetch_add(1, Ordering::SeqCst) == 0
        }

        fn state(&self) -> ServiceState {
            ServiceState::Negotiating
        }
    }

    async fn spawn_server(surface: Arc<FakeSurface>) -> (StarterClient, CancellationToken) {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, surface, cancel.clone()));
        let client = StarterClient::new(&format!("http://{}", addr)).unwrap();
        (client, cancel)
    }

    #[tokio::test]
    async fn version_and_processes() {
        let (client, cancel) = spawn_server(Arc::new(FakeSurface::default())).await;

        let info = client.version().await.unwrap();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));

        let processes = client.processes().await.unwrap();
        assert!(processes.server_by_type(ServerType::Single).is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn repeated_shutdown_succeeds() {
        let surface = Arc::new(FakeSurface::default());
        let (client, cancel) = spawn_server(Arc::clone(&surface)).await;

        client.shutdown(false).await.unwrap();
        client.shutdown(true).await.unwrap();
        assert_eq!(surface.shutdowns.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn hello_before_and_after_commit() {
        let surface = Arc::new(FakeSurface::default());
        let (client, cancel) = spawn_server(Arc::clone(&surface)).await;

        assert!(client.hello().await.is_err());

        let mut peers = Peers::new(1);
        peers.add(Peer::new("m", "", 8528, PathBuf::from("/m"))).unwrap();
        *surface.peers.lock().unwrap() = Some(Arc::new(peers.clone()));

        assert_eq!(client.hello().await.unwrap(), peers);
        cancel.cancel();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();
        let err = bind(&addr).await.unwrap_err();
        assert_eq!(err.kind(), "bind");
        assert!(!err.is_recoverable());
    }
}
