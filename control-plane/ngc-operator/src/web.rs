use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{Router, extract::State, http::StatusCode, routing::get};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Ready once the registry has a cluster and, when leader election is on,
/// the lease is held.
#[derive(Debug)]
pub struct Readiness {
    has_clusters: AtomicBool,
    leading: AtomicBool,
}

impl Readiness {
    pub fn new(leader_elect: bool) -> Self {
        Self {
            has_clusters: AtomicBool::new(false),
            leading: AtomicBool::new(!leader_elect),
        }
    }

    pub fn set_has_clusters(&self, v: bool) {
        self.has_clusters.store(v, Ordering::SeqCst);
    }

    pub fn set_leading(&self, v: bool) {
        self.leading.store(v, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.has_clusters.load(Ordering::SeqCst) && self.leading.load(Ordering::SeqCst)
    }
}

async fn readyz(State(r): State<Arc<Readiness>>) -> (StatusCode, &'static str) {
    if r.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

pub fn probe_router(readiness: Arc<Readiness>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(readiness)
}

pub async fn serve(name: &'static str, addr: SocketAddr, app: Router, token: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("{name} listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}
