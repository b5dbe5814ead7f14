//! In-process subscription endpoint for tests

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

struct Script {
    statuses: Vec<u16>,
    body: String,
    hits: AtomicUsize,
}

/// Serves `/sub`, answering the n-th request with the n-th scripted status
/// (the last status repeats once the script runs out)
pub(crate) struct MockSubscription {
    addr: std::net::SocketAddr,
    script: Arc<Script>,
}

impl MockSubscription {
    pub(crate) async fn start(statuses: Vec<u16>, body: &str) -> Self {
        let script = Arc::new(Script {
            statuses,
            body: body.to_string(),
            hits: AtomicUsize::new(0),
        });

        let router = Router::new()
            .route("/sub", get(serve))
            .with_state(script.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        MockSubscription { addr, script }
    }

    /// URL of a port nothing listens on
    pub(crate) async fn unreachable_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/sub", addr)
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}/sub", self.addr)
    }

    pub(crate) fn hits(&self) -> usize {
        self.script.hits.load(Ordering::SeqCst)
    }
}

async fn serve(State(script): State<Arc<Script>>) -> (StatusCode, String) {
    let n = script.hits.fetch_add(1, Ordering::SeqCst);
    let code = script
        .statuses
        .get(n)
        .or_else(|| script.statuses.last())
        .copied()
        .unwrap_or(200);
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        script.body.clone(),
    )
}
