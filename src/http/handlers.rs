//! HTTP request handlers for long-polling.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::Extensions,
    routing::post,
    Json, Router,
};
use tracing::{debug, warn};

use crate::hub::{Hub, OpenRequest};
use crate::session::{CloseEvent, CloseState};

pub const LPIO_PATH: &str = "/lpio";

/// Create the Axum router for HTTP long-polling.
pub fn router(hub: Hub) -> Router {
    Router::new()
        .route(LPIO_PATH, post(handle_open))
        .with_state(hub)
}

/// Closes the session with `CLIENT_ABORT` if the request future is
/// dropped before the session resolved
struct AbortGuard {
    hub: Hub,
    client: Option<String>,
    session_id: u64,
    armed: bool,
}

impl AbortGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(client) = &self.client else {
            return;
        };
        if self
            .hub
            .close_session(client, self.session_id, CloseState::ClientAbort)
        {
            debug!(client = %client, session = self.session_id, "peer aborted request");
        }
    }
}

/// Handle one long-poll request.
async fn handle_open(
    State(hub): State<Hub>,
    extensions: Extensions,
    Json(mut request): Json<OpenRequest>,
) -> Json<CloseEvent> {
    request.peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let output = hub.open(request);
    let mut guard = AbortGuard {
        hub: hub.clone(),
        client: output.client().map(str::to_owned),
        session_id: output.session_id(),
        armed: true,
    };

    let outcome = output.await;
    guard.disarm();

    if let Some(err) = &outcome.error {
        warn!(error = %err, kind = err.error_name(), "long-poll ended with an error");
    }
    Json(outcome.close)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn dropped_request_aborts_its_session() {
        let hub = Hub::new(HubConfig::default());
        let output = hub.open(OpenRequest {
            client: Some("A".into()),
            channels: vec!["c".into()],
            ..OpenRequest::default()
        });
        let guard = AbortGuard {
            hub: hub.clone(),
            client: output.client().map(str::to_owned),
            session_id: output.session_id(),
            armed: true,
        };
        drop(guard);

        assert_eq!(output.await.state(), CloseState::ClientAbort);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_guard_leaves_replacement_alone() {
        let hub = Hub::new(HubConfig::default().with_response_timeout(Duration::from_millis(50)));
        let request = OpenRequest {
            client: Some("A".into()),
            channels: vec!["c".into()],
            ..OpenRequest::default()
        };
        let first = hub.open(request.clone());
        let stale = AbortGuard {
            hub: hub.clone(),
            client: first.client().map(str::to_owned),
            session_id: first.session_id(),
            armed: true,
        };
        let second = hub.open(request);
        drop(stale);

        assert_eq!(first.await.state(), CloseState::Reconnect);
        assert_eq!(second.await.state(), CloseState::Reconnect);
    }
}
