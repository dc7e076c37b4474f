use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregator;
use crate::metric::parse_payload;

/// Shared state for the ingestion HTTP server.
pub struct IngestState {
    pub aggregator: Arc<Aggregator>,
    /// Submitter credentials, user -> password. Empty disables auth.
    pub users: HashMap<String, String>,
}

/// Builds the ingestion router.
///
/// `POST /` accepts a collector payload (a JSON sample or array of samples)
/// behind HTTP Basic auth; `GET /healthz` is unauthenticated.
pub fn router(state: Arc<IngestState>) -> Router {
    Router::new()
        .route("/", get(hello_handler).post(submit_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// Serves the ingestion API until the token is cancelled.
///
/// A listen address starting with ':' binds all interfaces on that port.
pub async fn serve(
    listen: &str,
    state: Arc<IngestState>,
    cancel: CancellationToken,
) -> Result<()> {
    let bind_addr = if let Some(port) = listen.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        listen.to_string()
    };

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding ingest listener on {bind_addr}"))?;

    info!(
        addr = %listener.local_addr().context("resolving listen address")?,
        "ingest server listening",
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("serving ingest API")
}

async fn submit_handler(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    let Some(user) = authorize(&state.users, &headers) else {
        return (StatusCode::UNAUTHORIZED, "unauthorized\n".to_string());
    };

    match parse_payload(&body) {
        Ok(samples) => {
            debug!(count = samples.len(), %user, "accepted sample payload");
            state.aggregator.push_all(samples);
            (StatusCode::OK, "ok\n".to_string())
        }
        Err(e) => {
            warn!(%user, error = %e, "rejected sample payload");
            (StatusCode::BAD_REQUEST, "invalid request\n".to_string())
        }
    }
}

async fn hello_handler(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
) -> (StatusCode, String) {
    match authorize(&state.users, &headers) {
        Some(user) => (StatusCode::OK, format!("Hello, {user}\n")),
        None => (StatusCode::UNAUTHORIZED, "unauthorized\n".to_string()),
    }
}

async fn healthz_handler() -> &'static str {
    "ok\n"
}

/// Checks HTTP Basic credentials against the configured users.
///
/// Returns the authenticated user name, "anonymous" when no users are
/// configured, or `None` on missing or bad credentials.
fn authorize(users: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if users.is_empty() {
        return Some("anonymous".to_string());
    }

    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (user, password) = credentials.split_once(':')?;

    if users.get(user).map(String::as_str) == Some(password) {
        Some(user.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(users: &[(&str, &str)]) -> Arc<IngestState> {
        let mut rollups = HashMap::new();
        rollups.insert("gauge".to_string(), vec!["avg".to_string()]);

        Arc::new(IngestState {
            aggregator: Arc::new(Aggregator::new(rollups)),
            users: users
                .iter()
                .map(|(u, p)| (u.to_string(), p.to_string()))
                .collect(),
        })
    }

    fn basic_auth(user: &str, password: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{user}:{password}")))
    }

    const PAYLOAD: &str = r#"[{"host": "node-a", "plugin": "load", "type": "load",
        "dsnames": ["value"], "dstypes": ["gauge"], "values": [0.5]}]"#;

    #[tokio::test]
    async fn test_submit_requires_auth() {
        let app = router(test_state(&[("collector", "hunter2")]));

        let res = app
            .oneshot(
                Request::post("/")
                    .body(Body::from(PAYLOAD))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_password() {
        let app = router(test_state(&[("collector", "hunter2")]));

        let res = app
            .oneshot(
                Request::post("/")
                    .header(header::AUTHORIZATION, basic_auth("collector", "wrong"))
                    .body(Body::from(PAYLOAD))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_submit_buffers_samples() {
        let state = test_state(&[("collector", "hunter2")]);
        let app = router(Arc::clone(&state));

        let res = app
            .oneshot(
                Request::post("/")
                    .header(header::AUTHORIZATION, basic_auth("collector", "hunter2"))
                    .body(Body::from(PAYLOAD))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(res.status(), StatusCode::OK);
        let buffered = state
            .aggregator
            .buffered_samples("node-a")
            .expect("sample buffered");
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].plugin, "load");
    }

    #[tokio::test]
    async fn test_submit_rejects_malformed_payload() {
        let app = router(test_state(&[]));

        let res = app
            .oneshot(
                Request::post("/")
                    .body(Body::from("{not json"))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_empty_users_disables_auth() {
        let state = test_state(&[]);
        let app = router(Arc::clone(&state));

        let res = app
            .oneshot(
                Request::post("/")
                    .body(Body::from(PAYLOAD))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(res.status(), StatusCode::OK);
        assert!(state.aggregator.buffered_samples("node-a").is_some());
    }

    #[tokio::test]
    async fn test_healthz_is_unauthenticated() {
        let app = router(test_state(&[("collector", "hunter2")]));

        let res = app
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_hello_greets_authenticated_user() {
        let app = router(test_state(&[("collector", "hunter2")]));

        let res = app
            .oneshot(
                Request::get("/")
                    .header(header::AUTHORIZATION, basic_auth("collector", "hunter2"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(res.status(), StatusCode::OK);
    }
}
