//! Mock token endpoint for tests

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Form, Json, Router};
use common::Secret;
use tokio::net::TcpListener;

use crate::token::ClientCredentials;

pub const CLIENT_ID: &str = "C";
pub const CLIENT_SECRET: &str = "S";

pub fn credentials(token_url: &str) -> ClientCredentials {
    ClientCredentials {
        token_url: token_url.to_string(),
        client_id: CLIENT_ID.into(),
        client_secret: Secret::new(CLIENT_SECRET.into()),
    }
}

/// Token endpoint granting `T<n>` (n = request count) for `C`/`S`.
pub struct MockTokenEndpoint {
    pub url: String,
    hits: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    malformed: Arc<AtomicBool>,
}

impl MockTokenEndpoint {
    pub async fn start(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(false));
        let malformed = Arc::new(AtomicBool::new(false));

        let (h, f, m) = (hits.clone(), fail.clone(), malformed.clone());
        let app = Router::new().route(
            "/oauth/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let (h, f, m) = (h.clone(), f.clone(), m.clone());
                async move {
                    let n = h.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(delay).await;

                    let granted = form.get("grant_type").map(String::as_str)
                        == Some("client_credentials")
                        && form.get("client_id").map(String::as_str) == Some(CLIENT_ID)
                        && form.get("client_secret").map(String::as_str) == Some(CLIENT_SECRET);
                    if f.load(Ordering::SeqCst) || !granted {
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(serde_json::json!({"error": "invalid_grant"})),
                        )
                            .into_response();
                    }
                    if m.load(Ordering::SeqCst) {
                        return (StatusCode::OK, "not json").into_response();
                    }
                    Json(serde_json::json!({
                        "access_token": format!("T{n}"),
                        "expires_in": 3600,
                        "token_type": "Bearer",
                    }))
                    .into_response()
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/oauth/token"),
            hits,
            fail,
            malformed,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn respond_malformed(&self) {
        self.malformed.store(true, Ordering::SeqCst);
    }
}
