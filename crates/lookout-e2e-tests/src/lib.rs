//! End-to-end scenarios for lookout.
#![forbid(unsafe_code)]
//!
//! The scenarios under `tests/` exercise the crates together:
//! - scraping into the store, including failing targets
//! - rule evaluation and the Pending to Firing hold
//! - routing and delivery to a real webhook endpoint with retries
//! - configuration reload through the HTTP API
//!
//! This library holds the fixtures they share.

#![warn(missing_docs)]

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use lookout_scrape::{Fetcher, ScrapeError, Target};
use parking_lot::Mutex;
use tokio::net::TcpListener;

/// One scripted fetch outcome.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Answer with this exposition body.
    Body(String),
    /// Never answer; the scrape runs into its timeout.
    Hang,
    /// Fail with a connection error.
    Fail,
}

/// A [`Fetcher`] that replays a script, then repeats its last step.
#[derive(Debug)]
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Scripted>>,
    last: Mutex<Scripted>,
    calls: Mutex<usize>,
}

impl ScriptedFetcher {
    /// Creates a fetcher replaying `script`.
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Scripted::Fail),
            calls: Mutex::new(0),
        }
    }

    /// Always answers with `body`.
    pub fn serving(body: &str) -> Self {
        Self::new(vec![Scripted::Body(body.to_string())])
    }

    /// Number of fetches made so far.
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch<'a>(
        &'a self,
        target: &'a Target,
    ) -> Pin<Box<dyn Future<Output = lookout_scrape::Result<String>> + Send + 'a>> {
        *self.calls.lock() += 1;
        let step = match self.script.lock().pop_front() {
            Some(step) => {
                *self.last.lock() = step.clone();
                step
            }
            None => self.last.lock().clone(),
        };
        Box::pin(async move {
            match step {
                Scripted::Body(body) => Ok(body),
                Scripted::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
                Scripted::Fail => Err(ScrapeError::Request {
                    target: target.url(),
                    reason: "connection refused".to_string(),
                }),
            }
        })
    }
}

#[derive(Debug, Default)]
struct SinkState {
    fail_first: usize,
    attempts: usize,
    accepted: Vec<serde_json::Value>,
}

/// An HTTP endpoint that records webhook payloads.
///
/// The first `fail_first` requests are answered with 500.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    addr: SocketAddr,
    state: Arc<Mutex<SinkState>>,
}

impl WebhookSink {
    /// Starts the sink on a free local port.
    ///
    /// # Errors
    ///
    /// Returns an error if no local port can be bound.
    pub async fn start(fail_first: usize) -> std::io::Result<Self> {
        let state = Arc::new(Mutex::new(SinkState {
            fail_first,
            ..SinkState::default()
        }));
        let app = Router::new()
            .route("/hook", post(receive))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self { addr, state })
    }

    /// URL to configure as the webhook target.
    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    /// Requests received, failed ones included.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// Payloads that were answered with 200.
    pub fn accepted(&self) -> Vec<serde_json::Value> {
        self.state.lock().accepted.clone()
    }
}

async fn receive(
    State(state): State<Arc<Mutex<SinkState>>>,
    Json(payload): Json<serde_json::Value>,
) -> StatusCode {
    let mut state = state.lock();
    state.attempts += 1;
    if state.attempts <= state.fail_first {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    state.accepted.push(payload);
    StatusCode::OK
}
