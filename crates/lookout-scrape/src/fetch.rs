//! Fetching exposition bodies from targets.

use std::future::Future;
use std::pin::Pin;

use reqwest::header::ACCEPT;
use tracing::trace;

use crate::error::{Result, ScrapeError};
use crate::target::Target;

/// Retrieves the raw exposition body of a target.
///
/// Implementations must not retry; the scrape loop reports one failure per
/// cycle and tries again on the next tick.
pub trait Fetcher: Send + Sync {
    /// Fetch the target's metrics body.
    ///
    /// # Errors
    ///
    /// Returns a `ScrapeError` on transport failures or non-2xx responses.
    fn fetch<'a>(
        &'a self,
        target: &'a Target,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

/// Fetches over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a fetcher with a fresh connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lookout/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScrapeError::Request {
                target: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    /// Creates a fetcher around an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        target: &'a Target,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let url = target.url();
            trace!(url = %url, "fetching target");

            let response = self
                .client
                .get(&url)
                .header(ACCEPT, "text/plain;version=0.0.4")
                .timeout(target.timeout)
                .send()
                .await
                .map_err(|e| transport_error(&url, target, &e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ScrapeError::Status {
                    target: url,
                    status: status.as_u16(),
                });
            }

            response
                .text()
                .await
                .map_err(|e| transport_error(&url, target, &e))
        })
    }
}

fn transport_error(url: &str, target: &Target, err: &reqwest::Error) -> ScrapeError {
    if err.is_timeout() {
        ScrapeError::Timeout {
            target: url.to_string(),
            timeout_ms: target.timeout.as_millis(),
        }
    } else {
        ScrapeError::Request {
            target: url.to_string(),
            reason: err.to_string(),
        }
    }
}
