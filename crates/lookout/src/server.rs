//! API server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::engine::Engine;
use crate::error::{DaemonError, Result};
use crate::routes::create_router;

/// A bound API listener.
#[derive(Debug)]
pub struct ApiServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl ApiServer {
    /// Binds the listener. Port 0 picks a free port.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::Bind` if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let bind_error = |e: std::io::Error| DaemonError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let addr = listener.local_addr().map_err(bind_error)?;
        Ok(Self { listener, addr })
    }

    /// The address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves the API until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::Bind` if accepting connections fails.
    pub async fn serve<F>(self, engine: Arc<Engine>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(addr = %self.addr, "API server listening");

        axum::serve(self.listener, create_router(engine))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| DaemonError::Bind {
                addr: self.addr.to_string(),
                reason: e.to_string(),
            })?;

        info!("API server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{engine_from, CONFIG};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bind_reports_actual_port() {
        let server = ApiServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn bind_conflict_is_an_error() {
        let first = ApiServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let result = ApiServer::bind(first.local_addr()).await;
        assert!(matches!(result, Err(DaemonError::Bind { .. })));
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let server = ApiServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(engine_from(CONFIG), async move {
            let _ = stop_rx.await;
        }));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /-/healthy HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"ok\""));

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
