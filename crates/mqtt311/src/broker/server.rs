//! Accept loop and broker lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use mqtt311_protocol::{MqttError, Result};

use crate::broker::backend::Backend;
use crate::broker::client::ClientHandler;
use crate::broker::config::BrokerConfig;

/// Accepts connections and runs one [`ClientHandler`] task per
/// stream until [`Engine::close`] is called.
pub struct Engine {
    config: Arc<BrokerConfig>,
    backend: Arc<dyn Backend>,
    close_token: CancellationToken,
    clients: TaskTracker,
}

impl Engine {
    #[must_use]
    pub fn new(config: BrokerConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            close_token: CancellationToken::new(),
            clients: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Binds a TCP listener.
    ///
    /// # Errors
    /// Returns a launch error if the listener cannot be set up.
    pub async fn bind(addr: SocketAddr, config: BrokerConfig, backend: Arc<dyn Backend>) -> Result<(Self, TcpListener)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| MqttError::Launch(err.to_string()))?;
        Ok((Self::new(config, backend), listener))
    }

    /// Runs the accept loop until the engine is closed or the
    /// listener fails.
    ///
    /// # Errors
    /// Returns a network error if accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "broker listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted
                        .map_err(|err| MqttError::Network(err.to_string()))?;
                    debug!(%peer, "accepted connection");
                    self.handle(stream);
                }
                () = self.close_token.cancelled() => {
                    debug!("accept loop stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Spawns a client engine for an accepted TCP stream.
    pub fn handle(&self, stream: TcpStream) {
        self.handle_stream(stream);
    }

    /// Spawns a client engine for any framed byte stream. Used by
    /// alternative listeners and in-memory pipes.
    pub fn handle_stream<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = ClientHandler::new(
            stream,
            self.config.clone(),
            self.backend.clone(),
            self.close_token.clone(),
        );
        self.clients.spawn(async move {
            if let Err(err) = handler.run().await {
                debug!(error = %err, "client engine ended with error");
            }
        });
    }

    /// Stops accepting, kills the active clients through the backend
    /// and waits for every client task to finish. Returns whether the
    /// backend drained within its close timeout.
    pub async fn close(&self) -> bool {
        info!("closing broker engine");
        self.close_token.cancel();

        let drained = self.backend.close(self.config.close_timeout).await;
        if !drained {
            warn!("backend close timed out with clients still active");
        }

        self.clients.close();
        self.clients.wait().await;
        drained
    }
}
