use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::handler::{ClientHandler, EndpointConfig};
use crate::registry::InterceptRegistry;

/// Accepts tunnel connections from client agents and feeds the intercept
/// registry.
pub struct TunnelListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TunnelListener {
    /// Binds the configured port, falling back to an OS-assigned ephemeral
    /// port when that fails. The effective port is logged because with the
    /// fallback it is the only place a client can discover it.
    pub async fn bind(config: &EndpointConfig) -> io::Result<Self> {
        let listener = match TcpListener::bind((config.bind_addr.as_str(), config.port)).await {
            Ok(listener) => listener,
            Err(error) => {
                tracing::warn!(
                    port = config.port,
                    %error,
                    "configured port unavailable, falling back to an ephemeral port"
                );
                TcpListener::bind((config.bind_addr.as_str(), 0)).await?
            }
        };
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "tunnel endpoint listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(
        self,
        registry: Arc<InterceptRegistry>,
        config: EndpointConfig,
    ) -> io::Result<()> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            tracing::info!(%peer_addr, "client agent connected");
            let handler = ClientHandler::spawn(stream, &config);
            registry.register(handler);
        }
    }
}
