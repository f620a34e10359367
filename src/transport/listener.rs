//! Shared TCP accept path

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Connection, ConnectionRegistry};
use crate::error::Result;

/// Wraps an accepted stream into a transport-specific connection
pub type Adopt = Arc<dyn Fn(TcpStream, String) -> Box<dyn Connection> + Send + Sync>;

/// Behaviour of the accept path
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenOptions {
    /// Echo one message back on every new connection before registering it
    pub warmup_echo: bool,
}

/// Bound listener whose accept loop fills a [`ConnectionRegistry`]
pub struct Listener {
    port: u16,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Listener {
    /// Bind `host:port` (port 0 or `None` = ephemeral) and start accepting
    pub async fn bind(
        host: &str,
        port: Option<u16>,
        options: ListenOptions,
        adopt: Adopt,
    ) -> Result<Self> {
        let listener = TcpListener::bind((host, port.unwrap_or(0))).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, warmup = options.warmup_echo, "Listening");

        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&registry),
            options,
            adopt,
            shutdown.clone(),
            Arc::clone(&closed),
        ));

        Ok(Self {
            port: local.port(),
            registry,
            shutdown,
            closed,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Stop accepting; `closed()` turns true once the socket is released
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    options: ListenOptions,
    adopt: Adopt,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let conn = adopt(stream, peer_addr.to_string());
                    tokio::spawn(register_inbound(
                        conn,
                        peer_addr,
                        Arc::clone(&registry),
                        options,
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    drop(listener);
    closed.store(true, Ordering::Release);
    debug!("Listener closed");
}

async fn register_inbound(
    mut conn: Box<dyn Connection>,
    peer_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    options: ListenOptions,
) {
    if options.warmup_echo {
        let echoed = async {
            let msg = conn.recv().await?;
            conn.send(&msg).await
        };
        if let Err(e) = echoed.await {
            warn!(peer = %peer_addr, error = %e, "Warm-up echo failed, dropping connection");
            conn.close().await;
            return;
        }
    }

    debug!(peer = %peer_addr, "Inbound connection registered");
    registry.push(conn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::WireFramer;
    use crate::protocol::{Frame, Message, PeerAddress};
    use crate::transport::{StreamTransport, Transport};

    #[tokio::test]
    async fn test_close_is_observable() {
        let transport = StreamTransport::new(WireFramer::default());
        let listener = transport
            .listen("127.0.0.1", None, ListenOptions::default())
            .await
            .unwrap();
        assert_ne!(listener.port(), 0);
        assert!(!listener.closed());

        listener.close();
        while !listener.closed() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_warmup_echo_precedes_registration() {
        let transport = StreamTransport::new(WireFramer::default());
        let listener = transport
            .listen("127.0.0.1", None, ListenOptions { warmup_echo: true })
            .await
            .unwrap();
        let registry = listener.registry();

        let addr = PeerAddress::new("127.0.0.1", listener.port());
        let mut client = transport.connect(&addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.len(), 0);

        let msg = Message::buffers(vec![Frame::pattern(1024)]).unwrap();
        client.send(&msg).await.unwrap();
        let echo = client.recv().await.unwrap();
        assert_eq!(echo.payload(), msg.payload());

        while registry.len() < 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.take_all().len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
