//! Transport abstraction
//!
//! One exchange implementation runs over any [`Transport`]:
//!
//! - `native`: tag / active-message engine with engine-level boundaries
//! - `stream`: length-prefixed records written straight to the socket
//! - `buffered`: same records, driven by dedicated reader and writer tasks
//!
//! Every variant listens through the shared [`Listener`], which appends
//! accepted connections to a [`ConnectionRegistry`].

mod buffered;
mod listener;
pub mod native;
mod registry;
mod retry;
mod stream;

pub use buffered::BufferedTransport;
pub use listener::{Adopt, ListenOptions, Listener};
pub use native::{NativeMode, NativeTransport};
pub use registry::ConnectionRegistry;
pub use retry::{connect_with_retry, RetryPolicy};
pub use stream::StreamTransport;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use crate::config::TransportSettings;
use crate::error::{Error, Result};
use crate::framing::WireFramer;
use crate::protocol::{Message, PeerAddress};

// ─────────────────────────────────────────────────────────────────
// Transport Kind
// ─────────────────────────────────────────────────────────────────

/// Which transport variant to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Tag / active-message engine
    Native,
    /// Direct stream reads and writes
    Stream,
    /// Stream split into reader and writer tasks
    Buffered,
}

impl Default for TransportKind {
    fn default() -> Self {
        TransportKind::Stream
    }
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Native => "native",
            TransportKind::Stream => "stream",
            TransportKind::Buffered => "buffered",
        }
    }

    /// Whether payload warm-up runs unless configured otherwise
    pub fn warmup_by_default(&self) -> bool {
        matches!(self, TransportKind::Native)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(TransportKind::Native),
            "stream" => Ok(TransportKind::Stream),
            "buffered" => Ok(TransportKind::Buffered),
            other => Err(Error::config_field_invalid(
                "transport.backend",
                format!("unknown transport '{}' (expected native, stream or buffered)", other),
            )),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Capability Traits
// ─────────────────────────────────────────────────────────────────

/// Factory for listeners and outbound connections
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Bind a listener; `port = None` asks the OS for an ephemeral port
    async fn listen(&self, host: &str, port: Option<u16>, options: ListenOptions) -> Result<Listener>;

    /// Single connection attempt, see [`connect_with_retry`] for the loop
    async fn connect(&self, addr: &PeerAddress) -> Result<Box<dyn Connection>>;
}

/// Bidirectional message channel to one peer
#[async_trait]
pub trait Connection: Send {
    /// Remote address, for logs and errors
    fn peer(&self) -> &str;

    /// Send one message, returning the bytes put on the wire
    async fn send(&mut self, message: &Message) -> Result<usize>;

    /// Receive the next message
    async fn recv(&mut self) -> Result<Message>;

    /// Send `message` while receiving the peer's next one
    ///
    /// Both directions are in flight together, so two peers may call this
    /// against each other with payloads larger than the socket buffers.
    async fn send_recv(&mut self, message: &Message) -> Result<Message>;

    async fn close(&mut self);

    fn closed(&self) -> bool;
}

// ─────────────────────────────────────────────────────────────────
// Construction
// ─────────────────────────────────────────────────────────────────

/// Build the transport selected in configuration
pub fn build_transport(settings: &TransportSettings) -> Arc<dyn Transport> {
    let framer = WireFramer::new(settings.coalesce_threshold);
    match settings.backend {
        TransportKind::Native => Arc::new(NativeTransport::new(settings.native_mode)),
        TransportKind::Stream => Arc::new(StreamTransport::new(framer)),
        TransportKind::Buffered => Arc::new(BufferedTransport::new(framer)),
    }
}

/// Open a TCP stream to `addr` with Nagle disabled
pub(crate) async fn dial(addr: &PeerAddress) -> Result<TcpStream> {
    let stream = TcpStream::connect((addr.host.as_str(), addr.port))
        .await
        .map_err(|source| Error::ConnectionFailed {
            addr: addr.clone(),
            source,
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
