//! Native transport over the tag / active-message engine
//!
//! Tag mode sends a message as three metadata transfers (frame count,
//! device flags, frame lengths) followed by one tagged transfer per
//! non-empty frame. AM mode sends the frame count and then one active
//! message per frame, empty ones included, relying on the engine for
//! boundaries.

mod engine;

use engine::{Endpoint, EndpointReceiver, EndpointSender};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use super::{dial, Connection, ListenOptions, Listener, Transport, TransportKind};
use crate::error::{Error, Result};
use crate::protocol::{Frame, Message, PeerAddress};

/// Tag used for every benchmark transfer
const EXCHANGE_TAG: u64 = 0x6d65_7368;

/// Upper bound on frames per message
const MAX_FRAMES: u64 = 1 << 16;

/// How the native engine moves frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NativeMode {
    /// Tagged send / receive with posted buffers
    #[default]
    Tag,
    /// Active messages
    Am,
}

impl fmt::Display for NativeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeMode::Tag => f.write_str("tag"),
            NativeMode::Am => f.write_str("am"),
        }
    }
}

pub struct NativeTransport {
    mode: NativeMode,
}

impl NativeTransport {
    pub fn new(mode: NativeMode) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl Transport for NativeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Native
    }

    async fn listen(&self, host: &str, port: Option<u16>, options: ListenOptions) -> Result<Listener> {
        let mode = self.mode;
        let adopt = Arc::new(move |stream: TcpStream, peer: String| {
            Box::new(NativeConnection::new(Endpoint::new(stream, peer), mode)) as Box<dyn Connection>
        });
        Listener::bind(host, port, options, adopt).await
    }

    async fn connect(&self, addr: &PeerAddress) -> Result<Box<dyn Connection>> {
        let stream = dial(addr).await?;
        Ok(Box::new(NativeConnection::new(
            Endpoint::new(stream, addr.to_string()),
            self.mode,
        )))
    }
}

pub struct NativeConnection {
    peer: String,
    endpoint: Option<Endpoint>,
    mode: NativeMode,
}

impl NativeConnection {
    fn new(endpoint: Endpoint, mode: NativeMode) -> Self {
        Self {
            peer: endpoint.peer().to_string(),
            endpoint: Some(endpoint),
            mode,
        }
    }

    fn endpoint(&mut self) -> Result<&mut Endpoint> {
        let peer = &self.peer;
        self.endpoint
            .as_mut()
            .ok_or_else(|| Error::stream_closed(peer))
    }

    /// Drop the endpoint after any failure other than a decoding error
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Err(Error::StreamClosed { .. }) | Err(Error::Io(_)) => {
                self.endpoint = None;
                Err(Error::stream_closed(&self.peer))
            }
            Err(e @ Error::TruncatedData { .. }) => {
                self.endpoint = None;
                Err(e)
            }
            other => other,
        }
    }
}

#[async_trait]
impl Connection for NativeConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send(&mut self, message: &Message) -> Result<usize> {
        let mode = self.mode;
        let (mut tx, _) = self.endpoint()?.split();
        let result = send_frames(&mut tx, mode, message.frames()).await;
        self.settle(result)
    }

    async fn recv(&mut self) -> Result<Message> {
        let mode = self.mode;
        let (_, mut rx) = self.endpoint()?.split();
        let result = recv_frames(&mut rx, mode).await;
        let frames = self.settle(result)?;
        Message::from_frames(frames)
    }

    async fn send_recv(&mut self, message: &Message) -> Result<Message> {
        let mode = self.mode;
        let (mut tx, mut rx) = self.endpoint()?.split();
        let result = tokio::try_join!(
            send_frames(&mut tx, mode, message.frames()),
            recv_frames(&mut rx, mode),
        );
        let (_, frames) = self.settle(result)?;
        Message::from_frames(frames)
    }

    async fn close(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.shutdown().await;
        }
    }

    fn closed(&self) -> bool {
        self.endpoint.is_none()
    }
}

async fn send_frames(tx: &mut EndpointSender<'_>, mode: NativeMode, frames: &[Frame]) -> Result<usize> {
    match mode {
        NativeMode::Tag => tag_send(tx, frames).await,
        NativeMode::Am => am_send(tx, frames).await,
    }
}

async fn recv_frames(rx: &mut EndpointReceiver<'_>, mode: NativeMode) -> Result<Vec<Frame>> {
    match mode {
        NativeMode::Tag => tag_recv(rx).await,
        NativeMode::Am => am_recv(rx).await,
    }
}

// ─────────────────────────────────────────────────────────────────
// Tag Mode
// ─────────────────────────────────────────────────────────────────

async fn tag_send(endpoint: &mut EndpointSender<'_>, frames: &[Frame]) -> Result<usize> {
    let count = (frames.len() as u64).to_le_bytes();
    let flags: Vec<u8> = frames.iter().map(|f| f.is_device() as u8).collect();
    let mut lengths = BytesMut::with_capacity(8 * frames.len());
    for frame in frames {
        lengths.put_u64_le(frame.len() as u64);
    }

    endpoint.tag_send(EXCHANGE_TAG, &count).await?;
    endpoint.tag_send(EXCHANGE_TAG, &flags).await?;
    endpoint.tag_send(EXCHANGE_TAG, &lengths).await?;
    let mut sent = count.len() + flags.len() + lengths.len();

    for frame in frames.iter().filter(|f| !f.is_empty()) {
        endpoint.tag_send(EXCHANGE_TAG, frame.bytes()).await?;
        sent += frame.len();
    }
    Ok(sent)
}

async fn tag_recv(endpoint: &mut EndpointReceiver<'_>) -> Result<Vec<Frame>> {
    let count = endpoint.tag_recv(EXCHANGE_TAG, 8).await?.get_u64_le();
    check_frame_count(count)?;
    let count = count as usize;

    let flags = endpoint.tag_recv(EXCHANGE_TAG, count).await?;
    let mut lengths = endpoint.tag_recv(EXCHANGE_TAG, 8 * count).await?;

    let mut frames = Vec::with_capacity(count);
    for &flag in flags.iter() {
        let len = lengths.get_u64_le() as usize;
        let data = if len > 0 {
            endpoint.tag_recv(EXCHANGE_TAG, len).await?
        } else {
            Bytes::new()
        };
        frames.push(Frame::with_device(data, flag != 0));
    }
    Ok(frames)
}

// ─────────────────────────────────────────────────────────────────
// Active-Message Mode
// ─────────────────────────────────────────────────────────────────

async fn am_send(endpoint: &mut EndpointSender<'_>, frames: &[Frame]) -> Result<usize> {
    let count = (frames.len() as u64).to_le_bytes();
    endpoint.am_send(&count).await?;
    let mut sent = count.len();
    for frame in frames {
        endpoint.am_send(frame.bytes()).await?;
        sent += frame.len();
    }
    Ok(sent)
}

async fn am_recv(endpoint: &mut EndpointReceiver<'_>) -> Result<Vec<Frame>> {
    let mut count_msg = endpoint.am_recv().await?;
    if count_msg.len() != 8 {
        return Err(Error::malformed(format!(
            "frame count message has {} bytes",
            count_msg.len()
        )));
    }
    let count = count_msg.get_u64_le();
    check_frame_count(count)?;

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        // device flags travel in the header frame
        frames.push(Frame::host(endpoint.am_recv().await?));
    }
    Ok(frames)
}

fn check_frame_count(count: u64) -> Result<()> {
    if count == 0 || count > MAX_FRAMES {
        return Err(Error::malformed(format!("invalid frame count {}", count)));
    }
    Ok(())
}
