//! Message engine with tagged and active-message delivery
//!
//! Each engine message is delivered whole: the engine owns the boundaries,
//! so callers never see partial messages. On the socket every message is
//! `[kind u8][tag u64][len u64][bytes]`, little-endian.
//!
//! Tagged receives post a buffer of a known length and must be matched by
//! a message with the same tag. Active messages carry their own length.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

const ENVELOPE_LEN: usize = 1 + 8 + 8;

/// Largest single engine message accepted from a peer
pub const MAX_ENGINE_MESSAGE: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Kind {
    Tag = 1,
    Active = 2,
}

impl Kind {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Kind::Tag),
            2 => Ok(Kind::Active),
            other => Err(Error::malformed(format!("unknown engine message kind {}", other))),
        }
    }
}

/// One engine endpoint bound to a peer
///
/// [`split`](Self::split) yields independent sending and receiving halves
/// so both directions can be in flight at once.
pub struct Endpoint {
    peer: String,
    stream: TcpStream,
}

impl Endpoint {
    pub fn new(stream: TcpStream, peer: String) -> Self {
        Self { peer, stream }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn split(&mut self) -> (EndpointSender<'_>, EndpointReceiver<'_>) {
        let (read, write) = self.stream.split();
        (
            EndpointSender { stream: write },
            EndpointReceiver {
                peer: &self.peer,
                stream: read,
            },
        )
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Sending half of an [`Endpoint`]
pub struct EndpointSender<'a> {
    stream: WriteHalf<'a>,
}

impl EndpointSender<'_> {
    pub async fn tag_send(&mut self, tag: u64, data: &[u8]) -> Result<()> {
        self.post(Kind::Tag, tag, data).await
    }

    pub async fn am_send(&mut self, data: &[u8]) -> Result<()> {
        self.post(Kind::Active, 0, data).await
    }

    async fn post(&mut self, kind: Kind, tag: u64, data: &[u8]) -> Result<()> {
        let mut envelope = BytesMut::with_capacity(ENVELOPE_LEN);
        envelope.put_u8(kind as u8);
        envelope.put_u64_le(tag);
        envelope.put_u64_le(data.len() as u64);

        self.stream.write_all(&envelope).await?;
        if !data.is_empty() {
            self.stream.write_all(data).await?;
        }
        Ok(())
    }
}

/// Receiving half of an [`Endpoint`]
pub struct EndpointReceiver<'a> {
    peer: &'a str,
    stream: ReadHalf<'a>,
}

impl EndpointReceiver<'_> {
    /// Receive a tagged message into a buffer of `posted` bytes
    ///
    /// A message shorter than the posted buffer means the sender gave up
    /// part way and is reported as truncation.
    pub async fn tag_recv(&mut self, tag: u64, posted: usize) -> Result<Bytes> {
        let (kind, got_tag, len) = self.read_envelope().await?;
        if kind != Kind::Tag {
            return Err(Error::malformed("expected a tagged message, got an active message"));
        }
        if got_tag != tag {
            return Err(Error::malformed(format!(
                "tag mismatch: posted {:#x}, received {:#x}",
                tag, got_tag
            )));
        }
        if len > posted as u64 {
            return Err(Error::malformed(format!(
                "message of {} bytes does not fit posted buffer of {}",
                len, posted
            )));
        }
        let data = self.read_body(len).await?;
        if data.len() < posted {
            return Err(Error::truncated(posted as u64, data.len() as u64));
        }
        Ok(data)
    }

    /// Receive the next active message, whatever its size
    pub async fn am_recv(&mut self) -> Result<Bytes> {
        let (kind, _, len) = self.read_envelope().await?;
        if kind != Kind::Active {
            return Err(Error::malformed("expected an active message, got a tagged message"));
        }
        self.read_body(len).await
    }

    async fn read_envelope(&mut self) -> Result<(Kind, u64, u64)> {
        let mut buf = [0u8; ENVELOPE_LEN];
        let mut filled = 0;
        while filled < ENVELOPE_LEN {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Err(Error::stream_closed(self.peer));
                }
                return Err(Error::truncated(ENVELOPE_LEN as u64, filled as u64));
            }
            filled += n;
        }

        let kind = Kind::from_byte(buf[0])?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[1..9]);
        let tag = u64::from_le_bytes(word);
        word.copy_from_slice(&buf[9..17]);
        let len = u64::from_le_bytes(word);

        if len > MAX_ENGINE_MESSAGE {
            return Err(Error::malformed(format!(
                "engine message of {} bytes exceeds limit",
                len
            )));
        }
        Ok((kind, tag, len))
    }

    async fn read_body(&mut self, len: u64) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(len as usize);
        while (body.len() as u64) < len {
            let n = (&mut self.stream)
                .take(len - body.len() as u64)
                .read_buf(&mut body)
                .await?;
            if n == 0 {
                return Err(Error::truncated(len, body.len() as u64));
            }
        }
        Ok(body.freeze())
    }
}
