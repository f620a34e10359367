//! Stream transport, direct variant
//!
//! Each send issues the framer's write plan straight onto the socket and
//! each receive reads one record with `read_exact`-style loops.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{dial, Connection, ListenOptions, Listener, Transport, TransportKind};
use crate::error::{Error, Result};
use crate::framing::{parse_record, read_record, WireFramer};
use crate::protocol::{Message, PeerAddress};

pub struct StreamTransport {
    framer: WireFramer,
}

impl StreamTransport {
    pub fn new(framer: WireFramer) -> Self {
        Self { framer }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn listen(&self, host: &str, port: Option<u16>, options: ListenOptions) -> Result<Listener> {
        let framer = self.framer;
        let adopt = Arc::new(move |stream: TcpStream, peer: String| {
            Box::new(StreamConnection::new(stream, peer, framer)) as Box<dyn Connection>
        });
        Listener::bind(host, port, options, adopt).await
    }

    async fn connect(&self, addr: &PeerAddress) -> Result<Box<dyn Connection>> {
        let stream = dial(addr).await?;
        Ok(Box::new(StreamConnection::new(stream, addr.to_string(), self.framer)))
    }
}

pub struct StreamConnection {
    peer: String,
    stream: Option<TcpStream>,
    framer: WireFramer,
}

impl StreamConnection {
    fn new(stream: TcpStream, peer: String, framer: WireFramer) -> Self {
        Self {
            peer,
            stream: Some(stream),
            framer,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        let peer = &self.peer;
        self.stream
            .as_mut()
            .ok_or_else(|| Error::stream_closed(peer))
    }

    /// Drop the socket and report the stream as closed
    fn mark_closed(&mut self) -> Error {
        self.stream = None;
        Error::stream_closed(&self.peer)
    }

    /// Close the connection after any failure; decoding errors keep their cause
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(Error::StreamClosed { .. }) => Err(self.mark_closed()),
            Err(Error::Io(e)) => {
                debug!(peer = %self.peer, error = %e, "Socket failed");
                Err(self.mark_closed())
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Connection for StreamConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send(&mut self, message: &Message) -> Result<usize> {
        let plan = self.framer.plan(message.frames());
        let stream = self.stream()?;
        let result = plan.write_to(stream).await.map_err(Error::from);
        self.settle(result)?;
        trace!(
            peer = %self.peer,
            bytes = plan.wire_len(),
            writes = plan.writes().len(),
            coalesced = plan.is_coalesced(),
            "Record sent"
        );
        Ok(plan.wire_len())
    }

    async fn recv(&mut self) -> Result<Message> {
        let peer = self.peer.clone();
        let stream = self.stream()?;
        let result = read_record(stream, &peer).await;
        let body = self.settle(result)?;
        Message::from_frames(parse_record(body)?)
    }

    async fn send_recv(&mut self, message: &Message) -> Result<Message> {
        let plan = self.framer.plan(message.frames());
        let peer = self.peer.clone();
        let (mut reader, mut writer) = self.stream()?.split();
        let result = tokio::try_join!(
            async { plan.write_to(&mut writer).await.map_err(Error::from) },
            read_record(&mut reader, &peer),
        );
        let (_, body) = self.settle(result)?;
        Message::from_frames(parse_record(body)?)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn closed(&self) -> bool {
        self.stream.is_none()
    }
}
