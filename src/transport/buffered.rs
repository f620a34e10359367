//! Stream transport, task-split variant
//!
//! Same wire format as the direct variant, but the socket is split: a
//! writer task drains a queue of write plans and a reader task drives a
//! `FramedRead` with [`RecordDecoder`], forwarding record bodies over a
//! channel. A connection is the pair of channel ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::debug;

use super::{dial, Connection, ListenOptions, Listener, Transport, TransportKind};
use crate::error::{Error, Result};
use crate::framing::{parse_record, RecordDecoder, WireFramer, WritePlan};
use crate::protocol::{Message, PeerAddress};

/// Records decoded ahead of the consumer
const READ_QUEUE_DEPTH: usize = 4;

pub struct BufferedTransport {
    framer: WireFramer,
}

impl BufferedTransport {
    pub fn new(framer: WireFramer) -> Self {
        Self { framer }
    }
}

#[async_trait]
impl Transport for BufferedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Buffered
    }

    async fn listen(&self, host: &str, port: Option<u16>, options: ListenOptions) -> Result<Listener> {
        let framer = self.framer;
        let adopt = Arc::new(move |stream: TcpStream, peer: String| {
            Box::new(BufferedConnection::spawn(stream, peer, framer)) as Box<dyn Connection>
        });
        Listener::bind(host, port, options, adopt).await
    }

    async fn connect(&self, addr: &PeerAddress) -> Result<Box<dyn Connection>> {
        let stream = dial(addr).await?;
        Ok(Box::new(BufferedConnection::spawn(
            stream,
            addr.to_string(),
            self.framer,
        )))
    }
}

struct WriteRequest {
    plan: WritePlan,
    done: oneshot::Sender<std::io::Result<()>>,
}

pub struct BufferedConnection {
    peer: String,
    framer: WireFramer,
    write_tx: Option<mpsc::Sender<WriteRequest>>,
    read_rx: mpsc::Receiver<Result<Bytes>>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl BufferedConnection {
    fn spawn(stream: TcpStream, peer: String, framer: WireFramer) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(1);
        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_DEPTH);

        tokio::spawn(write_loop(peer.clone(), write_half, write_rx));
        let reader = tokio::spawn(read_loop(peer.clone(), read_half, read_tx));

        Self {
            peer,
            framer,
            write_tx: Some(write_tx),
            read_rx,
            closed: Arc::new(AtomicBool::new(false)),
            reader,
        }
    }

    fn mark_closed(&mut self) -> Error {
        self.closed.store(true, Ordering::Release);
        self.write_tx = None;
        self.reader.abort();
        Error::stream_closed(&self.peer)
    }

    fn sender(&self) -> Result<mpsc::Sender<WriteRequest>> {
        match &self.write_tx {
            Some(tx) if !self.closed.load(Ordering::Acquire) => Ok(tx.clone()),
            _ => Err(Error::stream_closed(&self.peer)),
        }
    }

    /// Close the connection after any failure; decoding errors keep their cause
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(Error::StreamClosed { .. }) | Err(Error::Io(_)) => Err(self.mark_closed()),
            Err(e) => {
                let _ = self.mark_closed();
                Err(e)
            }
        }
    }
}

/// Hand a plan to the writer task and wait until it is on the socket
async fn enqueue(write_tx: mpsc::Sender<WriteRequest>, plan: WritePlan, peer: &str) -> Result<()> {
    let (done, written) = oneshot::channel();
    if write_tx.send(WriteRequest { plan, done }).await.is_err() {
        return Err(Error::stream_closed(peer));
    }
    match written.await {
        Ok(Ok(())) => Ok(()),
        _ => Err(Error::stream_closed(peer)),
    }
}

async fn dequeue(read_rx: &mut mpsc::Receiver<Result<Bytes>>, peer: &str) -> Result<Bytes> {
    match read_rx.recv().await {
        Some(item) => item,
        None => Err(Error::stream_closed(peer)),
    }
}

#[async_trait]
impl Connection for BufferedConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send(&mut self, message: &Message) -> Result<usize> {
        let write_tx = self.sender()?;
        let plan = self.framer.plan(message.frames());
        let wire_len = plan.wire_len();
        let result = enqueue(write_tx, plan, &self.peer).await;
        self.settle(result)?;
        Ok(wire_len)
    }

    async fn recv(&mut self) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::stream_closed(&self.peer));
        }
        let result = dequeue(&mut self.read_rx, &self.peer).await;
        let body = self.settle(result)?;
        Message::from_frames(parse_record(body)?)
    }

    async fn send_recv(&mut self, message: &Message) -> Result<Message> {
        let write_tx = self.sender()?;
        let plan = self.framer.plan(message.frames());
        let result = tokio::try_join!(
            enqueue(write_tx, plan, &self.peer),
            dequeue(&mut self.read_rx, &self.peer),
        );
        let (_, body) = self.settle(result)?;
        Message::from_frames(parse_record(body)?)
    }

    async fn close(&mut self) {
        // dropping the sender lets the writer flush and shut down its half
        self.write_tx = None;
        self.reader.abort();
        self.closed.store(true, Ordering::Release);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for BufferedConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Background task: issues queued write plans in order
async fn write_loop(
    peer: String,
    mut writer: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<WriteRequest>,
) {
    while let Some(request) = write_rx.recv().await {
        let result = request.plan.write_to(&mut writer).await;
        let failed = result.is_err();
        if let Err(e) = &result {
            debug!(peer = %peer, error = %e, "Write failed");
        }
        let _ = request.done.send(result);
        if failed {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Background task: decodes records and forwards their bodies
async fn read_loop(peer: String, reader: OwnedReadHalf, read_tx: mpsc::Sender<Result<Bytes>>) {
    let mut records = FramedRead::new(reader, RecordDecoder::new());
    loop {
        let item = match records.next().await {
            Some(Ok(body)) => Ok(body),
            Some(Err(e)) => {
                debug!(peer = %peer, error = %e, "Read failed");
                Err(e)
            }
            None => Err(Error::stream_closed(&peer)),
        };
        let stop = item.is_err();
        if read_tx.send(item).await.is_err() || stop {
            return;
        }
    }
}
