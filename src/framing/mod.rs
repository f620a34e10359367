//! Length-prefixed record framing for stream transports
//!
//! A record carries one message as:
//!
//! ```text
//! [ total u64 ][ frame_count u64 ][ len_0 u64 ] ... [ len_n-1 u64 ][ frame_0 ] ... [ frame_n-1 ]
//! ```
//!
//! `total` counts everything after the prefix. Empty frames contribute a
//! zero length and no bytes. All integers are little-endian.
//!
//! Small records are coalesced into one buffer so they go out in a single
//! write; large ones are written as the prefix + header followed by each
//! non-empty frame, which avoids copying big payloads.

mod codec;

pub use codec::RecordDecoder;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::Frame;

/// Records at or above this many bytes (prefix included) are not coalesced
pub const DEFAULT_COALESCE_THRESHOLD: usize = 1 << 17;

/// Size of the `total` prefix and of each header integer
pub const WORD: usize = 8;

/// Upper bound on a single record body
pub const MAX_RECORD_SIZE: u64 = 1 << 30;

// ─────────────────────────────────────────────────────────────────
// Send Side
// ─────────────────────────────────────────────────────────────────

/// Builds write plans for outgoing messages
#[derive(Debug, Clone, Copy)]
pub struct WireFramer {
    coalesce_threshold: usize,
}

impl Default for WireFramer {
    fn default() -> Self {
        Self::new(DEFAULT_COALESCE_THRESHOLD)
    }
}

impl WireFramer {
    pub fn new(coalesce_threshold: usize) -> Self {
        Self { coalesce_threshold }
    }

    /// Lay out the record for `frames` as a sequence of writes
    pub fn plan(&self, frames: &[Frame]) -> WritePlan {
        let body_len: usize = frames.iter().map(Frame::len).sum();
        let header_len = WORD * (frames.len() + 1);
        let total = header_len + body_len;
        let wire_len = WORD + total;

        let mut head = BytesMut::with_capacity(WORD + header_len);
        head.put_u64_le(total as u64);
        encode_header(&mut head, frames.iter().map(Frame::len));

        if wire_len < self.coalesce_threshold {
            let mut buf = head;
            buf.reserve(body_len);
            for frame in frames {
                buf.extend_from_slice(frame.bytes());
            }
            return WritePlan {
                writes: vec![buf.freeze()],
                wire_len,
            };
        }

        let mut writes = Vec::with_capacity(frames.len() + 1);
        writes.push(head.freeze());
        writes.extend(
            frames
                .iter()
                .filter(|f| !f.is_empty())
                .map(|f| f.bytes().clone()),
        );
        WritePlan { writes, wire_len }
    }
}

/// Ordered buffers that make up one record on the wire
#[derive(Debug, Clone)]
pub struct WritePlan {
    writes: Vec<Bytes>,
    wire_len: usize,
}

impl WritePlan {
    pub fn writes(&self) -> &[Bytes] {
        &self.writes
    }

    /// Bytes the record occupies on the wire, prefix included
    pub fn wire_len(&self) -> usize {
        self.wire_len
    }

    pub fn is_coalesced(&self) -> bool {
        self.writes.len() == 1
    }

    /// Issue every write in order
    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        for buf in &self.writes {
            writer.write_all(buf).await?;
        }
        writer.flush().await
    }
}

/// Append `frame_count` and each frame length
pub fn encode_header<I>(buf: &mut BytesMut, lengths: I)
where
    I: ExactSizeIterator<Item = usize>,
{
    buf.put_u64_le(lengths.len() as u64);
    for len in lengths {
        buf.put_u64_le(len as u64);
    }
}

// ─────────────────────────────────────────────────────────────────
// Receive Side
// ─────────────────────────────────────────────────────────────────

/// Read one record body (everything after the prefix)
///
/// EOF before the first byte is a clean close; EOF anywhere later means
/// the peer died mid-record.
pub async fn read_record<R>(reader: &mut R, peer: &str) -> Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; WORD];
    let mut filled = 0;
    while filled < WORD {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(Error::stream_closed(peer));
            }
            return Err(Error::truncated(WORD as u64, filled as u64));
        }
        filled += n;
    }

    let total = u64::from_le_bytes(prefix);
    check_record_size(total)?;

    let mut body = BytesMut::with_capacity(total as usize);
    while body.len() < total as usize {
        let n = (&mut *reader)
            .take(total - body.len() as u64)
            .read_buf(&mut body)
            .await?;
        if n == 0 {
            return Err(Error::truncated(total, body.len() as u64));
        }
    }
    Ok(body.freeze())
}

pub(crate) fn check_record_size(total: u64) -> Result<()> {
    if total > MAX_RECORD_SIZE {
        return Err(Error::malformed(format!(
            "record of {} bytes exceeds limit of {}",
            total, MAX_RECORD_SIZE
        )));
    }
    if total < WORD as u64 {
        return Err(Error::truncated(WORD as u64, total));
    }
    Ok(())
}

/// Split a record body into frames without copying
///
/// Every frame boundary must lie inside the body.
pub fn parse_record(mut body: Bytes) -> Result<Vec<Frame>> {
    let received = body.len() as u64;
    if body.len() < WORD {
        return Err(Error::truncated(WORD as u64, received));
    }
    let count = body.get_u64_le();

    let header_len = count
        .checked_add(1)
        .and_then(|n| n.checked_mul(WORD as u64))
        .ok_or_else(|| Error::malformed(format!("frame count {} overflows", count)))?;
    if header_len > received {
        return Err(Error::truncated(header_len, received));
    }

    let mut lengths = Vec::with_capacity(count as usize);
    let mut declared = header_len;
    for _ in 0..count {
        let len = body.get_u64_le();
        declared = declared
            .checked_add(len)
            .ok_or_else(|| Error::malformed("frame lengths overflow"))?;
        lengths.push(len as usize);
    }

    if declared > received {
        return Err(Error::truncated(declared, received));
    }
    if declared < received {
        return Err(Error::malformed(format!(
            "{} trailing bytes after last frame",
            received - declared
        )));
    }

    Ok(lengths
        .into_iter()
        .map(|len| Frame::host(body.split_to(len)))
        .collect())
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn concat(plan: &WritePlan) -> Vec<u8> {
        plan.writes().iter().flat_map(|b| b.iter().copied()).collect()
    }

    /// Frames whose record is exactly `wire_len` bytes long
    fn frames_for_wire_len(wire_len: usize) -> Vec<Frame> {
        // prefix + count + one length
        let overhead = 3 * WORD;
        vec![Frame::pattern(wire_len - overhead)]
    }

    #[test]
    fn test_coalescing_boundary() {
        let framer = WireFramer::default();

        let below = framer.plan(&frames_for_wire_len(131_071));
        assert_eq!(below.wire_len(), 131_071);
        assert!(below.is_coalesced());

        let at = framer.plan(&frames_for_wire_len(131_072));
        assert_eq!(at.wire_len(), 131_072);
        assert_eq!(at.writes().len(), 2);
        assert_eq!(at.writes()[0].len(), 3 * WORD);
    }

    #[test]
    fn test_large_plan_skips_empty_frames() {
        let framer = WireFramer::new(0);
        let frames = vec![Frame::pattern(10), Frame::host(Bytes::new()), Frame::pattern(5)];
        let plan = framer.plan(&frames);
        assert_eq!(plan.writes().len(), 3);
        assert_eq!(plan.wire_len(), WORD + 4 * WORD + 15);
    }

    #[test]
    fn test_plan_layout() {
        let framer = WireFramer::default();
        let plan = framer.plan(&[Frame::host(Bytes::from_static(b"abc"))]);
        let wire = concat(&plan);

        let mut buf = &wire[..];
        assert_eq!(buf.get_u64_le(), 2 * WORD as u64 + 3);
        assert_eq!(buf.get_u64_le(), 1);
        assert_eq!(buf.get_u64_le(), 3);
        assert_eq!(buf, b"abc");
    }

    #[tokio::test]
    async fn test_roundtrip_sizes() {
        let framer = WireFramer::default();
        for size in [0usize, 1, 65_536, 131_071, 131_072, 262_144] {
            let frames = vec![Frame::pattern(size), Frame::host(Bytes::new())];
            let wire = concat(&framer.plan(&frames));

            let mut reader = &wire[..];
            let body = read_record(&mut reader, "test").await.unwrap();
            let parsed = parse_record(body).unwrap();
            assert_eq!(parsed, frames, "size {}", size);
        }
    }

    #[tokio::test]
    async fn test_record_split_across_reads() {
        let framer = WireFramer::default();
        let frames = vec![Frame::pattern(300), Frame::device(Bytes::from_static(b"gpu"))];
        let wire = concat(&framer.plan(&frames));

        // prefix arrives in two pieces, body in three
        let mut reader = tokio_test::io::Builder::new()
            .read(&wire[..3])
            .read(&wire[3..8])
            .read(&wire[8..40])
            .read(&wire[40..200])
            .read(&wire[200..])
            .build();
        let body = read_record(&mut reader, "peer").await.unwrap();
        let parsed = parse_record(body).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].bytes(), frames[0].bytes());
        assert_eq!(parsed[1].bytes(), frames[1].bytes());
    }

    #[tokio::test]
    async fn test_write_plan_reaches_writer_in_order() {
        let framer = WireFramer::new(16);
        let frames = vec![Frame::host(Bytes::from_static(b"hello")), Frame::pattern(40)];
        let plan = framer.plan(&frames);
        assert!(!plan.is_coalesced());

        let mut writer = tokio_test::io::Builder::new().write(&concat(&plan)).build();
        plan.write_to(&mut writer).await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_before_prefix_is_stream_closed() {
        let mut reader: &[u8] = &[];
        let err = read_record(&mut reader, "peer").await.unwrap_err();
        assert!(matches!(err, Error::StreamClosed { .. }));
    }

    #[tokio::test]
    async fn test_short_body_is_truncated() {
        // declares a 100 byte frame, delivers 50
        let mut wire = BytesMut::new();
        wire.put_u64_le(2 * WORD as u64 + 100);
        wire.put_u64_le(1);
        wire.put_u64_le(100);
        wire.extend_from_slice(&[7u8; 50]);

        let mut reader = &wire[..];
        let err = read_record(&mut reader, "peer").await.unwrap_err();
        assert!(matches!(
            err,
            Error::TruncatedData { declared: 116, received: 66 }
        ));
    }

    #[test]
    fn test_header_declaring_more_than_body_is_truncated() {
        let mut body = BytesMut::new();
        body.put_u64_le(1);
        body.put_u64_le(100);
        body.extend_from_slice(&[7u8; 50]);

        let err = parse_record(body.freeze()).unwrap_err();
        assert!(matches!(
            err,
            Error::TruncatedData { declared: 116, received: 66 }
        ));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut body = BytesMut::new();
        body.put_u64_le(1);
        body.put_u64_le(2);
        body.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            parse_record(body.freeze()),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_absurd_frame_count_does_not_overflow() {
        let mut body = BytesMut::new();
        body.put_u64_le(u64::MAX);
        assert!(parse_record(body.freeze()).is_err());
    }
}
