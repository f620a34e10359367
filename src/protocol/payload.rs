//! Frames and messages
//!
//! A [`Message`] is what transports move: an ordered list of [`Frame`]s.
//! Frame 0 is always a JSON header that describes the logical payload and
//! the device flag of every data frame, so a receiver can rebuild the
//! payload from raw byte frames regardless of which transport carried them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::messages::{ControlMessage, ControlWire};
use crate::error::{Error, Result};

/// Contiguous bytes plus a flag telling whether they live in device memory
///
/// Buffers are always host memory here; the flag is carried faithfully so
/// a receiver knows where the sender would have placed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
    device: bool,
}

impl Frame {
    pub fn host(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            device: false,
        }
    }

    pub fn device(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            device: true,
        }
    }

    pub fn with_device(data: impl Into<Bytes>, device: bool) -> Self {
        Self {
            data: data.into(),
            device,
        }
    }

    /// Frame of `len` bytes counting up from zero and wrapping at 256
    pub fn pattern(len: usize) -> Self {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        Self::host(data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_device(&self) -> bool {
        self.device
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Logical content of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Rendezvous traffic
    Control(ControlMessage),
    /// Benchmark data, one or more buffers
    Buffers(Vec<Frame>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Header {
    Control {
        #[serde(flatten)]
        control: ControlWire,
    },
    Buffers {
        device: Vec<bool>,
    },
}

/// A payload together with its frame representation
#[derive(Debug, Clone)]
pub struct Message {
    payload: Payload,
    frames: Vec<Frame>,
}

impl Message {
    /// Build the frames for a payload
    pub fn new(payload: Payload) -> Result<Self> {
        let (header, data) = match &payload {
            Payload::Control(msg) => (
                Header::Control {
                    control: msg.to_wire(),
                },
                Vec::new(),
            ),
            Payload::Buffers(frames) => (
                Header::Buffers {
                    device: frames.iter().map(Frame::is_device).collect(),
                },
                frames.clone(),
            ),
        };

        let mut frames = Vec::with_capacity(data.len() + 1);
        frames.push(Frame::host(serde_json::to_vec(&header)?));
        frames.extend(data);
        Ok(Self { payload, frames })
    }

    pub fn control(msg: ControlMessage) -> Result<Self> {
        Self::new(Payload::Control(msg))
    }

    pub fn buffers(frames: Vec<Frame>) -> Result<Self> {
        Self::new(Payload::Buffers(frames))
    }

    /// Rebuild a message from received frames
    ///
    /// The header frame is authoritative for device flags: frames that
    /// crossed a stream transport arrive flagged as host memory.
    pub fn from_frames(frames: Vec<Frame>) -> Result<Self> {
        let mut iter = frames.into_iter();
        let header_frame = iter
            .next()
            .ok_or_else(|| Error::malformed("message has no header frame"))?;
        let header: Header = serde_json::from_slice(header_frame.bytes())
            .map_err(|e| Error::malformed(format!("invalid header frame: {}", e)))?;
        let rest: Vec<Frame> = iter.collect();

        let payload = match header {
            Header::Control { control } => {
                if !rest.is_empty() {
                    return Err(Error::malformed(format!(
                        "control message followed by {} data frames",
                        rest.len()
                    )));
                }
                Payload::Control(ControlMessage::from_wire(control)?)
            }
            Header::Buffers { device } => {
                if device.len() != rest.len() {
                    return Err(Error::malformed(format!(
                        "header describes {} frames, received {}",
                        device.len(),
                        rest.len()
                    )));
                }
                Payload::Buffers(
                    rest.into_iter()
                        .zip(device)
                        .map(|(frame, device)| Frame::with_device(frame.into_bytes(), device))
                        .collect(),
                )
            }
        };

        Self::new(payload)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Frames in wire order, header first
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Total size of the data frames (zero for control messages)
    pub fn payload_len(&self) -> usize {
        match &self.payload {
            Payload::Buffers(frames) => frames.iter().map(Frame::len).sum(),
            Payload::Control(_) => 0,
        }
    }

    /// Extract the control message, or fail if this is benchmark data
    pub fn into_control(self) -> Result<ControlMessage> {
        match self.payload {
            Payload::Control(msg) => Ok(msg),
            Payload::Buffers(_) => Err(Error::malformed(
                "expected a control message, got data buffers",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerAddress;

    #[test]
    fn test_buffers_roundtrip_restores_device_flags() {
        let msg = Message::buffers(vec![
            Frame::pattern(16),
            Frame::device(Bytes::from_static(b"gpu")),
            Frame::host(Bytes::new()),
        ])
        .unwrap();
        assert_eq!(msg.frames().len(), 4);
        assert_eq!(msg.payload_len(), 19);

        // a stream transport hands back plain host frames
        let raw: Vec<Frame> = msg
            .frames()
            .iter()
            .map(|f| Frame::host(f.bytes().clone()))
            .collect();
        let back = Message::from_frames(raw).unwrap();
        assert_eq!(back.payload(), msg.payload());
        match back.payload() {
            Payload::Buffers(frames) => {
                assert!(!frames[0].is_device());
                assert!(frames[1].is_device());
                assert!(frames[2].is_empty());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_control_roundtrip() {
        let ctrl = ControlMessage::WorkerListening(PeerAddress::new("127.0.0.1", 9000));
        let msg = Message::control(ctrl.clone()).unwrap();
        assert_eq!(msg.frames().len(), 1);
        assert_eq!(msg.payload_len(), 0);

        let header: serde_json::Value = serde_json::from_slice(msg.frames()[0].bytes()).unwrap();
        assert_eq!(header["opcode"], 1);

        let back = Message::from_frames(msg.frames().to_vec()).unwrap();
        assert_eq!(back.into_control().unwrap(), ctrl);
    }

    #[test]
    fn test_frame_count_mismatch_is_malformed() {
        let msg = Message::buffers(vec![Frame::pattern(4), Frame::pattern(4)]).unwrap();
        let mut frames = msg.frames().to_vec();
        frames.pop();
        assert!(matches!(
            Message::from_frames(frames),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            Message::from_frames(Vec::new()),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_pattern_wraps() {
        let frame = Frame::pattern(300);
        assert_eq!(frame.bytes()[255], 255);
        assert_eq!(frame.bytes()[256], 0);
    }
}
