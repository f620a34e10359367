//! Rendezvous control messages
//!
//! Workers and the monitor exchange these during discovery and completion.
//! On the wire a control message is the JSON header frame of an ordinary
//! [`Message`](super::Message): `{"opcode": <u32>, "payload": ...}`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Opcodes
// ─────────────────────────────────────────────────────────────────

/// Rendezvous opcode, encoded as an unsigned integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum Opcode {
    None = 0,
    WorkerListening = 1,
    ClusterReady = 2,
    WorkerCompleted = 3,
    Shutdown = 4,
}

impl Opcode {
    /// Wire name, as it appears in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::None => "NONE",
            Opcode::WorkerListening => "WORKER_LISTENING",
            Opcode::ClusterReady => "CLUSTER_READY",
            Opcode::WorkerCompleted => "WORKER_COMPLETED",
            Opcode::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Opcode> for u32 {
    fn from(op: Opcode) -> u32 {
        op as u32
    }
}

impl TryFrom<u32> for Opcode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Opcode::None),
            1 => Ok(Opcode::WorkerListening),
            2 => Ok(Opcode::ClusterReady),
            3 => Ok(Opcode::WorkerCompleted),
            4 => Ok(Opcode::Shutdown),
            other => Err(Error::malformed(format!("unknown opcode {}", other))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Addresses and Roster
// ─────────────────────────────────────────────────────────────────

/// Listen address of a worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity of one worker, fixed once its listener is bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Position of the worker in the cluster, `0..num_workers`
    pub ordinal: usize,
    pub host: String,
    /// Bound listen port (OS-assigned when ephemeral)
    pub port: u16,
}

impl WorkerIdentity {
    pub fn new(ordinal: usize, host: impl Into<String>, port: u16) -> Self {
        Self {
            ordinal,
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> PeerAddress {
        PeerAddress::new(self.host.clone(), self.port)
    }
}

/// Ordered list of every worker's listen address
///
/// Populated once by rendezvous and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterRoster {
    peers: Vec<PeerAddress>,
}

impl ClusterRoster {
    pub fn new(peers: Vec<PeerAddress>) -> Self {
        Self { peers }
    }

    /// Build a roster from addresses in first-seen order, dropping repeats
    pub fn from_first_seen<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = PeerAddress>,
    {
        let mut peers: Vec<PeerAddress> = Vec::new();
        for addr in addresses {
            if !peers.contains(&addr) {
                peers.push(addr);
            }
        }
        Self { peers }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> &[PeerAddress] {
        &self.peers
    }

    pub fn contains(&self, addr: &PeerAddress) -> bool {
        self.peers.contains(addr)
    }

    /// Every entry except `me`, in roster order
    pub fn others<'a>(&'a self, me: &'a PeerAddress) -> impl Iterator<Item = &'a PeerAddress> + 'a {
        self.peers.iter().filter(move |p| *p != me)
    }

    /// Check that the roster holds exactly `expected` distinct entries
    pub fn validate(&self, expected: usize) -> Result<()> {
        let distinct = ClusterRoster::from_first_seen(self.peers.iter().cloned()).len();
        if self.peers.len() != expected || distinct != expected {
            return Err(Error::RosterMismatch {
                expected,
                actual: distinct,
            });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Control Messages
// ─────────────────────────────────────────────────────────────────

/// A rendezvous message with its opcode-specific payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    None,
    WorkerListening(PeerAddress),
    ClusterReady(ClusterRoster),
    WorkerCompleted,
    Shutdown,
}

impl ControlMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            ControlMessage::None => Opcode::None,
            ControlMessage::WorkerListening(_) => Opcode::WorkerListening,
            ControlMessage::ClusterReady(_) => Opcode::ClusterReady,
            ControlMessage::WorkerCompleted => Opcode::WorkerCompleted,
            ControlMessage::Shutdown => Opcode::Shutdown,
        }
    }

    /// Fail with a protocol violation unless this message carries `expected`
    pub fn expect(self, expected: Opcode) -> Result<Self> {
        let actual = self.opcode();
        if actual != expected {
            return Err(Error::ProtocolViolation { expected, actual });
        }
        Ok(self)
    }

    pub(crate) fn to_wire(&self) -> ControlWire {
        let payload = match self {
            ControlMessage::WorkerListening(addr) => ControlBody::Address(addr.clone()),
            ControlMessage::ClusterReady(roster) => ControlBody::Roster(roster.clone()),
            _ => ControlBody::Empty,
        };
        ControlWire {
            opcode: self.opcode().into(),
            payload,
        }
    }

    pub(crate) fn from_wire(wire: ControlWire) -> Result<Self> {
        let opcode = Opcode::try_from(wire.opcode)?;
        match (opcode, wire.payload) {
            (Opcode::None, ControlBody::Empty) => Ok(ControlMessage::None),
            (Opcode::WorkerListening, ControlBody::Address(addr)) => {
                Ok(ControlMessage::WorkerListening(addr))
            }
            (Opcode::ClusterReady, ControlBody::Roster(roster)) => {
                Ok(ControlMessage::ClusterReady(roster))
            }
            // payload omitted entirely
            (Opcode::ClusterReady, ControlBody::Empty) => {
                Ok(ControlMessage::ClusterReady(ClusterRoster::default()))
            }
            (Opcode::WorkerCompleted, ControlBody::Empty) => Ok(ControlMessage::WorkerCompleted),
            (Opcode::Shutdown, ControlBody::Empty) => Ok(ControlMessage::Shutdown),
            (opcode, _) => Err(Error::malformed(format!(
                "payload does not match opcode {}",
                opcode
            ))),
        }
    }
}

/// JSON shape of a control message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ControlWire {
    pub opcode: u32,
    #[serde(default)]
    pub payload: ControlBody,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum ControlBody {
    Address(PeerAddress),
    Roster(ClusterRoster),
    #[default]
    Empty,
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &ControlMessage) -> ControlMessage {
        let json = serde_json::to_string(&msg.to_wire()).unwrap();
        let wire: ControlWire = serde_json::from_str(&json).unwrap();
        ControlMessage::from_wire(wire).unwrap()
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(u32::from(Opcode::None), 0);
        assert_eq!(u32::from(Opcode::WorkerListening), 1);
        assert_eq!(u32::from(Opcode::ClusterReady), 2);
        assert_eq!(u32::from(Opcode::WorkerCompleted), 3);
        assert_eq!(u32::from(Opcode::Shutdown), 4);
        assert_eq!(Opcode::try_from(2).unwrap(), Opcode::ClusterReady);
        assert!(Opcode::try_from(5).is_err());
    }

    #[test]
    fn test_worker_listening_wire_shape() {
        let msg = ControlMessage::WorkerListening(PeerAddress::new("10.0.0.1", 4100));
        let json = serde_json::to_value(msg.to_wire()).unwrap();
        assert_eq!(json["opcode"], 1);
        assert_eq!(json["payload"]["host"], "10.0.0.1");
        assert_eq!(json["payload"]["port"], 4100);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_cluster_ready_carries_roster() {
        let roster = ClusterRoster::new(vec![
            PeerAddress::new("h", 1),
            PeerAddress::new("h", 2),
        ]);
        let msg = ControlMessage::ClusterReady(roster.clone());
        match roundtrip(&msg) {
            ControlMessage::ClusterReady(r) => assert_eq!(r, roster),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bare_opcodes() {
        for msg in [ControlMessage::WorkerCompleted, ControlMessage::Shutdown, ControlMessage::None] {
            assert_eq!(roundtrip(&msg), msg);
        }
    }

    #[test]
    fn test_mismatched_payload_is_malformed() {
        let wire = ControlWire {
            opcode: Opcode::WorkerListening.into(),
            payload: ControlBody::Empty,
        };
        assert!(matches!(
            ControlMessage::from_wire(wire),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_expect_reports_violation() {
        let err = ControlMessage::Shutdown.expect(Opcode::ClusterReady).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation {
                expected: Opcode::ClusterReady,
                actual: Opcode::Shutdown
            }
        ));
    }

    #[test]
    fn test_roster_first_seen_dedup() {
        let a = PeerAddress::new("h", 1);
        let b = PeerAddress::new("h", 2);
        let roster = ClusterRoster::from_first_seen(vec![a.clone(), b.clone(), a.clone(), b.clone()]);
        assert_eq!(roster.peers(), &[a.clone(), b.clone()]);
        assert!(roster.validate(2).is_ok());
        assert!(matches!(
            roster.validate(3),
            Err(Error::RosterMismatch { expected: 3, actual: 2 })
        ));
        assert_eq!(roster.others(&a).cloned().collect::<Vec<_>>(), vec![b]);
    }
}
