//! Rendezvous: peer discovery and phase barriers
//!
//! Workers call [`Rendezvous::discover`] once their listener is bound and
//! [`Rendezvous::complete`] after the exchange. Two implementations:
//!
//! - [`SharedStateRendezvous`]: counters and port slots on a [`Board`]
//! - [`MonitorRendezvous`]: messages to a [`Monitor`] process

pub mod barrier;
pub mod board;
mod client;
pub mod monitor;
mod shared;

pub use barrier::{wait_until, BarrierKind, BarrierWait, NotifyWait, PollingWait};
pub use board::{Board, FileBoard, MemoryBoard, Phase};
pub use client::MonitorRendezvous;
pub use monitor::{Monitor, MonitorOutcome, MonitorSettings};
pub use shared::SharedStateRendezvous;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{ClusterRoster, WorkerIdentity};

/// Discovery and completion barriers for one worker
#[async_trait]
pub trait Rendezvous: Send {
    /// Announce this worker and wait for the full roster
    async fn discover(&mut self, identity: &WorkerIdentity) -> Result<ClusterRoster>;

    /// Wait until every worker has finished its exchange
    async fn complete(&mut self) -> Result<()>;
}
