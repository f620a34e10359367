//! Monitor process
//!
//! The monitor is a tiny coordinator that never exchanges payloads. It
//! collects one WORKER_LISTENING per worker connection, broadcasts the
//! roster, then waits for every WORKER_COMPLETED before telling everyone
//! to shut down.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::barrier::{wait_until, BarrierWait, PollingWait};
use crate::error::{Error, Result};
use crate::protocol::{ClusterRoster, ControlMessage, Message, Opcode};
use crate::transport::{Connection, ListenOptions, Listener, Transport};

/// Monitor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Listening,
    Collecting,
    Ready,
    Completing,
    Done,
}

/// Direction of a logged opcode, from the monitor's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Received,
    Sent,
}

/// Every opcode the monitor saw, in order
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseLog {
    entries: Vec<(Direction, Opcode)>,
}

impl PhaseLog {
    fn push(&mut self, direction: Direction, opcode: Opcode) {
        self.entries.push((direction, opcode));
    }

    pub fn entries(&self) -> &[(Direction, Opcode)] {
        &self.entries
    }

    /// Collapse consecutive repeats into `(opcode, count)` runs
    pub fn runs(&self) -> Vec<(Opcode, usize)> {
        let mut runs: Vec<(Opcode, usize)> = Vec::new();
        for (_, opcode) in &self.entries {
            match runs.last_mut() {
                Some((last, count)) if last == opcode => *count += 1,
                _ => runs.push((*opcode, 1)),
            }
        }
        runs
    }
}

/// Result of a finished monitor run
#[derive(Debug, Clone)]
pub struct MonitorOutcome {
    pub roster: ClusterRoster,
    pub log: PhaseLog,
}

/// Cluster shape the monitor waits for
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub num_workers: usize,
    pub endpoints: usize,
    pub host: String,
    pub port: Option<u16>,
    /// Interval for the connection-count and close barriers
    pub poll_interval: Duration,
}

impl MonitorSettings {
    fn expected_connections(&self) -> usize {
        self.num_workers * self.endpoints
    }
}

/// A monitor with its listener bound
pub struct Monitor {
    settings: MonitorSettings,
    listener: Listener,
    waiter: Arc<dyn BarrierWait>,
    cancel: CancellationToken,
    state: MonitorState,
    log: PhaseLog,
}

impl Monitor {
    /// Open the listener; the assigned port is available from [`port`](Self::port)
    ///
    /// Every wait in [`run`](Self::run) gives up once `cancel` fires.
    pub async fn bind(
        transport: &dyn Transport,
        settings: MonitorSettings,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = transport
            .listen(&settings.host, settings.port, ListenOptions::default())
            .await?;
        info!(
            port = listener.port(),
            workers = settings.num_workers,
            endpoints = settings.endpoints,
            "Monitor listening"
        );
        let waiter = Arc::new(PollingWait::new(settings.poll_interval));
        Ok(Self {
            settings,
            listener,
            waiter,
            cancel,
            state: MonitorState::Listening,
            log: PhaseLog::default(),
        })
    }

    /// Replace the barrier strategy used while waiting for connections
    pub fn with_waiter(mut self, waiter: Arc<dyn BarrierWait>) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    /// Drive the state machine to completion
    pub async fn run(mut self) -> Result<MonitorOutcome> {
        let expected = self.settings.expected_connections();
        let registry = self.listener.registry();
        wait_until(self.waiter.as_ref(), &self.cancel, "worker connections", || {
            Ok(registry.len() >= expected)
        })
        .await?;
        let mut conns = registry.take_all();
        debug!(connections = conns.len(), "All worker connections registered");

        self.transition(MonitorState::Collecting);
        let roster = self.collect(&mut conns).await?;

        self.transition(MonitorState::Ready);
        self.broadcast(&mut conns, ControlMessage::ClusterReady(roster.clone()))
            .await?;

        self.transition(MonitorState::Completing);
        for conn in conns.iter_mut() {
            self.receive(conn.as_mut(), Opcode::WorkerCompleted).await?;
        }
        self.broadcast(&mut conns, ControlMessage::Shutdown).await?;

        for conn in conns.iter_mut() {
            conn.close().await;
        }
        self.listener.close();
        let listener = &self.listener;
        wait_until(
            &PollingWait::new(self.settings.poll_interval),
            &self.cancel,
            "monitor teardown",
            || Ok(listener.closed()),
        )
        .await?;

        self.transition(MonitorState::Done);
        info!(workers = roster.len(), "Monitor finished");
        Ok(MonitorOutcome {
            roster,
            log: self.log,
        })
    }

    async fn collect(&mut self, conns: &mut [Box<dyn Connection>]) -> Result<ClusterRoster> {
        let mut seen = Vec::with_capacity(conns.len());
        for conn in conns.iter_mut() {
            match self.receive(conn.as_mut(), Opcode::WorkerListening).await? {
                ControlMessage::WorkerListening(addr) => {
                    debug!(worker = %addr, from = conn.peer(), "Worker listening");
                    seen.push(addr);
                }
                other => {
                    return Err(Error::ProtocolViolation {
                        expected: Opcode::WorkerListening,
                        actual: other.opcode(),
                    })
                }
            }
        }

        let roster = ClusterRoster::from_first_seen(seen);
        roster.validate(self.settings.num_workers)?;
        Ok(roster)
    }

    async fn receive(&mut self, conn: &mut dyn Connection, expected: Opcode) -> Result<ControlMessage> {
        let received = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::WaitCancelled { barrier: "worker messages" }),
            received = conn.recv() => received?,
        };
        let msg = received.into_control()?;
        self.log.push(Direction::Received, msg.opcode());
        msg.expect(expected)
    }

    async fn broadcast(&mut self, conns: &mut [Box<dyn Connection>], msg: ControlMessage) -> Result<()> {
        let opcode = msg.opcode();
        let message = Message::control(msg)?;
        for conn in conns.iter_mut() {
            conn.send(&message).await?;
            self.log.push(Direction::Sent, opcode);
        }
        debug!(opcode = %opcode, connections = conns.len(), "Broadcast");
        Ok(())
    }

    fn transition(&mut self, next: MonitorState) {
        debug!(from = ?self.state, to = ?next, "Monitor state");
        self.state = next;
    }
}
