//! Worker side of monitor-mediated rendezvous

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Rendezvous;
use crate::error::{Error, Result};
use crate::protocol::{ClusterRoster, ControlMessage, Message, Opcode, PeerAddress, WorkerIdentity};
use crate::transport::{connect_with_retry, Connection, RetryPolicy, Transport};

/// Talks to the monitor over one connection per endpoint slot
pub struct MonitorRendezvous {
    transport: Arc<dyn Transport>,
    monitor: PeerAddress,
    num_workers: usize,
    endpoints: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    conns: Vec<Box<dyn Connection>>,
}

impl MonitorRendezvous {
    pub fn new(
        transport: Arc<dyn Transport>,
        monitor: PeerAddress,
        num_workers: usize,
        endpoints: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            monitor,
            num_workers,
            endpoints,
            retry,
            cancel,
            conns: Vec::new(),
        }
    }

    async fn broadcast(&mut self, msg: ControlMessage) -> Result<()> {
        let message = Message::control(msg)?;
        for conn in self.conns.iter_mut() {
            conn.send(&message).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Rendezvous for MonitorRendezvous {
    async fn discover(&mut self, identity: &WorkerIdentity) -> Result<ClusterRoster> {
        for slot in 0..self.endpoints {
            let conn = connect_with_retry(
                self.transport.as_ref(),
                &self.monitor,
                &self.retry,
                &self.cancel,
            )
            .await?;
            debug!(monitor = %self.monitor, slot, "Connected to monitor");
            self.conns.push(conn);
        }

        self.broadcast(ControlMessage::WorkerListening(identity.address()))
            .await?;

        let mut roster: Option<ClusterRoster> = None;
        for conn in self.conns.iter_mut() {
            let msg = conn.recv().await?.into_control()?.expect(Opcode::ClusterReady)?;
            let ControlMessage::ClusterReady(received) = msg else {
                return Err(Error::malformed("CLUSTER_READY without a roster"));
            };
            match &roster {
                None => roster = Some(received),
                Some(first) if *first != received => {
                    return Err(Error::malformed("monitor sent diverging rosters"));
                }
                Some(_) => {}
            }
        }

        let roster = roster.ok_or_else(|| Error::Internal("no monitor connections".into()))?;
        roster.validate(self.num_workers)?;
        if !roster.contains(&identity.address()) {
            return Err(Error::malformed(format!(
                "roster does not contain this worker ({})",
                identity.address()
            )));
        }
        info!(ordinal = identity.ordinal, workers = roster.len(), "Cluster ready");
        Ok(roster)
    }

    async fn complete(&mut self) -> Result<()> {
        self.broadcast(ControlMessage::WorkerCompleted).await?;
        for conn in self.conns.iter_mut() {
            conn.recv().await?.into_control()?.expect(Opcode::Shutdown)?;
        }
        for conn in self.conns.iter_mut() {
            conn.close().await;
        }
        self.conns.clear();
        debug!("Monitor released the cluster");
        Ok(())
    }
}
