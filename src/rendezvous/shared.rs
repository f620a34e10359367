//! Shared-state rendezvous
//!
//! Workers meet on a [`Board`]: each one bumps the phase counter and, for
//! discovery, publishes its listen port in its ordinal's slot, then polls
//! until every worker has arrived.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::barrier::{wait_for, PollingWait};
use super::board::{Board, Phase};
use super::Rendezvous;
use crate::error::{Error, Result};
use crate::protocol::{ClusterRoster, PeerAddress, WorkerIdentity};

pub struct SharedStateRendezvous {
    board: Arc<dyn Board>,
    num_workers: usize,
    discovery_wait: PollingWait,
    completion_wait: PollingWait,
    cancel: CancellationToken,
}

impl SharedStateRendezvous {
    pub fn new(
        board: Arc<dyn Board>,
        discovery_wait: PollingWait,
        completion_wait: PollingWait,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            num_workers: board.capacity(),
            board,
            discovery_wait,
            completion_wait,
            cancel,
        }
    }

    /// Run a board operation on the blocking pool
    ///
    /// File boards do positioned IO and take an exclusive lock.
    async fn with_board<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Board) -> Result<T> + Send + 'static,
    {
        let board = Arc::clone(&self.board);
        tokio::task::spawn_blocking(move || op(board.as_ref()))
            .await
            .map_err(|e| Error::Internal(format!("board access panicked: {}", e)))?
    }

    async fn barrier(&self, phase: Phase, waiter: &PollingWait) -> Result<()> {
        let expected = self.num_workers;
        let name = match phase {
            Phase::Discovery => "discovery",
            Phase::Completion => "completion",
        };
        wait_for(waiter, &self.cancel, name, || async move {
            let arrived = self.with_board(move |b| b.arrivals(phase)).await? as usize;
            if arrived > expected {
                return Err(Error::RosterMismatch {
                    expected,
                    actual: arrived,
                });
            }
            Ok(arrived == expected)
        })
        .await
    }
}

#[async_trait]
impl Rendezvous for SharedStateRendezvous {
    async fn discover(&mut self, identity: &WorkerIdentity) -> Result<ClusterRoster> {
        let slot = (identity.ordinal, identity.port);
        let arrived = self
            .with_board(move |b| b.arrive(Phase::Discovery, Some(slot)))
            .await?;
        debug!(ordinal = identity.ordinal, arrived, "Registered on board");

        self.barrier(Phase::Discovery, &self.discovery_wait).await?;

        let roster = ClusterRoster::new(
            self.with_board(|b| b.ports())
                .await?
                .into_iter()
                .map(|port| PeerAddress::new(identity.host.clone(), port))
                .collect(),
        );
        roster.validate(self.num_workers)?;
        info!(ordinal = identity.ordinal, workers = roster.len(), "Discovery complete");
        Ok(roster)
    }

    async fn complete(&mut self) -> Result<()> {
        self.with_board(|b| b.arrive(Phase::Completion, None)).await?;
        self.barrier(Phase::Completion, &self.completion_wait).await?;
        debug!("Completion barrier released");
        Ok(())
    }
}
