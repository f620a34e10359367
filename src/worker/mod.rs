//! Worker orchestration
//!
//! A worker is one implementation composed over an injected transport and
//! rendezvous. Its run is a fixed sequence:
//!
//! 1. listen (ephemeral port unless configured)
//! 2. discover the roster
//! 3. connect to every other worker once per endpoint slot, warming up
//!    each slot's connections concurrently when enabled
//! 4. wait for every inbound connection
//! 5. exchange payloads on all connections at once
//! 6. completion barrier
//! 7. close everything and wait for the listener to go away

pub mod exchange;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bandwidth::BandwidthReport;
use crate::config::BenchConfig;
use crate::error::{Error, Result};
use crate::protocol::{ClusterRoster, Frame, Message, PeerAddress, WorkerIdentity};
use crate::rendezvous::{wait_until, BarrierKind, BarrierWait, NotifyWait, PollingWait, Rendezvous};
use crate::transport::{connect_with_retry, ListenOptions, RetryPolicy, Transport, TransportKind};

use self::exchange::{ExchangePlan, Outbound};

/// Per-worker run parameters
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub ordinal: usize,
    pub num_workers: usize,
    pub endpoints: usize,
    pub host: String,
    pub listen_port: Option<u16>,
    pub payload_size: usize,
    pub iterations: usize,
    pub client_sends_first: bool,
    pub gather: bool,
    pub warmup: bool,
    pub retry: RetryPolicy,
    pub barrier: BarrierKind,
    pub poll_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &BenchConfig, ordinal: usize, host: String) -> Self {
        Self {
            ordinal,
            num_workers: config.cluster.num_workers,
            endpoints: config.cluster.endpoints,
            host,
            listen_port: match config.network.listen_port {
                0 => None,
                port => Some(port),
            },
            payload_size: config.exchange.payload_size,
            iterations: config.exchange.iterations,
            client_sends_first: config.exchange.client_sends_first,
            gather: config.exchange.gather,
            warmup: config.warmup(),
            retry: config.retry_policy(),
            barrier: config.timing.barrier,
            poll_interval: config.poll_interval(),
        }
    }

    /// Inbound connections expected before the exchange starts
    pub fn expected_inbound(&self) -> usize {
        self.endpoints * self.num_workers.saturating_sub(1)
    }
}

/// Everything a finished worker reports
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub ordinal: usize,
    pub address: PeerAddress,
    pub roster: ClusterRoster,
    pub transport: TransportKind,
    pub endpoints: usize,
    pub payload_size: usize,
    pub iterations: usize,
    pub outbound: usize,
    pub inbound: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub bandwidth: BandwidthReport,
}

impl RunReport {
    pub fn summary_lines(&self) -> Vec<String> {
        self.bandwidth.summary_lines(self.address.port)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| Error::IoWrite {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub struct Worker {
    settings: WorkerSettings,
    transport: Arc<dyn Transport>,
    rendezvous: Box<dyn Rendezvous>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        transport: Arc<dyn Transport>,
        rendezvous: Box<dyn Rendezvous>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            transport,
            rendezvous,
            cancel,
        }
    }

    pub async fn run(mut self) -> Result<RunReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let ordinal = self.settings.ordinal;

        // 1. listen
        let listener = self
            .transport
            .listen(
                &self.settings.host,
                self.settings.listen_port,
                ListenOptions {
                    warmup_echo: self.settings.warmup,
                },
            )
            .await?;
        let identity = WorkerIdentity::new(ordinal, self.settings.host.clone(), listener.port());
        info!(
            ordinal,
            addr = %identity.address(),
            transport = %self.transport.kind(),
            "Worker listening"
        );

        // 2. discover
        let roster = self.rendezvous.discover(&identity).await?;

        // 3. connect
        let message = Message::buffers(vec![Frame::pattern(self.settings.payload_size)])?;
        let mut outbound = connect_peers(
            self.transport.as_ref(),
            &self.settings,
            &self.cancel,
            &identity,
            &roster,
            &message,
        )
        .await?;

        // 4. wait for inbound
        let expected = self.settings.expected_inbound();
        let registry = listener.registry();
        let waiter: Box<dyn BarrierWait> = match self.settings.barrier {
            BarrierKind::Poll => Box::new(PollingWait::new(self.settings.poll_interval)),
            BarrierKind::Notify => Box::new(NotifyWait::new(
                registry.notifier(),
                self.settings.poll_interval,
            )),
        };
        wait_until(waiter.as_ref(), &self.cancel, "inbound connections", || {
            Ok(registry.len() >= expected)
        })
        .await?;
        let mut inbound = registry.take_all();
        if inbound.len() != expected {
            return Err(Error::malformed(format!(
                "expected {} inbound connections, got {}",
                expected,
                inbound.len()
            )));
        }
        debug!(ordinal, inbound = inbound.len(), outbound = outbound.len(), "All connections established");

        // 5. exchange
        let plan = ExchangePlan {
            message,
            iterations: self.settings.iterations,
            client_sends_first: self.settings.client_sends_first,
            gather: self.settings.gather,
        };
        let recorder = exchange::run(&mut outbound, &mut inbound, &plan).await?;
        info!(ordinal, "Exchange finished");

        // 6. completion barrier
        self.rendezvous.complete().await?;

        // 7. teardown
        for o in outbound.iter_mut() {
            o.conn.close().await;
        }
        for conn in inbound.iter_mut() {
            conn.close().await;
        }
        listener.close();
        wait_until(
            &PollingWait::new(self.settings.poll_interval),
            &self.cancel,
            "listener teardown",
            || Ok(listener.closed()),
        )
        .await?;
        debug!(ordinal, "Teardown complete");

        Ok(RunReport {
            ordinal,
            address: identity.address(),
            roster,
            transport: self.transport.kind(),
            endpoints: self.settings.endpoints,
            payload_size: self.settings.payload_size,
            iterations: self.settings.iterations,
            outbound: outbound.len(),
            inbound: inbound.len(),
            started_at,
            elapsed_secs: clock.elapsed().as_secs_f64(),
            bandwidth: recorder.finish(),
        })
    }
}

/// Open one connection per (peer, slot), warming up each slot together
async fn connect_peers(
    transport: &dyn Transport,
    settings: &WorkerSettings,
    cancel: &CancellationToken,
    identity: &WorkerIdentity,
    roster: &ClusterRoster,
    message: &Message,
) -> Result<Vec<Outbound>> {
    let me = identity.address();
    if !roster.contains(&me) {
        return Err(Error::malformed(format!(
            "roster does not contain this worker ({})",
            me
        )));
    }

    let mut outbound = Vec::with_capacity(settings.endpoints * roster.len());
    for slot in 0..settings.endpoints {
        let mut slot_conns = Vec::with_capacity(roster.len());
        for peer in roster.others(&me) {
            let conn = connect_with_retry(transport, peer, &settings.retry, cancel).await?;
            debug!(ordinal = identity.ordinal, peer = %peer, slot, "Connected");
            slot_conns.push(Outbound {
                peer: peer.clone(),
                slot,
                conn,
            });
        }

        if settings.warmup {
            try_join_all(
                slot_conns
                    .iter_mut()
                    .map(|o| exchange::warm_up(o.conn.as_mut(), message)),
            )
            .await?;
            debug!(ordinal = identity.ordinal, slot, "Warm-up complete");
        }
        outbound.extend(slot_conns);
    }
    Ok(outbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::WireFramer;
    use crate::rendezvous::{Board, MemoryBoard, SharedStateRendezvous};
    use crate::transport::{NativeMode, NativeTransport, StreamTransport};

    fn settings(ordinal: usize, n: usize, e: usize, warmup: bool) -> WorkerSettings {
        WorkerSettings {
            ordinal,
            num_workers: n,
            endpoints: e,
            host: "127.0.0.1".into(),
            listen_port: None,
            payload_size: 1 << 20,
            iterations: 3,
            client_sends_first: false,
            gather: false,
            warmup,
            retry: RetryPolicy::default(),
            barrier: BarrierKind::Notify,
            poll_interval: Duration::from_millis(5),
        }
    }

    async fn run_shared(transport: Arc<dyn Transport>, n: usize, e: usize, warmup: bool) -> Vec<RunReport> {
        let board: Arc<dyn Board> = Arc::new(MemoryBoard::new(n));
        let tasks: Vec<_> = (0..n)
            .map(|ordinal| {
                let rendezvous = SharedStateRendezvous::new(
                    Arc::clone(&board),
                    PollingWait::new(Duration::from_millis(5)),
                    PollingWait::new(Duration::ZERO),
                    CancellationToken::new(),
                );
                let worker = Worker::new(
                    settings(ordinal, n, e, warmup),
                    Arc::clone(&transport),
                    Box::new(rendezvous),
                    CancellationToken::new(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let mut reports = Vec::new();
        for task in tasks {
            reports.push(task.await.unwrap().unwrap());
        }
        reports
    }

    #[tokio::test]
    async fn test_two_workers_three_samples_each() {
        let transport: Arc<dyn Transport> = Arc::new(StreamTransport::new(WireFramer::default()));
        let reports = run_shared(transport, 2, 1, false).await;

        for report in &reports {
            assert_eq!(report.roster.len(), 2);
            assert_eq!(report.inbound, 1);
            assert_eq!(report.bandwidth.peers.len(), 1);
            let stats = &report.bandwidth.peers[0];
            assert_eq!(stats.sample_count(), 3);
            assert!(stats.samples.iter().all(|s| s.bytes == 2 << 20));
            assert_ne!(stats.peer, report.address);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registry_matches_cluster_shape() {
        for n in [2usize, 4] {
            for e in [1usize, 2] {
                let transport: Arc<dyn Transport> =
                    Arc::new(StreamTransport::new(WireFramer::new(1 << 17)));
                for report in run_shared(transport, n, e, false).await {
                    assert_eq!(report.inbound, e * (n - 1));
                    assert_eq!(report.outbound, e * (n - 1));
                    // samples from every slot land on the same peer
                    for stats in &report.bandwidth.peers {
                        assert_eq!(stats.sample_count(), 3 * e);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_native_with_warmup() {
        let transport: Arc<dyn Transport> = Arc::new(NativeTransport::new(NativeMode::Tag));
        let reports = run_shared(transport, 3, 1, true).await;
        assert!(reports.iter().all(|r| r.bandwidth.peers.len() == 2));
    }

    #[tokio::test]
    async fn test_gather_on_every_transport() {
        use crate::transport::{BufferedTransport, TransportKind};

        let transports: Vec<Arc<dyn Transport>> = vec![
            Arc::new(StreamTransport::new(WireFramer::default())),
            Arc::new(BufferedTransport::new(WireFramer::default())),
            Arc::new(NativeTransport::new(NativeMode::Am)),
        ];
        for transport in transports {
            let kind = transport.kind();
            let board: Arc<dyn Board> = Arc::new(MemoryBoard::new(3));
            let tasks: Vec<_> = (0..3)
                .map(|ordinal| {
                    let mut settings = settings(ordinal, 3, 1, kind == TransportKind::Native);
                    settings.gather = true;
                    let rendezvous = SharedStateRendezvous::new(
                        Arc::clone(&board),
                        PollingWait::new(Duration::from_millis(5)),
                        PollingWait::new(Duration::ZERO),
                        CancellationToken::new(),
                    );
                    let worker = Worker::new(
                        settings,
                        Arc::clone(&transport),
                        Box::new(rendezvous),
                        CancellationToken::new(),
                    );
                    tokio::spawn(worker.run())
                })
                .collect();

            for task in tasks {
                let report = task.await.unwrap().unwrap();
                for stats in &report.bandwidth.peers {
                    assert_eq!(stats.sample_count(), 3, "{}", kind);
                    assert!(stats.samples.iter().all(|s| s.bytes == 2 << 20));
                }
            }
        }
    }

    #[test]
    fn test_expected_inbound() {
        assert_eq!(settings(0, 8, 2, false).expected_inbound(), 14);
        assert_eq!(settings(0, 1, 2, false).expected_inbound(), 0);
    }
}
