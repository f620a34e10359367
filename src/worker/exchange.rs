//! All-to-all payload exchange
//!
//! Every outbound connection runs the client role and every inbound one
//! the server role, all concurrently. The first error aborts the step.

use std::time::Instant;

use futures_util::future::{try_join, try_join_all};
use tracing::{debug, trace};

use crate::bandwidth::{BandwidthRecorder, BandwidthSample};
use crate::error::{Error, Result};
use crate::protocol::{Message, PeerAddress};
use crate::transport::Connection;

/// What every connection does during the exchange
#[derive(Debug, Clone)]
pub struct ExchangePlan {
    pub message: Message,
    pub iterations: usize,
    pub client_sends_first: bool,
    /// Send and receive each iteration concurrently, ignoring the order
    pub gather: bool,
}

impl ExchangePlan {
    fn payload_size(&self) -> usize {
        self.message.payload_len()
    }
}

/// Outbound connection with the roster entry it was opened to
pub struct Outbound {
    pub peer: PeerAddress,
    pub slot: usize,
    pub conn: Box<dyn Connection>,
}

/// Run the exchange and collect client-side samples
pub async fn run(
    outbound: &mut [Outbound],
    inbound: &mut [Box<dyn Connection>],
    plan: &ExchangePlan,
) -> Result<BandwidthRecorder> {
    let clients = try_join_all(
        outbound
            .iter_mut()
            .map(|o| client(o.conn.as_mut(), &o.peer, o.slot, plan)),
    );
    let servers = try_join_all(inbound.iter_mut().map(|c| server(c.as_mut(), plan)));

    let (client_samples, _) = try_join(clients, servers).await?;

    let mut recorder = BandwidthRecorder::new();
    for (peer, samples) in client_samples {
        recorder.register(&peer);
        for sample in samples {
            recorder.record(&peer, sample);
        }
    }
    Ok(recorder)
}

/// Send and receive one payload, in the order this role requires
async fn round_trip(conn: &mut dyn Connection, plan: &ExchangePlan, send_first: bool) -> Result<usize> {
    let received = if plan.gather {
        conn.send_recv(&plan.message).await?
    } else if send_first {
        conn.send(&plan.message).await?;
        conn.recv().await?
    } else {
        let received = conn.recv().await?;
        conn.send(&plan.message).await?;
        received
    };

    let actual = received.payload_len();
    if actual != plan.payload_size() {
        return Err(Error::PayloadMismatch {
            peer: conn.peer().to_string(),
            expected: plan.payload_size(),
            actual,
        });
    }
    Ok(actual)
}

/// Client role: timed round trips
async fn client(
    conn: &mut dyn Connection,
    peer: &PeerAddress,
    slot: usize,
    plan: &ExchangePlan,
) -> Result<(PeerAddress, Vec<BandwidthSample>)> {
    let mut samples = Vec::with_capacity(plan.iterations);
    for iteration in 0..plan.iterations {
        let started = Instant::now();
        let received = round_trip(conn, plan, plan.client_sends_first).await?;
        let elapsed = started.elapsed();

        let bytes = (plan.payload_size() + received) as u64;
        trace!(peer = %peer, slot, iteration, ?elapsed, "Round trip");
        samples.push(BandwidthSample::new(bytes, elapsed));
    }
    debug!(peer = %peer, slot, iterations = plan.iterations, "Client finished");
    Ok((peer.clone(), samples))
}

/// Server role: mirror image of the client, untimed
async fn server(conn: &mut dyn Connection, plan: &ExchangePlan) -> Result<()> {
    for _ in 0..plan.iterations {
        round_trip(conn, plan, !plan.client_sends_first).await?;
    }
    debug!(peer = conn.peer(), "Server finished");
    Ok(())
}

/// Untimed round trip on a fresh outbound connection
///
/// The listener's accept path echoes the message back.
pub async fn warm_up(conn: &mut dyn Connection, message: &Message) -> Result<()> {
    conn.send(message).await?;
    let echoed = conn.recv().await?;
    if echoed.payload_len() != message.payload_len() {
        return Err(Error::PayloadMismatch {
            peer: conn.peer().to_string(),
            expected: message.payload_len(),
            actual: echoed.payload_len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use crate::transport::tests::{all_transports, pair};

    fn plan(size: usize, iterations: usize, client_sends_first: bool) -> ExchangePlan {
        ExchangePlan {
            message: Message::buffers(vec![Frame::pattern(size)]).unwrap(),
            iterations,
            client_sends_first,
            gather: false,
        }
    }

    #[tokio::test]
    async fn test_one_sample_per_iteration() {
        for transport in all_transports() {
            for sends_first in [false, true] {
                let (_listener, client, server) = pair(&transport).await;
                let peer = PeerAddress::new("127.0.0.1", 1);
                let mut outbound = vec![Outbound {
                    peer: peer.clone(),
                    slot: 0,
                    conn: client,
                }];
                let mut inbound = vec![server];

                let recorder = run(&mut outbound, &mut inbound, &plan(4096, 3, sends_first))
                    .await
                    .unwrap();
                let report = recorder.finish();
                let stats = report.peer(&peer).unwrap();
                assert_eq!(stats.sample_count(), 3);
                assert!(stats.samples.iter().all(|s| s.bytes == 8192));
            }
        }
    }

    #[tokio::test]
    async fn test_gather_exchange() {
        for transport in all_transports() {
            let (_listener, client, server) = pair(&transport).await;
            let peer = PeerAddress::new("127.0.0.1", 1);
            let mut outbound = vec![Outbound {
                peer: peer.clone(),
                slot: 0,
                conn: client,
            }];
            let mut inbound = vec![server];

            // large enough that sending before receiving on both ends would stall
            let mut gather = plan(4 << 20, 2, true);
            gather.gather = true;
            let recorder = run(&mut outbound, &mut inbound, &gather).await.unwrap();
            let report = recorder.finish();
            let stats = report.peer(&peer).unwrap();
            assert_eq!(stats.sample_count(), 2, "{}", transport.kind());
            assert!(stats.samples.iter().all(|s| s.bytes == 8 << 20));
        }
    }

    #[tokio::test]
    async fn test_wrong_payload_size_fails() {
        let transports = all_transports();
        let (_listener, mut outbound, mut inbound) = pair(&transports[0]).await;

        // each side checks after its full round trip, so neither blocks
        let small = plan(10, 1, false);
        let big = plan(20, 1, false);
        let peer = PeerAddress::new("h", 1);
        let (client_result, server_result) = tokio::join!(
            client(outbound.as_mut(), &peer, 0, &small),
            server(inbound.as_mut(), &big),
        );
        assert!(matches!(client_result, Err(Error::PayloadMismatch { .. })));
        assert!(matches!(server_result, Err(Error::PayloadMismatch { .. })));
    }
}
