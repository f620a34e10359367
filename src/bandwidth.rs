//! Bandwidth samples and per-peer summaries
//!
//! The exchange records one sample per client iteration per peer. Once the
//! exchange is over the recorder is consumed into a [`BandwidthReport`],
//! so nothing can be added while results are being read.

use std::collections::BTreeMap;
use std::time::Duration;

use bytesize::ByteSize;
use serde::Serialize;

use crate::protocol::PeerAddress;

/// Shortest duration a rate is computed over (one nanosecond, the clock resolution)
const MIN_ELAPSED_SECS: f64 = 1e-9;

/// One timed round trip
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BandwidthSample {
    /// Payload bytes moved in both directions
    pub bytes: u64,
    pub elapsed_secs: f64,
    /// Bytes per second
    pub rate: f64,
}

impl BandwidthSample {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64().max(MIN_ELAPSED_SECS);
        Self {
            bytes,
            elapsed_secs: elapsed.as_secs_f64(),
            rate: bytes as f64 / secs,
        }
    }
}

/// Collects samples per peer during the exchange
#[derive(Debug, Default)]
pub struct BandwidthRecorder {
    samples: BTreeMap<PeerAddress, Vec<BandwidthSample>>,
}

impl BandwidthRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer` appear in the report even if it never records a sample
    pub fn register(&mut self, peer: &PeerAddress) {
        self.samples.entry(peer.clone()).or_default();
    }

    pub fn record(&mut self, peer: &PeerAddress, sample: BandwidthSample) {
        self.samples.entry(peer.clone()).or_default().push(sample);
    }

    pub fn finish(self) -> BandwidthReport {
        BandwidthReport {
            peers: self
                .samples
                .into_iter()
                .map(|(peer, samples)| PeerStats::new(peer, samples))
                .collect(),
        }
    }
}

/// Summary for one peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub peer: PeerAddress,
    pub samples: Vec<BandwidthSample>,
    pub total_bytes: u64,
    pub mean_rate: f64,
    pub median_rate: f64,
}

impl PeerStats {
    fn new(peer: PeerAddress, samples: Vec<BandwidthSample>) -> Self {
        let total_bytes = samples.iter().map(|s| s.bytes).sum();
        let rates: Vec<f64> = samples.iter().map(|s| s.rate).collect();
        Self {
            peer,
            total_bytes,
            mean_rate: mean(&rates),
            median_rate: median(&rates),
            samples,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Per-peer statistics for a finished exchange
#[derive(Debug, Clone, Default, Serialize)]
pub struct BandwidthReport {
    pub peers: Vec<PeerStats>,
}

impl BandwidthReport {
    pub fn peer(&self, addr: &PeerAddress) -> Option<&PeerStats> {
        self.peers.iter().find(|p| &p.peer == addr)
    }

    pub fn total_bytes(&self) -> u64 {
        self.peers.iter().map(|p| p.total_bytes).sum()
    }

    /// One human-readable line per peer, tagged with the local listen port
    pub fn summary_lines(&self, local_port: u16) -> Vec<String> {
        self.peers
            .iter()
            .map(|p| {
                format!(
                    "[{}, {}] Transferred bytes: {}, average bandwidth: {}/s, median bandwidth: {}/s",
                    local_port,
                    p.peer,
                    format_bytes(p.total_bytes as f64),
                    format_bytes(p.mean_rate),
                    format_bytes(p.median_rate),
                )
            })
            .collect()
    }
}

/// Binary-unit rendering (KiB, MiB, ...)
pub fn format_bytes(value: f64) -> String {
    if !value.is_finite() || value < 0.0 {
        return format!("{}", value);
    }
    ByteSize::b(value.round() as u64).to_string_as(true)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
