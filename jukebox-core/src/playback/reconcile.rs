//! Time request correlation
//!
//! A follower tags each `getCurrentTimeRequest` with a fresh id and only
//! trusts a `currentTimeResponse` carrying an id it is still waiting for.
//! Matched round trips also feed a small RTT history used to estimate how
//! stale the DJ's reported position is by the time it arrives.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

/// RTT samples kept for averaging
const RTT_SAMPLE_COUNT: usize = 5;

/// One-way latency assumed before anything was measured (ms)
const DEFAULT_ONE_WAY_MS: u64 = 10;

#[derive(Debug, Default)]
pub struct Reconciler {
    pending: HashMap<String, Instant>,
    rtt_samples: Vec<u64>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request; returns the id to send
    pub fn begin_request(&mut self) -> String {
        self.begin_request_at(Instant::now())
    }

    pub fn begin_request_at(&mut self, now: Instant) -> String {
        let request_id = format!("{:016x}", rand::random::<u64>());
        self.pending.insert(request_id.clone(), now);
        request_id
    }

    /// Match a response. Returns the round trip if the id was pending.
    pub fn resolve(&mut self, request_id: &str) -> Option<Duration> {
        self.resolve_at(request_id, Instant::now())
    }

    pub fn resolve_at(&mut self, request_id: &str, now: Instant) -> Option<Duration> {
        let sent_at = self.pending.remove(request_id)?;
        let rtt = now.saturating_duration_since(sent_at);

        if self.rtt_samples.len() >= RTT_SAMPLE_COUNT {
            self.rtt_samples.remove(0);
        }
        self.rtt_samples.push(rtt.as_millis() as u64);
        debug!(
            "Time response {}: RTT={}ms, one-way={}ms",
            request_id,
            rtt.as_millis(),
            self.one_way_latency_ms()
        );
        Some(rtt)
    }

    /// Drop requests sent more than `timeout` before `now`. Returns how
    /// many were abandoned.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, sent_at| now.saturating_duration_since(*sent_at) < timeout);
        before - self.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Half the average round trip of the recent samples
    pub fn one_way_latency_ms(&self) -> u64 {
        if self.rtt_samples.is_empty() {
            return DEFAULT_ONE_WAY_MS;
        }
        let sum: u64 = self.rtt_samples.iter().sum();
        sum / self.rtt_samples.len() as u64 / 2
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.rtt_samples.clear();
    }
}
