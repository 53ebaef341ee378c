use crate::relay::RelayUrl;

use hashbrown::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Weights of the scoring terms. They need not sum to 1; scores are only
/// compared against each other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankWeights {
    /// reward for relays we already hold a connection to
    pub connected_bonus: f64,
    pub health: f64,
    pub coverage: f64,
    pub latency: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            connected_bonus: 0.3,
            health: 1.0,
            coverage: 1.0,
            latency: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
struct PerfRecord {
    successes: u32,
    failures: u32,
    /// exponentially-weighted average response time
    avg_response: Option<Duration>,
    last_sample_at: Instant,
}

/// Inputs that vary per ranking call: which relays are live right now, and
/// how many of the wanted authors each candidate serves.
#[derive(Debug, Default)]
pub struct RankContext {
    pub connected: HashSet<RelayUrl>,
    pub coverage: HashMap<RelayUrl, usize>,
    pub author_count: usize,
}

/// Scores candidate relays for a goal. Health is a rolling success ratio
/// that decays linearly as samples age; latency is the inverse of average
/// response time, clamped.
pub struct RelayRanker {
    perf: HashMap<RelayUrl, PerfRecord>,
    weights: RankWeights,
    /// health reaches zero when the newest sample is this old
    decay_window: Duration,
}

impl Default for RelayRanker {
    fn default() -> Self {
        Self::new(RankWeights::default(), Duration::from_secs(30 * 60))
    }
}

/// Response times at or above this score zero on the latency term.
const LATENCY_CEILING: Duration = Duration::from_secs(2);

impl RelayRanker {
    pub fn new(weights: RankWeights, decay_window: Duration) -> Self {
        Self {
            perf: HashMap::new(),
            weights,
            decay_window,
        }
    }

    /// Records the outcome of one interaction with `url`.
    pub fn update_performance(
        &mut self,
        url: &RelayUrl,
        success: bool,
        response_time: Option<Duration>,
    ) {
        let record = self
            .perf
            .entry(url.clone())
            .or_insert_with(|| PerfRecord {
                successes: 0,
                failures: 0,
                avg_response: None,
                last_sample_at: Instant::now(),
            });

        if success {
            record.successes = record.successes.saturating_add(1);
        } else {
            record.failures = record.failures.saturating_add(1);
        }
        record.last_sample_at = Instant::now();

        if let Some(rt) = response_time {
            record.avg_response = Some(match record.avg_response {
                None => rt,
                Some(avg) => (avg * 3 + rt) / 4,
            });
        }
    }

    /// Success ratio with linear recency decay; unknown relays sit at a
    /// neutral 0.5 so fresh relays aren't starved.
    pub fn health(&self, url: &RelayUrl, now: Instant) -> f64 {
        let Some(record) = self.perf.get(url) else {
            return 0.5;
        };

        let total = record.successes + record.failures;
        if total == 0 {
            return 0.5;
        }
        let ratio = f64::from(record.successes) / f64::from(total);

        let age = now.saturating_duration_since(record.last_sample_at);
        let freshness =
            1.0 - (age.as_secs_f64() / self.decay_window.as_secs_f64()).clamp(0.0, 1.0);

        // stale knowledge fades back toward neutral, not toward zero
        0.5 + (ratio - 0.5) * freshness
    }

    fn latency_score(&self, url: &RelayUrl) -> f64 {
        let Some(rt) = self.perf.get(url).and_then(|r| r.avg_response) else {
            return 0.5;
        };
        1.0 - (rt.as_secs_f64() / LATENCY_CEILING.as_secs_f64()).clamp(0.0, 1.0)
    }

    /// Telemetry snapshot in tracker form, merged into outbox entries
    /// whenever a relay's connection state changes.
    pub fn metadata_for(&self, url: &RelayUrl, now: Instant) -> crate::outbox::RelayMetadata {
        let record = self.perf.get(url);
        crate::outbox::RelayMetadata {
            score: self.health(url, now),
            last_connected_at: None,
            avg_response_time: record.and_then(|r| r.avg_response),
            failure_count: record.map(|r| r.failures).unwrap_or(0),
            auth_required: false,
            payment_required: false,
        }
    }

    pub fn score(&self, url: &RelayUrl, ctx: &RankContext, now: Instant) -> f64 {
        let connected = if ctx.connected.contains(url) { 1.0 } else { 0.0 };
        let coverage = if ctx.author_count == 0 {
            0.0
        } else {
            ctx.coverage.get(url).copied().unwrap_or(0) as f64 / ctx.author_count as f64
        };

        self.weights.connected_bonus * connected
            + self.weights.health * self.health(url, now)
            + self.weights.coverage * coverage
            + self.weights.latency * self.latency_score(url)
    }

    /// Candidates ordered best-first, ties broken by URL so the order is
    /// deterministic.
    pub fn rank(
        &self,
        candidates: impl IntoIterator<Item = RelayUrl>,
        ctx: &RankContext,
        now: Instant,
    ) -> Vec<(RelayUrl, f64)> {
        let mut scored: Vec<(RelayUrl, f64)> = candidates
            .into_iter()
            .map(|url| {
                let score = self.score(&url, ctx, now);
                (url, score)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
    }
}
