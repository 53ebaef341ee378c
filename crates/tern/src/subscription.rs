use crate::handle::SubChannel;
use crate::relay::{RelayUrl, SubId};
use crate::Filter;

use hashbrown::HashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a subscription's answers come from, and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// local cache only; EOSE right after the cache pass, relays untouched
    CacheOnly,
    /// cache pass first, then relay fan-out
    #[default]
    CacheFirst,
    /// cache pass and relay fan-out start together. With a synchronous
    /// adapter the cache pass still completes inline; the variant keeps the
    /// contract that REQs need not wait for it.
    Parallel,
    /// relays only
    RelayOnly,
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub strategy: CacheStrategy,
    /// close the whole subscription when its EOSE quorum fires
    pub close_on_eose: bool,
    /// hard cap on delivered events; the subscription closes at the cap
    pub limit: Option<usize>,
    pub timeout: Option<Duration>,
    /// pinned relay set; None = ask the selector
    pub relays: Option<BTreeSet<RelayUrl>>,
    pub channel_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::default(),
            close_on_eose: false,
            limit: None,
            timeout: None,
            relays: None,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    /// staged inside the grouping window, no REQs out yet
    Pending,
    Active,
    EoseSeen,
    Closed,
}

/// Tracks which target relays answered EOSE for one subscription and
/// decides when the consumer-facing EOSE fires.
#[derive(Debug, Clone)]
pub struct EoseTracker {
    target_relays: BTreeSet<RelayUrl>,
    eosed_relays: BTreeSet<RelayUrl>,
    pub last_event_at: Instant,
    pub created_at: Instant,
    emitted: bool,
}

impl EoseTracker {
    pub fn new(created_at: Instant) -> Self {
        Self {
            target_relays: BTreeSet::new(),
            eosed_relays: BTreeSet::new(),
            last_event_at: created_at,
            created_at,
            emitted: false,
        }
    }

    pub fn set_targets(&mut self, targets: impl IntoIterator<Item = RelayUrl>) {
        self.target_relays = targets.into_iter().collect();
    }

    pub fn targets(&self) -> &BTreeSet<RelayUrl> {
        &self.target_relays
    }

    pub fn on_event(&mut self, now: Instant) {
        self.last_event_at = now;
    }

    pub fn on_eose(&mut self, relay: &RelayUrl) {
        if self.target_relays.contains(relay) {
            self.eosed_relays.insert(relay.clone());
        }
    }

    /// A reconnected relay streams history again; its EOSE counts anew.
    pub fn on_replay(&mut self, relay: &RelayUrl) {
        self.eosed_relays.remove(relay);
    }

    pub fn is_complete(&self) -> bool {
        !self.target_relays.is_empty() && self.eosed_relays.len() == self.target_relays.len()
    }

    /// Full quorum, or the partial-EOSE escape hatch: enough relays done,
    /// the stream quiet, and the subscription old enough that we're not
    /// racing its own setup.
    pub fn should_emit(&self, now: Instant, params: &EoseTiming) -> bool {
        if self.emitted {
            return false;
        }
        if self.is_complete() {
            return true;
        }
        if self.target_relays.is_empty() {
            return false;
        }

        let ratio = self.eosed_relays.len() as f64 / self.target_relays.len() as f64;
        ratio >= params.ratio
            && now.saturating_duration_since(self.last_event_at) >= params.quiet
            && now.saturating_duration_since(self.created_at) >= params.min_age
    }

    pub fn mark_emitted(&mut self) {
        self.emitted = true;
    }

    pub fn emitted(&self) -> bool {
        self.emitted
    }
}

/// Partial-EOSE emission constants; see `PoolConfig`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EoseTiming {
    pub ratio: f64,
    pub quiet: Duration,
    pub min_age: Duration,
}

impl Default for EoseTiming {
    fn default() -> Self {
        Self {
            ratio: 0.5,
            quiet: Duration::from_millis(20),
            min_age: Duration::from_millis(100),
        }
    }
}

/// One logical subscription, owned by the pool. Consumers only ever see
/// the channel through a handle.
pub struct Subscription {
    pub id: SubId,
    pub filters: Vec<Filter>,
    pub config: SubscriptionConfig,
    pub state: SubState,
    pub channel: Arc<SubChannel>,
    pub eose: EoseTracker,
    pub event_count: usize,
    /// pool-owned housekeeping subscription (relay-list fetches); no
    /// consumer on the other side
    pub is_internal: bool,
    /// already parked once waiting for author relay lists; a second empty
    /// selection is a real failure, not another wait
    pub waited_for_outbox: bool,
}

impl Subscription {
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            SubState::Pending | SubState::Active | SubState::EoseSeen
        )
    }

    /// Once every relay leg has reached EOSE, tighten `since` so a later
    /// reconnect replays only the gap instead of the full history.
    pub fn since_optimize(&mut self, now_unix: u64) {
        if self.config.close_on_eose {
            return;
        }
        for filter in &mut self.filters {
            if filter.until.is_some_and(|u| u < now_unix) {
                continue;
            }
            filter.since = Some(filter.since.map_or(now_unix, |s| s.max(now_unix)));
        }
    }
}

/// The pool's subscription table; also the filter lookup coordinators use
/// when re-merging a group.
#[derive(Default)]
pub struct SubscriptionStore {
    subs: HashMap<SubId, Subscription>,
    next_id: u64,
}

impl SubscriptionStore {
    pub fn create(
        &mut self,
        filters: Vec<Filter>,
        config: SubscriptionConfig,
        is_internal: bool,
        now: Instant,
    ) -> SubId {
        let id = SubId(self.next_id);
        self.next_id += 1;

        let channel = SubChannel::new(config.channel_capacity);
        self.subs.insert(
            id,
            Subscription {
                id,
                filters,
                config,
                state: SubState::Pending,
                channel,
                eose: EoseTracker::new(now),
                event_count: 0,
                is_internal,
                waited_for_outbox: false,
            },
        );
        id
    }

    pub fn get(&self, id: &SubId) -> Option<&Subscription> {
        self.subs.get(id)
    }

    pub fn get_mut(&mut self, id: &SubId) -> Option<&mut Subscription> {
        self.subs.get_mut(id)
    }

    pub fn filters(&self, id: &SubId) -> Option<&[Filter]> {
        self.subs.get(id).map(|s| s.filters.as_slice())
    }

    pub fn remove(&mut self, id: &SubId) -> Option<Subscription> {
        self.subs.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subscription> {
        self.subs.values_mut()
    }

    pub fn ids(&self) -> Vec<SubId> {
        self.subs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}
