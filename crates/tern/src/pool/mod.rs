use crate::dedup::{DedupConfig, DedupStats, Deduplicator};
use crate::filter::validate_filters;
use crate::handle::{PoolControl, SubscriptionHandle};
use crate::outbox::{
    FetchPhase, OutboxTracker, RelayMetadata, RelayRanker, RelaySelector, SelectorConfig,
    CONTACT_LIST_KIND, RELAY_LIST_KIND,
};
use crate::publish::{
    PublishAction, PublishConfig, PublishEngine, PublishHandle, PublishShared,
};
use crate::relay::{
    CoordRecv, Recv, RelayCoordinator, RelayLimits, RelayStatus, RelayUrl, SubId,
};
use crate::retry::RetryPolicy;
use crate::storage::{CacheAdapter, PublishStatus};
use crate::subscription::{
    CacheStrategy, EoseTiming, SubState, SubscriptionConfig, SubscriptionStore,
};
use crate::{
    Error, Event, EventId, EventTemplate, Filter, Pubkey, Result, Signer, Wakeup, WakeupHandle,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

#[derive(Clone)]
pub struct PoolConfig {
    /// batch window: subscriptions staged within it share REQ grouping
    pub grouping_delay: Duration,
    pub dedup: DedupConfig,
    pub eose: EoseTiming,
    pub keepalive: Duration,
    pub relay_limits: RelayLimits,
    pub connection_retry: RetryPolicy,
    pub selector: SelectorConfig,
    /// how often persisted unpublished events are revisited
    pub unpublished_retry_interval: Duration,
    /// give up on a relay-list fetch phase after this long
    pub relay_list_fetch_timeout: Duration,
    /// recompute and check event ids on arrival; mismatches are dropped
    pub verify_event_ids: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            grouping_delay: Duration::from_millis(100),
            dedup: DedupConfig {
                // the routing dedup window is much shorter than the
                // standalone deduplicator default
                ttl: Duration::from_secs(5 * 60),
                ..DedupConfig::default()
            },
            eose: EoseTiming::default(),
            keepalive: Duration::from_secs(45),
            relay_limits: RelayLimits::default(),
            connection_retry: RetryPolicy::default(),
            selector: SelectorConfig::default(),
            unpublished_retry_interval: Duration::from_secs(60),
            relay_list_fetch_timeout: Duration::from_secs(30),
            verify_event_ids: true,
        }
    }
}

/// The client core: owns every relay coordinator, the logical
/// subscriptions, the dedup gate, the outbox tables, and the publish
/// engine. Single-owner state; the embedder calls `try_recv` and `drive`
/// from one task (typically on transport wakeups plus a coarse timer),
/// consumers read from handles on any thread.
pub struct Pool {
    config: PoolConfig,
    wakeup: WakeupHandle,
    relays: HashMap<RelayUrl, RelayCoordinator>,
    subs: SubscriptionStore,
    dedup: Deduplicator,
    tracker: OutboxTracker,
    ranker: RelayRanker,
    engine: PublishEngine,
    cache: Option<Box<dyn CacheAdapter>>,
    signer: Option<Arc<dyn Signer>>,
    staged: Vec<SubId>,
    staged_since: Option<Instant>,
    control_tx: Sender<PoolControl>,
    control_rx: Receiver<PoolControl>,
    last_unpublished_pass: Instant,
    last_cleanup: Instant,
}

impl Pool {
    pub fn new<W>(config: PoolConfig, wakeup: W) -> Self
    where
        W: Wakeup,
    {
        let (control_tx, control_rx) = unbounded();
        let tracker = OutboxTracker::new(
            config.selector.blacklist.clone(),
            Duration::from_secs(60 * 60),
        );
        Self {
            dedup: Deduplicator::new(config.dedup),
            tracker,
            ranker: RelayRanker::default(),
            engine: PublishEngine::default(),
            relays: HashMap::new(),
            subs: SubscriptionStore::default(),
            cache: None,
            signer: None,
            staged: Vec::new(),
            staged_since: None,
            control_tx,
            control_rx,
            last_unpublished_pass: Instant::now(),
            last_cleanup: Instant::now(),
            wakeup: WakeupHandle::erase(wakeup),
            config,
        }
    }

    pub fn set_signer(&mut self, signer: Arc<dyn Signer>) {
        self.signer = Some(signer);
    }

    pub fn set_cache(&mut self, cache: Box<dyn CacheAdapter>) {
        self.cache = Some(cache);
    }

    pub fn outbox_tracker(&self) -> &OutboxTracker {
        &self.tracker
    }

    pub fn outbox_tracker_mut(&mut self) -> &mut OutboxTracker {
        &mut self.tracker
    }

    pub fn ranker_mut(&mut self) -> &mut RelayRanker {
        &mut self.ranker
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    // ---- relay management ----

    /// Adds (and starts connecting) a relay. Idempotent per normalized URL.
    pub fn add_relay(&mut self, url: &str) -> Result<RelayUrl> {
        let url = RelayUrl::parse(url)?;
        self.ensure_relay(&url);
        Ok(url)
    }

    pub fn remove_relay(&mut self, url: &RelayUrl) {
        if let Some(mut coordinator) = self.relays.remove(url) {
            coordinator.disconnect();
        }
    }

    pub fn relay_statuses(&self) -> BTreeMap<RelayUrl, RelayStatus> {
        self.relays
            .iter()
            .map(|(url, c)| (url.clone(), c.status()))
            .collect()
    }

    /// Logical subscriptions with a live wire presence on `url`.
    pub fn active_subscription_ids(&self, url: &RelayUrl) -> Vec<SubId> {
        self.relays
            .get(url)
            .map(|c| c.active_subscription_ids())
            .unwrap_or_default()
    }

    /// On-wire REQ count for `url`; grouping keeps this below the logical
    /// subscription count.
    pub fn relay_wire_count(&self, url: &RelayUrl) -> usize {
        self.relays.get(url).map(|c| c.wire_count()).unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    /// Frame/byte counters for one relay connection, across reconnects.
    pub fn relay_counters(&self, url: &RelayUrl) -> crate::relay::ConnCounters {
        self.relays
            .get(url)
            .map(|c| c.counters())
            .unwrap_or_default()
    }

    fn connected_set(&self) -> HashSet<RelayUrl> {
        self.relays
            .iter()
            .filter(|(_, c)| c.is_connected())
            .map(|(url, _)| url.clone())
            .collect()
    }

    fn ensure_relay(&mut self, url: &RelayUrl) -> &mut RelayCoordinator {
        let config = &self.config;
        let wakeup = &self.wakeup;
        self.relays.entry(url.clone()).or_insert_with(|| {
            info!("adding relay {url}");
            let mut coordinator =
                RelayCoordinator::new(url.clone(), config.relay_limits, config.connection_retry);
            coordinator.connect(wakeup);
            coordinator
        })
    }

    // ---- subscribe (C10 entry) ----

    pub fn subscribe(
        &mut self,
        filters: Vec<Filter>,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionHandle> {
        validate_filters(&filters)?;
        let now = Instant::now();
        let strategy = config.strategy;
        let close_on_eose = config.close_on_eose;

        let id = self.subs.create(filters, config, false, now);
        let channel = self
            .subs
            .get(&id)
            .map(|s| s.channel.clone())
            .expect("created just above");
        let handle = SubscriptionHandle::new(id, channel, self.control_tx.clone());

        match strategy {
            CacheStrategy::CacheOnly => {
                self.run_cache_pass(id, now);
                self.emit_eose(id);
                if close_on_eose {
                    self.close_subscription(id);
                }
            }
            CacheStrategy::CacheFirst => {
                self.run_cache_pass(id, now);
                self.stage(id, now);
            }
            CacheStrategy::Parallel => {
                self.stage(id, now);
                self.run_cache_pass(id, now);
            }
            CacheStrategy::RelayOnly => {
                self.stage(id, now);
            }
        }

        Ok(handle)
    }

    /// Replaces a subscription's filters. Running groups get CLOSE+REQ
    /// with the new merge.
    pub fn update_subscription_filters(&mut self, id: SubId, filters: Vec<Filter>) -> Result<()> {
        validate_filters(&filters)?;
        {
            let sub = self.subs.get_mut(&id).ok_or(Error::SubscriptionFailed {
                reason: format!("unknown subscription {id:?}"),
            })?;
            sub.filters = filters;
        }

        let urls: Vec<RelayUrl> = self
            .relays
            .iter()
            .filter(|(_, c)| c.has_member(&id))
            .map(|(url, _)| url.clone())
            .collect();
        for url in urls {
            let Some(coordinator) = self.relays.get_mut(&url) else {
                continue;
            };
            if let Err(e) = coordinator.update_member(&id, &self.subs) {
                warn!("filter update on {url} failed: {e}");
                if let Some(sub) = self.subs.get(&id) {
                    sub.channel.push_error(&e);
                }
            }
        }
        Ok(())
    }

    fn stage(&mut self, id: SubId, now: Instant) {
        self.staged.push(id);
        self.staged_since.get_or_insert(now);
        if self.config.grouping_delay.is_zero() {
            self.flush_staged(now);
        }
    }

    fn run_cache_pass(&mut self, id: SubId, now: Instant) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let Some(sub) = self.subs.get(&id) else {
            return;
        };

        let mut events = Vec::new();
        for filter in &sub.filters {
            match cache.query(filter) {
                Ok(batch) => events.extend(batch),
                Err(e) => {
                    warn!("cache query failed: {e}");
                    sub.channel.push_error(&e);
                }
            }
        }

        // Cache hits are delivered to THIS subscription unconditionally
        // (another subscription's earlier pass must not starve it), but
        // marked seen globally so the relays' copies stop at the gate.
        let mut seen_in_pass: HashSet<EventId> = HashSet::new();
        let mut hit_limit = false;
        if let Some(sub) = self.subs.get_mut(&id) {
            for event in events {
                if !seen_in_pass.insert(event.id) {
                    continue;
                }
                if sub.is_internal {
                    // relay-list knowledge straight into the tracker; no
                    // seen-marking, a fresher copy may still arrive live
                    self.tracker.ingest_event(&event);
                    continue;
                }
                self.dedup.mark_seen(&event.id, None);
                sub.channel.push_event(event);
                sub.event_count += 1;
                sub.eose.on_event(now);
                if sub
                    .config
                    .limit
                    .is_some_and(|limit| sub.event_count >= limit)
                {
                    hit_limit = true;
                    break;
                }
            }
        }
        if hit_limit {
            self.close_subscription(id);
        }
    }

    /// Moves the staged batch onto relays: one selection per subscription,
    /// grouped REQs per relay, EOSE targets pinned.
    #[profiling::function]
    fn flush_staged(&mut self, now: Instant) {
        self.staged_since = None;
        if self.staged.is_empty() {
            return;
        }
        let batch: Vec<SubId> = std::mem::take(&mut self.staged);
        let connected = self.connected_set();
        let mut touched: HashSet<RelayUrl> = HashSet::new();
        let mut fetch_wanted: Vec<Pubkey> = Vec::new();

        for id in batch {
            let Some(sub) = self.subs.get(&id) else {
                continue;
            };
            if !sub.is_live() {
                continue;
            }

            let filters = sub.filters.clone();
            let close_on_eose = sub.config.close_on_eose;
            let pinned = sub.config.relays.clone();
            let is_internal = sub.is_internal;
            let waited = sub.waited_for_outbox;

            let (targets, missing): (Vec<RelayUrl>, Vec<Pubkey>) = match pinned {
                Some(relays) => (relays.into_iter().collect(), Vec::new()),
                None => {
                    let user = self.signer.as_ref().and_then(|s| s.pubkey().ok());
                    let selector =
                        RelaySelector::new(&self.tracker, &self.ranker, &self.config.selector);
                    let selection =
                        selector.select_for_fetching(&filters, user.as_ref(), &connected, now);
                    (selection.relays, selection.missing_relay_info)
                }
            };

            if targets.is_empty() {
                // Nothing to select yet, but the authors' relay lists are
                // being fetched: park instead of failing, and let the
                // fetch completion re-stage us. One wait per
                // subscription; a second empty selection is final.
                if !missing.is_empty() && !is_internal && !waited {
                    debug!("parking sub {id:?} until relay lists arrive");
                    if let Some(sub) = self.subs.get_mut(&id) {
                        sub.waited_for_outbox = true;
                    }
                    for pubkey in &missing {
                        self.tracker.add_waiter(*pubkey, id);
                    }
                    fetch_wanted.extend(missing);
                    continue;
                }

                let err = Error::SubscriptionFailed {
                    reason: "no relays available for subscription".to_owned(),
                };
                if let Some(sub) = self.subs.get(&id) {
                    sub.channel.push_error(&err);
                }
                continue;
            }

            fetch_wanted.extend(missing);

            let mut joined = Vec::new();
            for url in targets {
                let coordinator = self.ensure_relay(&url);
                match coordinator.add_member(id, &filters, close_on_eose) {
                    Ok(()) => {
                        joined.push(url.clone());
                        touched.insert(url);
                    }
                    Err(e) => {
                        warn!("sub {id:?} rejected by {url}: {e}");
                    }
                }
            }

            if let Some(sub) = self.subs.get_mut(&id) {
                sub.eose.set_targets(joined);
                sub.state = SubState::Active;
            }
        }

        for url in touched {
            if let Some(coordinator) = self.relays.get_mut(&url) {
                coordinator.flush();
            }
        }

        if !fetch_wanted.is_empty() {
            self.spawn_relay_list_fetch(fetch_wanted, FetchPhase::RelayList, now);
        }
    }

    /// Pool-owned oneshot fetching authors' relay lists (kind-10002, with
    /// a kind-3 fallback phase). Interest in an author already in flight
    /// coalesces instead of spawning another REQ.
    fn spawn_relay_list_fetch(&mut self, pubkeys: Vec<Pubkey>, phase: FetchPhase, now: Instant) {
        let kind = match phase {
            FetchPhase::RelayList => RELAY_LIST_KIND,
            FetchPhase::ContactList => CONTACT_LIST_KIND,
        };

        let config = SubscriptionConfig {
            strategy: CacheStrategy::CacheFirst,
            close_on_eose: true,
            timeout: Some(self.config.relay_list_fetch_timeout),
            ..SubscriptionConfig::default()
        };
        let id = self.subs.create(Vec::new(), config, true, now);

        let fresh = self
            .tracker
            .begin_fetches(pubkeys.iter(), id, phase);
        if fresh.is_empty() {
            self.subs.remove(&id);
            return;
        }

        let authors: Vec<String> = fresh.iter().map(Pubkey::hex).collect();
        debug!("relay-list fetch {id:?} for {} authors (kind {kind})", authors.len());
        if let Some(sub) = self.subs.get_mut(&id) {
            sub.filters = vec![Filter::new().kinds([kind]).authors(authors)];
        }

        self.run_cache_pass(id, now);
        self.stage(id, now);
    }

    /// Internal fetch finished one phase: escalate kind-10002 misses to
    /// the contact-list fallback, then re-stage every subscription parked
    /// on an author whose fetch has settled. Authors escalated to the
    /// fallback phase are pending again, so their waiters stay parked.
    fn finish_relay_list_fetch(&mut self, id: SubId, now: Instant) {
        let (phase, unresolved) = self.tracker.finish_fetch(id);
        self.close_subscription(id);
        if phase == FetchPhase::RelayList && !unresolved.is_empty() {
            self.spawn_relay_list_fetch(unresolved, FetchPhase::ContactList, now);
        }

        for sub in self.tracker.take_ready_waiters() {
            self.restage_waiter(sub, now);
        }
    }

    /// Re-runs relay selection for a subscription that was parked on
    /// missing outbox data.
    fn restage_waiter(&mut self, id: SubId, now: Instant) {
        let Some(sub) = self.subs.get(&id) else {
            return;
        };
        if !sub.is_live() {
            return;
        }
        debug!("re-staging parked sub {id:?}");
        self.stage(id, now);
    }

    // ---- close / cancel ----

    pub fn close_subscription(&mut self, id: SubId) {
        let Some(sub) = self.subs.get_mut(&id) else {
            return;
        };
        if sub.state == SubState::Closed {
            return;
        }
        trace!("closing subscription {id:?}");
        sub.state = SubState::Closed;
        sub.channel.close();
        let was_internal = sub.is_internal;

        for coordinator in self.relays.values_mut() {
            coordinator.remove_member(&id);
        }
        self.tracker.remove_waiter(&id);
        if was_internal {
            // drop any still-pending fetch markers so a later interest in
            // those authors can retry
            let _ = self.tracker.finish_fetch(id);
        }
        self.subs.remove(&id);
    }

    // ---- publish (C11 entry) ----

    /// Signs with the configured signer (exactly one `sign` call) and
    /// routes via the outbox selector.
    pub fn publish(
        &mut self,
        template: EventTemplate,
        config: PublishConfig,
    ) -> Result<PublishHandle> {
        let signer = self
            .signer
            .clone()
            .ok_or(Error::NotConfigured("signer"))?;
        let pubkey = signer.pubkey()?;
        let unsigned = template.unsigned(pubkey);
        let sig = signer.sign(&unsigned).map_err(|e| Error::SigningFailed {
            reason: e.to_string(),
        })?;
        self.publish_event(unsigned.sign_with(sig), config)
    }

    /// Publishes an already-signed event.
    pub fn publish_event(&mut self, event: Event, config: PublishConfig) -> Result<PublishHandle> {
        if !event.verify_id() {
            return Err(Error::InvalidEventId(event.id.hex()));
        }
        let now = Instant::now();

        let targets: Vec<RelayUrl> = match &config.target_relays {
            Some(relays) => relays.iter().cloned().collect(),
            None => {
                let connected = self.connected_set();
                let selector =
                    RelaySelector::new(&self.tracker, &self.ranker, &self.config.selector);
                let selection = selector.select_for_publishing(&event, &connected, now);
                if !selection.missing_relay_info.is_empty() {
                    self.spawn_relay_list_fetch(
                        selection.missing_relay_info.clone(),
                        FetchPhase::RelayList,
                        now,
                    );
                }
                selection.relays
            }
        };

        debug!("publishing {:?} to {} relays", event.id, targets.len());
        let shared = PublishShared::new();
        let handle = PublishHandle::new(event.id, shared.clone(), self.control_tx.clone());
        let actions = self.engine.begin(event, config, targets, shared, now);
        self.apply_publish_actions(actions);
        Ok(handle)
    }

    pub fn cancel_publish(&mut self, event_id: &EventId) {
        if let Some(finished) = self.engine.cancel(event_id) {
            self.finalize_publish(finished);
        }
    }

    fn apply_publish_actions(&mut self, actions: Vec<PublishAction>) {
        for action in actions {
            match action {
                PublishAction::Send { relay, event } => {
                    self.ensure_relay(&relay).send_event(event);
                }
            }
        }
    }

    fn finalize_publish(&mut self, finished: crate::publish::FinishedPublish) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        match finished.record {
            Some(record) => {
                if let Err(e) = cache.store_unpublished(&record) {
                    warn!("persisting unpublished event failed: {e}");
                }
            }
            None => {
                if let Err(e) = cache.mark_published(&finished.original_id) {
                    trace!("mark_published: {e}");
                }
            }
        }
    }

    /// Background pass over persisted unpublished events: re-sends the
    /// still-pending relay legs of records with no live task.
    fn retry_unpublished(&mut self, now: Instant) {
        let records = match self.cache.as_ref().map(|c| c.list_unpublished()) {
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                warn!("listing unpublished events failed: {e}");
                return;
            }
            None => return,
        };

        for record in records {
            if record.is_fully_published() {
                continue;
            }
            let pending: Vec<RelayUrl> = record.pending_relays().cloned().collect();
            let event = record.event.clone();
            let event_id = event.id;

            if let Some(cache) = self.cache.as_mut() {
                for relay in &pending {
                    if let Err(e) =
                        cache.update_unpublished_status(&event_id, relay, PublishStatus::Pending)
                    {
                        trace!("update_unpublished_status: {e}");
                    }
                }
            }

            debug!("background retry of {event_id:?} on {} relays", pending.len());
            let shared = PublishShared::new();
            let actions = self
                .engine
                .begin(event, PublishConfig::default(), pending, shared, now);
            self.apply_publish_actions(actions);
        }
    }

    // ---- receive path ----

    /// Drains relay sockets, at most `max_events` protocol frames, routing
    /// inbound events through the dedup gate into matching subscriptions.
    #[profiling::function]
    pub fn try_recv(&mut self, max_events: usize) {
        let mut budget = max_events;
        let urls: Vec<RelayUrl> = self.relays.keys().cloned().collect();

        'outer: while budget > 0 {
            let mut received_any = false;

            for url in &urls {
                let recv = match self.relays.get_mut(url) {
                    Some(coordinator) => coordinator.try_recv(),
                    None => continue,
                };
                match recv {
                    Recv::Empty => {}
                    Recv::Consumed => {
                        received_any = true;
                    }
                    Recv::Item(item) => {
                        received_any = true;
                        self.handle_recv(url.clone(), item);
                        budget = budget.saturating_sub(1);
                        if budget == 0 {
                            break 'outer;
                        }
                    }
                }
            }

            if !received_any {
                break;
            }
        }
    }

    fn handle_recv(&mut self, url: RelayUrl, item: CoordRecv) {
        let now = Instant::now();
        match item {
            CoordRecv::Connected { handshake } => {
                self.ranker.update_performance(&url, true, Some(handshake));
                let mut meta: RelayMetadata = self.ranker.metadata_for(&url, now);
                meta.last_connected_at = Some(unix_now());
                self.tracker.update_relay_metadata(&url, &meta);

                // one replay pass per reconnect, re-merged from the
                // members' current (possibly since-optimized) filters
                let replayed = match self.relays.get_mut(&url) {
                    Some(coordinator) => coordinator.replay(&self.subs),
                    None => Vec::new(),
                };
                for id in replayed {
                    if let Some(sub) = self.subs.get_mut(&id) {
                        sub.eose.on_replay(&url);
                    }
                }
            }
            CoordRecv::Disconnected => {
                self.ranker.update_performance(&url, false, None);
                let meta = self.ranker.metadata_for(&url, now);
                self.tracker.update_relay_metadata(&url, &meta);
            }
            CoordRecv::Event { members, event_json } => {
                self.route_event(&url, members, &event_json, now);
            }
            CoordRecv::Eose { members } => {
                for id in members {
                    if let Some(sub) = self.subs.get_mut(&id) {
                        sub.eose.on_eose(&url);
                        if sub.eose.is_complete() {
                            // every leg answered; replays need only the gap
                            sub.since_optimize(unix_now());
                        }
                    }
                    self.check_eose(id, now);
                }
            }
            CoordRecv::SubsClosed { members, message } => {
                let err = Error::SubscriptionFailed {
                    reason: message.clone(),
                };
                for id in members {
                    if let Some(sub) = self.subs.get_mut(&id) {
                        sub.channel.push_error(&err);
                        // the relay will send nothing more; let the EOSE
                        // quorum account for the dead leg
                        sub.eose.on_eose(&url);
                    }
                    self.check_eose(id, now);
                }
            }
            CoordRecv::Ok {
                event_id,
                accepted,
                message,
            } => {
                let Ok(event_id) = EventId::from_hex(&event_id) else {
                    warn!("OK frame from {url} with a bad event id");
                    return;
                };
                self.ranker.update_performance(&url, accepted, None);

                let signer = self.signer.clone();
                let (actions, finished) = self.engine.handle_ok(
                    &url,
                    &event_id,
                    accepted,
                    &message,
                    signer.as_deref(),
                    now,
                );
                self.apply_publish_actions(actions);
                if let Some(finished) = finished {
                    self.finalize_publish(finished);
                }
            }
            CoordRecv::AuthChallenge(challenge) => {
                // NIP-42 handling lives outside the core
                info!("auth challenge from {url}: {challenge}");
            }
            CoordRecv::Count { members, count } => {
                debug!("COUNT {count} from {url} for {members:?}");
            }
        }
    }

    /// The §4.10 routing step: dedup gate, filter match per subscription,
    /// cache save, per-sub limit enforcement.
    #[profiling::function]
    fn route_event(
        &mut self,
        url: &RelayUrl,
        members: Option<Vec<SubId>>,
        event_json: &str,
        now: Instant,
    ) {
        let event = match Event::from_json(event_json) {
            Ok(event) => event,
            Err(e) => {
                warn!("bad event from {url}, dropped: {e}");
                return;
            }
        };

        if self.config.verify_event_ids && !event.verify_id() {
            // counted, then dropped silently
            self.dedup.process(&event.id, Some(url));
            return;
        }

        if !self.dedup.process(&event.id, Some(url)) {
            trace!("duplicate {:?} from {url}", event.id);
            return;
        }

        // relay-list knowledge rides along on any matching stream
        self.tracker.ingest_event(&event);

        let targets = members.unwrap_or_else(|| self.subs.ids());
        let mut delivered = false;
        let mut to_close = Vec::new();

        for id in targets {
            let Some(sub) = self.subs.get_mut(&id) else {
                continue;
            };
            if !sub.is_live() {
                continue;
            }
            if !sub.filters.iter().any(|f| f.matches(&event)) {
                continue;
            }

            sub.eose.on_event(now);
            delivered = true;

            if sub.is_internal {
                continue;
            }

            sub.channel.push_event(event.clone());
            sub.event_count += 1;
            if sub
                .config
                .limit
                .is_some_and(|limit| sub.event_count >= limit)
            {
                debug!("subscription {id:?} reached its event limit");
                to_close.push(id);
            }
        }

        if delivered {
            if let Some(cache) = self.cache.as_mut() {
                if let Err(e) = cache.save(&event) {
                    trace!("cache save rejected {:?}: {e}", event.id);
                }
            }
        }

        for id in to_close {
            self.close_subscription(id);
        }
    }

    fn check_eose(&mut self, id: SubId, now: Instant) {
        let should = self
            .subs
            .get(&id)
            .is_some_and(|sub| sub.is_live() && sub.eose.should_emit(now, &self.config.eose));
        if should {
            self.emit_eose(id);
        }
    }

    /// Sends the consumer-facing EOSE exactly once, then applies
    /// close-on-eose and internal-fetch follow-ups.
    fn emit_eose(&mut self, id: SubId) {
        let now = Instant::now();
        let (is_internal, close_after) = {
            let Some(sub) = self.subs.get_mut(&id) else {
                return;
            };
            if sub.eose.emitted() {
                return;
            }
            sub.eose.mark_emitted();
            sub.state = SubState::EoseSeen;

            if sub.is_internal {
                (true, false)
            } else {
                debug!("EOSE quorum reached for {id:?}");
                sub.channel.push_eose();
                (false, sub.config.close_on_eose)
            }
        };

        if is_internal {
            self.finish_relay_list_fetch(id, now);
        } else if close_after {
            self.close_subscription(id);
        }
    }

    // ---- timers ----

    /// The drive pass: consumer control, the grouping window, partial-EOSE
    /// timeouts, subscription timeouts, publish retries, background
    /// unpublished retries, reconnects and keepalive.
    #[profiling::function]
    pub fn drive(&mut self) {
        let now = Instant::now();

        while let Ok(control) = self.control_rx.try_recv() {
            match control {
                PoolControl::CloseSubscription(id) => self.close_subscription(id),
                PoolControl::CancelPublish(event_id) => self.cancel_publish(&event_id),
            }
        }

        if self
            .staged_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.config.grouping_delay)
        {
            self.flush_staged(now);
        }

        // partial-EOSE and per-subscription timeouts
        let ids = self.subs.ids();
        for id in ids {
            self.check_eose(id, now);

            let timed_out = self.subs.get(&id).is_some_and(|sub| {
                sub.is_live()
                    && sub
                        .config
                        .timeout
                        .is_some_and(|t| now.saturating_duration_since(sub.eose.created_at) > t)
            });
            if timed_out {
                if self.subs.get(&id).is_some_and(|s| s.is_internal) {
                    // a relay-list fetch that never EOSE'd: settle it so
                    // the fallback phase runs and parked waiters wake
                    debug!("relay-list fetch {id:?} timed out");
                    self.finish_relay_list_fetch(id, now);
                    continue;
                }

                let err = Error::Timeout {
                    relay: "subscription".to_owned(),
                    after_ms: self
                        .subs
                        .get(&id)
                        .and_then(|s| s.config.timeout)
                        .map(|t| t.as_millis() as u64)
                        .unwrap_or(0),
                };
                if let Some(sub) = self.subs.get(&id) {
                    sub.channel.push_error(&err);
                }
                self.close_subscription(id);
            }
        }

        let (actions, finished) = self.engine.tick(now);
        self.apply_publish_actions(actions);
        for item in finished {
            self.finalize_publish(item);
        }

        if now.saturating_duration_since(self.last_unpublished_pass)
            >= self.config.unpublished_retry_interval
            && self.engine.is_empty()
        {
            self.last_unpublished_pass = now;
            self.retry_unpublished(now);
        }

        let wakeup = self.wakeup.clone();
        for coordinator in self.relays.values_mut() {
            coordinator.tick(now, self.config.keepalive, &wakeup);
        }

        if now.saturating_duration_since(self.last_cleanup) >= Duration::from_secs(60) {
            self.last_cleanup = now;
            self.dedup.cleanup_expired();
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
