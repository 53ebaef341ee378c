pub mod pow;

use crate::handle::PoolControl;
use crate::relay::RelayUrl;
use crate::retry::{RetryPolicy, RetryState};
use crate::storage::{PublishStatus, UnpublishedEvent};
use crate::{Event, EventId, Signer};

use crossbeam_channel::Sender;
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// the publish as a whole succeeds at this many relay acceptances
    pub min_successful_relays: usize,
    /// highest `pow:` demand the engine will mine for; 0 disables mining
    pub max_pow_difficulty: u32,
    pub retry: RetryPolicy,
    /// per relay, per attempt
    pub relay_timeout: Duration,
    /// overrides the outbox selector entirely
    pub target_relays: Option<BTreeSet<RelayUrl>>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            min_successful_relays: 1,
            max_pow_difficulty: 16,
            retry: RetryPolicy::publishing(),
            relay_timeout: Duration::from_secs(30),
            target_relays: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishResult {
    pub statuses: BTreeMap<RelayUrl, PublishStatus>,
    pub success_count: usize,
    pub failure_count: usize,
    /// difficulty actually mined, when a relay demanded proof-of-work
    pub pow_difficulty: Option<u32>,
    pub succeeded: bool,
}

/// Blocking bridge for the publish outcome.
#[derive(Debug)]
pub struct PublishShared {
    result: Mutex<Option<PublishResult>>,
    ready: Condvar,
}

impl PublishShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn set(&self, result: PublishResult) {
        let mut slot = match self.result.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            *slot = Some(result);
        }
        drop(slot);
        self.ready.notify_all();
    }

    pub fn try_result(&self) -> Option<PublishResult> {
        match self.result.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Option<PublishResult> {
        let mut slot = match self.result.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if slot.is_some() {
                return slot.clone();
            }
            match timeout {
                None => {
                    slot = match self.ready.wait(slot) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                Some(t) => {
                    let (guard, res) = match self.ready.wait_timeout(slot, t) {
                        Ok(pair) => pair,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    slot = guard;
                    if res.timed_out() {
                        return slot.clone();
                    }
                }
            }
        }
    }
}

/// The caller's grip on an in-flight publish.
#[derive(Debug)]
pub struct PublishHandle {
    event_id: EventId,
    shared: Arc<PublishShared>,
    control: Sender<PoolControl>,
}

impl PublishHandle {
    pub(crate) fn new(
        event_id: EventId,
        shared: Arc<PublishShared>,
        control: Sender<PoolControl>,
    ) -> Self {
        Self {
            event_id,
            shared,
            control,
        }
    }

    /// Id of the event as submitted (proof-of-work re-mining may put a
    /// different id on the wire for individual relays).
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Option<PublishResult> {
        self.shared.wait(timeout)
    }

    pub fn try_result(&self) -> Option<PublishResult> {
        self.shared.try_result()
    }

    /// Halts pending per-relay attempts on the next drive pass; relays that
    /// already accepted stay recorded as Succeeded.
    pub fn cancel(&self) {
        let _ = self.control.send(PoolControl::CancelPublish(self.event_id));
    }
}

/// One relay leg of a publish.
struct RelayAttempt {
    status: PublishStatus,
    /// re-mined event for this relay only; None = the task's event
    event_override: Option<Event>,
    sent_at: Option<Instant>,
    retry: RetryState,
    next_retry_at: Option<Instant>,
}

impl RelayAttempt {
    fn current_event<'a>(&'a self, fallback: &'a Event) -> &'a Event {
        self.event_override.as_ref().unwrap_or(fallback)
    }
}

struct PublishTask {
    original_id: EventId,
    event: Event,
    config: PublishConfig,
    relays: BTreeMap<RelayUrl, RelayAttempt>,
    pow_difficulty: Option<u32>,
    shared: Arc<PublishShared>,
}

/// Something the pool must do on the engine's behalf.
pub(crate) enum PublishAction {
    Send { relay: RelayUrl, event: Event },
}

/// A completed publish, ready for result delivery and persistence.
pub(crate) struct FinishedPublish {
    pub original_id: EventId,
    pub result: PublishResult,
    /// Some when at least one relay did not accept: persisted for
    /// background retry until `mark_published`
    pub record: Option<UnpublishedEvent>,
}

/// Tracks every in-flight publish: per-relay OK bookkeeping, rate-limit
/// retries, timeouts, and proof-of-work escalation. The pool owns the
/// sockets; the engine only emits actions.
#[derive(Default)]
pub(crate) struct PublishEngine {
    tasks: HashMap<EventId, PublishTask>,
    /// every wire id version (original + mined) back to the original
    aliases: HashMap<EventId, EventId>,
}

impl PublishEngine {
    pub fn begin(
        &mut self,
        event: Event,
        config: PublishConfig,
        targets: Vec<RelayUrl>,
        shared: Arc<PublishShared>,
        now: Instant,
    ) -> Vec<PublishAction> {
        let original_id = event.id;

        if targets.is_empty() {
            shared.set(PublishResult {
                statuses: BTreeMap::new(),
                success_count: 0,
                failure_count: 0,
                pow_difficulty: None,
                succeeded: false,
            });
            return Vec::new();
        }

        let mut relays = BTreeMap::new();
        let mut actions = Vec::new();
        for relay in targets {
            relays.insert(
                relay.clone(),
                RelayAttempt {
                    status: PublishStatus::Pending,
                    event_override: None,
                    sent_at: Some(now),
                    retry: config.retry.state(),
                    next_retry_at: None,
                },
            );
            actions.push(PublishAction::Send {
                relay,
                event: event.clone(),
            });
        }

        self.aliases.insert(original_id, original_id);
        self.tasks.insert(
            original_id,
            PublishTask {
                original_id,
                event,
                config,
                relays,
                pow_difficulty: None,
                shared,
            },
        );
        actions
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Routes one OK frame. `signer` enables proof-of-work re-signing;
    /// without it a `pow:` demand is a permanent failure.
    pub fn handle_ok(
        &mut self,
        relay: &RelayUrl,
        event_id: &EventId,
        accepted: bool,
        message: &str,
        signer: Option<&dyn Signer>,
        now: Instant,
    ) -> (Vec<PublishAction>, Option<FinishedPublish>) {
        let Some(original) = self.aliases.get(event_id).copied() else {
            return (Vec::new(), None);
        };
        let Some(task) = self.tasks.get_mut(&original) else {
            return (Vec::new(), None);
        };
        let Some(attempt) = task.relays.get_mut(relay) else {
            return (Vec::new(), None);
        };
        if attempt.status.is_terminal() {
            return (Vec::new(), None);
        }

        let mut actions = Vec::new();

        if accepted {
            debug!("{relay} accepted {original:?}");
            attempt.status = PublishStatus::Succeeded;
            attempt.sent_at = None;
        } else if let Some(rest) = message.strip_prefix("pow:") {
            match Self::escalate_pow(task, relay, rest, signer, now) {
                Some((mined_id, action)) => {
                    self.aliases.insert(mined_id, original);
                    actions.push(action);
                }
                None => {
                    if let Some(attempt) = task.relays.get_mut(relay) {
                        attempt.status = PublishStatus::Failed {
                            reason: message.to_owned(),
                        };
                    }
                }
            }
        } else if message.starts_with("rate-limited:") {
            match attempt.retry.next_delay() {
                Some(delay) => {
                    debug!("{relay} rate-limited {original:?}, retry in {delay:?}");
                    attempt.status = PublishStatus::RateLimited;
                    attempt.sent_at = None;
                    attempt.next_retry_at = Some(now + delay);
                }
                None => {
                    attempt.status = PublishStatus::Failed {
                        reason: message.to_owned(),
                    };
                }
            }
        } else {
            // auth-required:, error:, and anything unprefixed are permanent
            warn!("{relay} rejected {original:?}: {message}");
            attempt.status = PublishStatus::Failed {
                reason: message.to_owned(),
            };
            attempt.sent_at = None;
        }

        let finished = self.try_finish(&original);
        (actions, finished)
    }

    fn escalate_pow(
        task: &mut PublishTask,
        relay: &RelayUrl,
        demand: &str,
        signer: Option<&dyn Signer>,
        now: Instant,
    ) -> Option<(EventId, PublishAction)> {
        let difficulty = pow::parse_pow_demand(demand)?;
        if difficulty > task.config.max_pow_difficulty {
            debug!("{relay} demands pow {difficulty}, over budget");
            return None;
        }
        let signer = signer?;

        let attempt = task.relays.get_mut(relay)?;
        let template = attempt.current_event(&task.event).to_template();
        let mined = pow::mine(template, task.event.pubkey, difficulty)?;
        let mined_id = mined.id;
        let sig = match signer.sign(&mined) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("re-signing mined event failed: {e}");
                return None;
            }
        };
        let event = mined.sign_with(sig);

        attempt.status = PublishStatus::NeedsPow { difficulty };
        attempt.event_override = Some(event.clone());
        attempt.sent_at = Some(now);
        task.pow_difficulty = Some(task.pow_difficulty.map_or(difficulty, |d| d.max(difficulty)));

        Some((
            mined_id,
            PublishAction::Send {
                relay: relay.clone(),
                event,
            },
        ))
    }

    /// Timer pass: due rate-limit retries go back out; silent relays time
    /// out and retry until the budget is spent.
    pub fn tick(&mut self, now: Instant) -> (Vec<PublishAction>, Vec<FinishedPublish>) {
        let mut actions = Vec::new();
        let ids: Vec<EventId> = self.tasks.keys().copied().collect();
        let mut finished = Vec::new();

        for id in ids {
            if let Some(task) = self.tasks.get_mut(&id) {
                let timeout = task.config.relay_timeout;
                for (relay, attempt) in task.relays.iter_mut() {
                    if attempt.status.is_terminal() {
                        continue;
                    }

                    if let Some(due) = attempt.next_retry_at {
                        if now >= due {
                            attempt.next_retry_at = None;
                            attempt.sent_at = Some(now);
                            attempt.status = PublishStatus::Pending;
                            actions.push(PublishAction::Send {
                                relay: relay.clone(),
                                event: attempt.current_event(&task.event).clone(),
                            });
                        }
                        continue;
                    }

                    let Some(sent_at) = attempt.sent_at else {
                        continue;
                    };
                    if now.saturating_duration_since(sent_at) < timeout {
                        continue;
                    }

                    // no OK within the window; timeouts are retryable
                    match attempt.retry.next_delay() {
                        Some(delay) => {
                            debug!("{relay} timed out, retry in {delay:?}");
                            attempt.sent_at = None;
                            attempt.next_retry_at = Some(now + delay);
                        }
                        None => {
                            attempt.status = PublishStatus::Failed {
                                reason: "timeout".to_owned(),
                            };
                            attempt.sent_at = None;
                        }
                    }
                }
            }

            if let Some(done) = self.try_finish(&id) {
                finished.push(done);
            }
        }

        (actions, finished)
    }

    /// Cooperative cancellation: pending legs become Cancelled, recorded
    /// successes stay.
    pub fn cancel(&mut self, event_id: &EventId) -> Option<FinishedPublish> {
        let original = self.aliases.get(event_id).copied()?;
        let task = self.tasks.get_mut(&original)?;
        for attempt in task.relays.values_mut() {
            if !attempt.status.is_terminal() {
                attempt.status = PublishStatus::Cancelled;
                attempt.sent_at = None;
                attempt.next_retry_at = None;
                attempt.retry.cancel();
            }
        }
        self.try_finish(&original)
    }

    fn try_finish(&mut self, original: &EventId) -> Option<FinishedPublish> {
        let task = self.tasks.get(original)?;
        if !task.relays.values().all(|a| a.status.is_terminal()) {
            return None;
        }

        let task = self.tasks.remove(original)?;
        self.aliases.retain(|_, v| v != original);

        let statuses: BTreeMap<RelayUrl, PublishStatus> = task
            .relays
            .iter()
            .map(|(url, attempt)| (url.clone(), attempt.status.clone()))
            .collect();
        let success_count = statuses
            .values()
            .filter(|s| **s == PublishStatus::Succeeded)
            .count();
        let failure_count = statuses.len() - success_count;

        let result = PublishResult {
            succeeded: success_count >= task.config.min_successful_relays,
            success_count,
            failure_count,
            pow_difficulty: task.pow_difficulty,
            statuses: statuses.clone(),
        };

        let record = (failure_count > 0).then(|| UnpublishedEvent {
            event: task.event.clone(),
            target_relays: task.relays.keys().cloned().collect(),
            statuses,
            created_at: unix_now(),
            attempts: task
                .relays
                .values()
                .map(|a| a.retry.attempts())
                .max()
                .unwrap_or(0),
        });

        task.shared.set(result.clone());
        Some(FinishedPublish {
            original_id: task.original_id,
            result,
            record,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTemplate;
    use crate::test_utils::StubSigner;
    use crate::Pubkey;

    const PK: &str = "379e863e8357163b5bce5d2688dc4f1dcc2d505222fb8d74db600f30535dfdfe";

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).expect("url")
    }

    fn event() -> Event {
        EventTemplate::new(1, "publish me", 1_700_000_000)
            .unsigned(Pubkey::from_hex(PK).expect("pk"))
            .sign_with("00".repeat(64))
    }

    fn start(
        engine: &mut PublishEngine,
        targets: &[&str],
        config: PublishConfig,
    ) -> (Event, Arc<PublishShared>) {
        let ev = event();
        let shared = PublishShared::new();
        let actions = engine.begin(
            ev.clone(),
            config,
            targets.iter().map(|u| url(u)).collect(),
            shared.clone(),
            Instant::now(),
        );
        assert_eq!(actions.len(), targets.len());
        (ev, shared)
    }

    #[test]
    fn all_accepts_mean_success() {
        let mut engine = PublishEngine::default();
        let (ev, shared) = start(
            &mut engine,
            &["wss://r1.example.com", "wss://r2.example.com"],
            PublishConfig::default(),
        );

        let now = Instant::now();
        let (_, fin) =
            engine.handle_ok(&url("wss://r1.example.com"), &ev.id, true, "", None, now);
        assert!(fin.is_none(), "one relay still pending");

        let (_, fin) =
            engine.handle_ok(&url("wss://r2.example.com"), &ev.id, true, "", None, now);
        let fin = fin.expect("finished");

        assert!(fin.result.succeeded);
        assert_eq!(fin.result.success_count, 2);
        assert_eq!(fin.result.failure_count, 0);
        assert!(fin.record.is_none(), "fully published, nothing to persist");
        assert!(shared.try_result().expect("result").succeeded);
        assert!(engine.is_empty());
    }

    #[test]
    fn permanent_rejection_fails_that_relay() {
        let mut engine = PublishEngine::default();
        let (ev, _shared) = start(
            &mut engine,
            &["wss://r1.example.com", "wss://r2.example.com"],
            PublishConfig::default(),
        );

        let now = Instant::now();
        engine.handle_ok(&url("wss://r1.example.com"), &ev.id, true, "", None, now);
        let (_, fin) = engine.handle_ok(
            &url("wss://r2.example.com"),
            &ev.id,
            false,
            "error: blocked",
            None,
            now,
        );
        let fin = fin.expect("finished");

        assert!(fin.result.succeeded, "min_successful_relays=1 is met");
        assert_eq!(fin.result.failure_count, 1);
        let record = fin.record.expect("partial failure persists");
        assert_eq!(record.pending_relays().count(), 1);
        assert!(matches!(
            record.statuses.get(&url("wss://r2.example.com")),
            Some(PublishStatus::Failed { .. })
        ));
    }

    #[test]
    fn pow_demand_mines_resigns_and_resends() {
        let mut engine = PublishEngine::default();
        let (ev, _shared) = start(
            &mut engine,
            &["wss://r1.example.com"],
            PublishConfig::default(),
        );
        let signer = StubSigner::new(PK);

        let now = Instant::now();
        let (actions, fin) = engine.handle_ok(
            &url("wss://r1.example.com"),
            &ev.id,
            false,
            "pow: difficulty 8 required",
            Some(&signer),
            now,
        );
        assert!(fin.is_none());

        let [PublishAction::Send { relay, event: mined }] = actions.as_slice() else {
            panic!("expected one resend");
        };
        assert_eq!(relay, &url("wss://r1.example.com"));
        assert_ne!(mined.id, ev.id, "mining changes the id");
        assert!(mined.id.pow_difficulty() >= 8);
        assert!(mined.verify_id());

        // the relay now accepts the mined id
        let (_, fin) = engine.handle_ok(
            &url("wss://r1.example.com"),
            &mined.id,
            true,
            "",
            Some(&signer),
            now,
        );
        let fin = fin.expect("finished");
        assert!(fin.result.succeeded);
        assert_eq!(fin.result.pow_difficulty, Some(8));
    }

    #[test]
    fn pow_over_budget_fails() {
        let mut engine = PublishEngine::default();
        let config = PublishConfig {
            max_pow_difficulty: 4,
            ..Default::default()
        };
        let (ev, _shared) = start(&mut engine, &["wss://r1.example.com"], config);
        let signer = StubSigner::new(PK);

        let (actions, fin) = engine.handle_ok(
            &url("wss://r1.example.com"),
            &ev.id,
            false,
            "pow: difficulty 30 required",
            Some(&signer),
            Instant::now(),
        );
        assert!(actions.is_empty());
        let fin = fin.expect("finished");
        assert!(!fin.result.succeeded);
    }

    #[test]
    fn rate_limit_schedules_a_retry() {
        let mut engine = PublishEngine::default();
        let (ev, _shared) = start(
            &mut engine,
            &["wss://r1.example.com"],
            PublishConfig::default(),
        );

        let t0 = Instant::now();
        let (actions, fin) = engine.handle_ok(
            &url("wss://r1.example.com"),
            &ev.id,
            false,
            "rate-limited: slow down",
            None,
            t0,
        );
        assert!(actions.is_empty());
        assert!(fin.is_none(), "rate-limited is not terminal");

        // well past any jittered first delay
        let (actions, finished) = engine.tick(t0 + Duration::from_secs(120));
        assert_eq!(actions.len(), 1, "the retry goes back out");
        assert!(finished.is_empty());
    }

    #[test]
    fn timeouts_retry_then_fail() {
        let mut engine = PublishEngine::default();
        let config = PublishConfig {
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                multiplier: 1.0,
                max_attempts: Some(1),
                jitter: 0.0,
            },
            relay_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (_ev, shared) = start(&mut engine, &["wss://r1.example.com"], config);

        let t0 = Instant::now();
        // first timeout: consumes the single retry
        let (actions, finished) = engine.tick(t0 + Duration::from_millis(60));
        assert!(actions.is_empty(), "retry is scheduled, not immediate");
        assert!(finished.is_empty());

        // the retry goes out
        let (actions, _) = engine.tick(t0 + Duration::from_millis(80));
        assert_eq!(actions.len(), 1);

        // second timeout: budget spent, the leg fails
        let (_, finished) = engine.tick(t0 + Duration::from_millis(200));
        assert_eq!(finished.len(), 1);
        let result = shared.try_result().expect("result");
        assert!(!result.succeeded);
        assert!(matches!(
            result.statuses.values().next(),
            Some(PublishStatus::Failed { reason }) if reason == "timeout"
        ));
    }

    #[test]
    fn cancel_marks_pending_legs_cancelled() {
        let mut engine = PublishEngine::default();
        let (ev, shared) = start(
            &mut engine,
            &["wss://r1.example.com", "wss://r2.example.com"],
            PublishConfig::default(),
        );

        let now = Instant::now();
        engine.handle_ok(&url("wss://r1.example.com"), &ev.id, true, "", None, now);
        let fin = engine.cancel(&ev.id).expect("finished");

        assert_eq!(fin.result.success_count, 1);
        assert!(matches!(
            fin.result.statuses.get(&url("wss://r2.example.com")),
            Some(PublishStatus::Cancelled)
        ));
        assert!(shared.try_result().is_some());
    }

    #[test]
    fn empty_target_set_fails_immediately() {
        let mut engine = PublishEngine::default();
        let shared = PublishShared::new();
        let actions = engine.begin(
            event(),
            PublishConfig::default(),
            Vec::new(),
            shared.clone(),
            Instant::now(),
        );
        assert!(actions.is_empty());
        assert!(!shared.try_result().expect("result").succeeded);
    }
}
