//! Subscription lifecycle tests against an offline pool: cache-backed
//! passes, REQ grouping, handle semantics, timeouts. Nothing here needs a
//! live relay; the pinned relay URLs point at a closed local port.

mod common;

use common::{note, pk, relay, MemoryCache, TestSigner, ALICE, BOB};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tern::{
    CacheStrategy, Filter, Pool, PoolConfig, RelayListKind, RelaySource, SelectorConfig,
    SubscriptionConfig, SubscriptionUpdate, WakeupHandle,
};

const UNREACHABLE: &str = "ws://127.0.0.1:9/";

/// A pool with no grouping delay so staged work lands on the first pass.
fn offline_pool() -> Pool {
    let config = PoolConfig {
        grouping_delay: Duration::ZERO,
        ..PoolConfig::default()
    };
    Pool::new(config, WakeupHandle::from_fn(|| {}))
}

fn pinned(strategy: CacheStrategy) -> SubscriptionConfig {
    SubscriptionConfig {
        strategy,
        relays: Some(BTreeSet::from([relay(UNREACHABLE)])),
        ..SubscriptionConfig::default()
    }
}

#[test]
fn cache_only_replays_stored_events_then_eoses() {
    let mut pool = offline_pool();
    let cache = MemoryCache::new();
    cache.insert(note(ALICE, 1, "first", 100));
    cache.insert(note(ALICE, 1, "second", 200));
    cache.insert(note(ALICE, 7, "reaction, must not match", 300));
    pool.set_cache(Box::new(cache));

    let handle = pool
        .subscribe(
            vec![Filter::new().kinds([1])],
            SubscriptionConfig {
                strategy: CacheStrategy::CacheOnly,
                ..SubscriptionConfig::default()
            },
        )
        .expect("subscribe");

    let contents: Vec<String> = std::iter::from_fn(|| handle.try_next())
        .map(|e| e.content)
        .collect();
    assert_eq!(contents, vec!["first", "second"]);
    assert!(handle.wait_for_eose(Some(Duration::from_millis(10))));
}

#[test]
fn second_subscriber_still_sees_cached_events() {
    let mut pool = offline_pool();
    let cache = MemoryCache::new();
    cache.insert(note(ALICE, 1, "shared", 100));
    pool.set_cache(Box::new(cache));

    let config = SubscriptionConfig {
        strategy: CacheStrategy::CacheOnly,
        ..SubscriptionConfig::default()
    };
    let first = pool
        .subscribe(vec![Filter::new().kinds([1])], config.clone())
        .expect("first");
    let second = pool
        .subscribe(vec![Filter::new().kinds([1])], config)
        .expect("second");

    assert_eq!(first.try_next().map(|e| e.content).as_deref(), Some("shared"));
    assert_eq!(
        second.try_next().map(|e| e.content).as_deref(),
        Some("shared"),
        "the dedup gate only applies to relay traffic"
    );
}

/// Subscriptions arriving inside one grouping window share a wire REQ;
/// each member still only sees events matching its own filters.
#[test]
fn same_shape_subscriptions_share_one_wire_req() {
    let config = PoolConfig {
        grouping_delay: Duration::from_millis(40),
        ..PoolConfig::default()
    };
    let mut pool = Pool::new(config, WakeupHandle::from_fn(|| {}));
    let url = relay(UNREACHABLE);

    let subs: Vec<_> = [ALICE, BOB]
        .iter()
        .map(|author| {
            pool.subscribe(
                vec![Filter::new().kinds([1]).authors([*author])],
                pinned(CacheStrategy::RelayOnly),
            )
            .expect("subscribe")
        })
        .collect();

    // still inside the window: nothing on the wire yet
    pool.drive();
    assert_eq!(pool.relay_wire_count(&url), 0);

    std::thread::sleep(Duration::from_millis(60));
    pool.drive();

    assert_eq!(pool.relay_wire_count(&url), 1, "fingerprints group");
    assert_eq!(pool.active_subscription_ids(&url).len(), 2);
    drop(subs);
}

#[test]
fn limited_subscriptions_get_their_own_req() {
    let mut pool = offline_pool();
    let url = relay(UNREACHABLE);

    let _plain = pool
        .subscribe(
            vec![Filter::new().kinds([1]).authors([ALICE])],
            pinned(CacheStrategy::RelayOnly),
        )
        .expect("plain");
    let _limited = pool
        .subscribe(
            vec![Filter::new().kinds([1]).authors([BOB]).limit(5)],
            pinned(CacheStrategy::RelayOnly),
        )
        .expect("limited");
    pool.drive();

    assert_eq!(pool.relay_wire_count(&url), 2, "limits never merge");
}

#[test]
fn dropping_the_handle_closes_the_subscription() {
    let mut pool = offline_pool();
    let handle = pool
        .subscribe(
            vec![Filter::new().kinds([1])],
            pinned(CacheStrategy::RelayOnly),
        )
        .expect("subscribe");
    pool.drive();
    assert_eq!(pool.subscription_count(), 1);

    drop(handle);
    pool.drive();
    assert_eq!(pool.subscription_count(), 0);
    assert_eq!(pool.active_subscription_ids(&relay(UNREACHABLE)), vec![]);
}

#[test]
fn explicit_close_terminates_both_sequences() {
    let mut pool = offline_pool();
    let handle = pool
        .subscribe(
            vec![Filter::new().kinds([1])],
            pinned(CacheStrategy::RelayOnly),
        )
        .expect("subscribe");
    pool.drive();

    handle.close();
    pool.drive();

    assert!(handle.is_closed());
    assert!(handle.try_next().is_none());
    assert!(handle.try_next_update().is_none());
    assert!(!handle.wait_for_eose(Some(Duration::from_millis(5))));
}

#[test]
fn subscription_timeout_yields_an_error_update() {
    let mut pool = offline_pool();
    let handle = pool
        .subscribe(
            vec![Filter::new().kinds([1])],
            SubscriptionConfig {
                timeout: Some(Duration::from_millis(5)),
                relays: Some(BTreeSet::from([relay(UNREACHABLE)])),
                ..SubscriptionConfig::default()
            },
        )
        .expect("subscribe");
    pool.drive();

    std::thread::sleep(Duration::from_millis(20));
    pool.drive();

    let updates: Vec<SubscriptionUpdate> =
        std::iter::from_fn(|| handle.try_next_update()).collect();
    assert!(
        updates
            .iter()
            .any(|u| matches!(u, SubscriptionUpdate::Error(msg) if msg.contains("timeout"))),
        "got {updates:?}"
    );
    assert!(handle.is_closed());
}

#[test]
fn subscriptions_need_at_least_one_nonempty_filter() {
    let mut pool = offline_pool();
    assert!(pool
        .subscribe(vec![], SubscriptionConfig::default())
        .is_err());
    assert!(pool
        .subscribe(vec![Filter::new()], SubscriptionConfig::default())
        .is_err());
}

#[test]
fn unknown_authors_spawn_a_relay_list_fetch() {
    let config = PoolConfig {
        grouping_delay: Duration::ZERO,
        selector: SelectorConfig {
            min_relay_count: 1,
            default_relays: vec![relay(UNREACHABLE)],
            ..SelectorConfig::default()
        },
        ..PoolConfig::default()
    };
    let mut pool = Pool::new(config, WakeupHandle::from_fn(|| {}));
    pool.set_signer(Arc::new(TestSigner::new(ALICE)));

    let _handle = pool
        .subscribe(
            vec![Filter::new().kinds([1]).authors([BOB])],
            SubscriptionConfig {
                strategy: CacheStrategy::RelayOnly,
                ..SubscriptionConfig::default()
            },
        )
        .expect("subscribe");
    pool.drive();

    // the caller's subscription plus the pool-owned kind-10002 fetch
    assert_eq!(pool.subscription_count(), 2);
    assert!(pool.outbox_tracker().has_pending(&pk(BOB)));

    // interest in the same author coalesces: no third subscription
    let _second = pool
        .subscribe(
            vec![Filter::new().kinds([7]).authors([BOB])],
            SubscriptionConfig {
                strategy: CacheStrategy::RelayOnly,
                ..SubscriptionConfig::default()
            },
        )
        .expect("subscribe");
    pool.drive();
    assert_eq!(pool.subscription_count(), 3);
}

/// With no default relays and an unknown author, the subscription has
/// nothing to select. It must park (no error) while the relay-list fetch
/// runs, then re-stage onto the author's relays once they are known.
#[test]
fn parked_subscription_restages_once_relay_lists_arrive() {
    let config = PoolConfig {
        grouping_delay: Duration::ZERO,
        relay_list_fetch_timeout: Duration::from_millis(50),
        selector: SelectorConfig {
            min_relay_count: 1,
            ..SelectorConfig::default()
        },
        ..PoolConfig::default()
    };
    let mut pool = Pool::new(config, WakeupHandle::from_fn(|| {}));

    let handle = pool
        .subscribe(
            vec![Filter::new().kinds([1]).authors([BOB])],
            SubscriptionConfig {
                strategy: CacheStrategy::RelayOnly,
                ..SubscriptionConfig::default()
            },
        )
        .expect("subscribe");
    pool.drive();

    // parked, not failed: the author's relay list is being fetched
    assert!(handle.try_next_update().is_none(), "no error while parked");
    assert!(pool.outbox_tracker().has_pending(&pk(BOB)));

    // the relay list arrives (as if a discovery relay answered)
    let bobs_relay = relay("ws://127.0.0.1:9/bob/");
    pool.outbox_tracker_mut().track(
        pk(BOB),
        vec![bobs_relay.clone()],
        vec![],
        RelaySource::Nip65,
    );

    // the fetch settles; the parked subscription lands on bob's relay
    std::thread::sleep(Duration::from_millis(80));
    pool.drive();

    assert_eq!(pool.active_subscription_ids(&bobs_relay), vec![handle.id()]);
}

/// When the kind-10002 fetch and the contact-list fallback both come up
/// empty, the parked subscription finally gets its failure instead of
/// waiting forever (or looping through more fetches).
#[test]
fn exhausted_relay_list_fetch_fails_the_parked_subscription() {
    let config = PoolConfig {
        grouping_delay: Duration::ZERO,
        relay_list_fetch_timeout: Duration::from_millis(50),
        ..PoolConfig::default()
    };
    let mut pool = Pool::new(config, WakeupHandle::from_fn(|| {}));

    let handle = pool
        .subscribe(
            vec![Filter::new().kinds([1]).authors([BOB])],
            SubscriptionConfig {
                strategy: CacheStrategy::RelayOnly,
                ..SubscriptionConfig::default()
            },
        )
        .expect("subscribe");
    pool.drive();
    assert!(handle.try_next_update().is_none(), "parked, not failed");

    // the kind-10002 phase times out; the contact-list fallback starts
    // and the subscription keeps waiting
    std::thread::sleep(Duration::from_millis(80));
    pool.drive();
    assert!(
        pool.outbox_tracker().has_pending(&pk(BOB)),
        "fallback phase in flight"
    );
    assert!(handle.try_next_update().is_none());

    // the fallback times out too: now the failure is real
    std::thread::sleep(Duration::from_millis(80));
    pool.drive();

    let updates: Vec<SubscriptionUpdate> =
        std::iter::from_fn(|| handle.try_next_update()).collect();
    assert!(
        updates
            .iter()
            .any(|u| matches!(u, SubscriptionUpdate::Error(msg) if msg.contains("no relays"))),
        "got {updates:?}"
    );
}

#[test]
fn known_authors_route_to_their_read_relays() {
    let config = PoolConfig {
        grouping_delay: Duration::ZERO,
        selector: SelectorConfig {
            min_relay_count: 1,
            ..SelectorConfig::default()
        },
        ..PoolConfig::default()
    };
    let mut pool = Pool::new(config, WakeupHandle::from_fn(|| {}));
    let bobs_relay = relay("ws://127.0.0.1:9/bob/");
    pool.outbox_tracker_mut().track(
        pk(BOB),
        vec![bobs_relay.clone()],
        vec![],
        RelaySource::Nip65,
    );
    assert_eq!(
        pool.outbox_tracker()
            .get_relays(&pk(BOB), RelayListKind::Read),
        Some(vec![bobs_relay.clone()])
    );

    let _handle = pool
        .subscribe(
            vec![Filter::new().kinds([1]).authors([BOB])],
            SubscriptionConfig {
                strategy: CacheStrategy::RelayOnly,
                ..SubscriptionConfig::default()
            },
        )
        .expect("subscribe");
    pool.drive();

    assert_eq!(pool.active_subscription_ids(&bobs_relay).len(), 1);
}
