//! tern is the core of an outbox-model nostr client: a pool of websocket
//! relay connections, logical subscriptions multiplexed onto merged REQs,
//! NIP-65 routing for publishes and fetches, and at-most-once event
//! delivery through a TTL'd dedup gate.
//!
//! The pool is poll-driven: the transport signals readiness through
//! [`Wakeup`], the embedder calls [`Pool::try_recv`] and [`Pool::drive`]
//! from one task, and consumers iterate subscription handles from any
//! thread.

mod client;
mod dedup;
mod error;
mod event;
mod filter;
mod handle;
mod lru;
mod outbox;
mod pool;
mod pubkey;
mod publish;
mod relay;
mod retry;
mod signer;
mod storage;
mod subscription;

#[cfg(test)]
mod test_utils;

pub use client::{ClientMessage, EventClientMessage};
pub use dedup::{DedupConfig, DedupStats, Deduplicator};
pub use error::{Error, ErrorCategory};
pub use event::{compute_id, Event, EventId, EventTemplate, UnsignedEvent};
pub use filter::{Filter, GroupFingerprint, TagKey};
pub use handle::{SubscriptionHandle, SubscriptionUpdate};
pub use lru::{CacheStats, TtlCache};
pub use outbox::{
    OutboxTracker, RankWeights, RelayInfo, RelayListKind, RelayMetadata, RelayRanker,
    RelaySelector, RelaySource, Selection, SelectionMethod, SelectorConfig,
};
pub use pool::{Pool, PoolConfig};
pub use pubkey::Pubkey;
pub use publish::{PublishConfig, PublishHandle, PublishResult};
pub use relay::message::{RelayEvent, RelayMessage};
pub use relay::{ConnCounters, RelayLimits, RelayStatus, RelayUrl, SubId, WebsocketConn};
pub use retry::{RetryPolicy, RetryState};
pub use signer::{EncryptionScheme, Signer};
pub use storage::{CacheAdapter, PublishStatus, UnpublishedEvent};
pub use subscription::{CacheStrategy, EoseTiming, SubState, SubscriptionConfig};

use std::sync::Arc;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the transport tells the embedder that input is waiting. Typically
/// wired to an event-loop repaint or a channel poke.
pub trait Wakeup: Send + Sync + Clone + 'static {
    fn wake(&self);
}

/// Type-erased [`Wakeup`] the pool stores and clones into every
/// connection.
#[derive(Clone)]
pub struct WakeupHandle(Arc<dyn Fn() + Send + Sync>);

impl WakeupHandle {
    pub fn erase<W>(wakeup: W) -> Self
    where
        W: Wakeup,
    {
        WakeupHandle(Arc::new(move || wakeup.wake()))
    }

    /// Adapts a plain closure, the common embedder case (e.g. a repaint
    /// request).
    pub fn from_fn(f: impl Fn() + Send + Sync + 'static) -> Self {
        WakeupHandle(Arc::new(f))
    }
}

impl Wakeup for WakeupHandle {
    fn wake(&self) {
        (self.0)()
    }
}
