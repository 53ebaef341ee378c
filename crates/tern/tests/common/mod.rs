//! Shared fixtures for integration tests: an in-memory cache adapter, a
//! deterministic signer, and event builders.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tern::{
    CacheAdapter, EncryptionScheme, Event, EventId, EventTemplate, Filter, Pubkey, PublishStatus,
    RelayUrl, Result, Signer, UnsignedEvent, UnpublishedEvent,
};

pub const ALICE: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const BOB: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

pub fn pk(hex: &str) -> Pubkey {
    Pubkey::from_hex(hex).expect("test pubkey")
}

pub fn relay(url: &str) -> RelayUrl {
    RelayUrl::parse(url).expect("test relay url")
}

/// A signed note; signatures are opaque to the core, so a fake one works.
pub fn note(author: &str, kind: u16, content: &str, created_at: u64) -> Event {
    EventTemplate::new(kind, content, created_at)
        .unsigned(pk(author))
        .sign_with("00".repeat(64))
}

#[derive(Default)]
struct CacheState {
    events: Vec<Event>,
    unpublished: BTreeMap<EventId, UnpublishedEvent>,
}

/// In-memory cache adapter; clones share state so tests can inspect what
/// the pool persisted.
#[derive(Clone, Default)]
pub struct MemoryCache {
    state: Arc<Mutex<CacheState>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, event: Event) {
        self.state.lock().expect("cache lock").events.push(event);
    }

    pub fn unpublished_ids(&self) -> Vec<EventId> {
        self.state
            .lock()
            .expect("cache lock")
            .unpublished
            .keys()
            .copied()
            .collect()
    }
}

impl CacheAdapter for MemoryCache {
    fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        let state = self.state.lock().expect("cache lock");
        Ok(state
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    fn save(&mut self, event: &Event) -> Result<()> {
        let mut state = self.state.lock().expect("cache lock");
        if !state.events.iter().any(|e| e.id == event.id) {
            state.events.push(event.clone());
        }
        Ok(())
    }

    fn store_unpublished(&mut self, unpublished: &UnpublishedEvent) -> Result<()> {
        self.state
            .lock()
            .expect("cache lock")
            .unpublished
            .insert(unpublished.event.id, unpublished.clone());
        Ok(())
    }

    fn update_unpublished_status(
        &mut self,
        event_id: &EventId,
        relay: &RelayUrl,
        status: PublishStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("cache lock");
        if let Some(record) = state.unpublished.get_mut(event_id) {
            record.statuses.insert(relay.clone(), status);
        }
        Ok(())
    }

    fn list_unpublished(&self) -> Result<Vec<UnpublishedEvent>> {
        Ok(self
            .state
            .lock()
            .expect("cache lock")
            .unpublished
            .values()
            .cloned()
            .collect())
    }

    fn mark_published(&mut self, event_id: &EventId) -> Result<()> {
        self.state
            .lock()
            .expect("cache lock")
            .unpublished
            .remove(event_id);
        Ok(())
    }
}

/// Deterministic signer over a fixed pubkey; signatures are fake but
/// structurally valid.
pub struct TestSigner {
    pubkey: Pubkey,
}

impl TestSigner {
    pub fn new(pubkey_hex: &str) -> Self {
        Self {
            pubkey: pk(pubkey_hex),
        }
    }
}

impl Signer for TestSigner {
    fn pubkey(&self) -> Result<Pubkey> {
        Ok(self.pubkey)
    }

    fn sign(&self, event: &UnsignedEvent) -> Result<String> {
        Ok(format!("{}{}", event.id.hex(), event.id.hex()))
    }

    fn encrypt(&self, _peer: &Pubkey, plaintext: &str, _scheme: EncryptionScheme) -> Result<String> {
        Ok(format!("enc:{plaintext}"))
    }

    fn decrypt(&self, _peer: &Pubkey, ciphertext: &str, _scheme: EncryptionScheme) -> Result<String> {
        Ok(ciphertext
            .strip_prefix("enc:")
            .unwrap_or(ciphertext)
            .to_owned())
    }
}
