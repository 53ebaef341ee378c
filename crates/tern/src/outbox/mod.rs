mod ranker;
mod selector;

pub use ranker::{RankContext, RankWeights, RelayRanker};
pub use selector::{RelaySelector, Selection, SelectionMethod, SelectorConfig};

use crate::relay::{RelayUrl, SubId};
use crate::{Event, Pubkey};

use hashbrown::{HashMap, HashSet};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::debug;

pub const RELAY_LIST_KIND: u16 = 10_002;
pub const CONTACT_LIST_KIND: u16 = 3;

/// Where a relay list came from; NIP-65 beats contact-list hints which beat
/// nothing, and manual entries beat everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelaySource {
    ContactList,
    Nip65,
    Manual,
}

/// Health telemetry attached to one relay reference.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMetadata {
    /// rolling quality score in [0, 1]
    pub score: f64,
    /// unix seconds of the last successful connect
    pub last_connected_at: Option<u64>,
    pub avg_response_time: Option<Duration>,
    pub failure_count: u32,
    pub auth_required: bool,
    pub payment_required: bool,
}

impl Default for RelayMetadata {
    fn default() -> Self {
        Self {
            score: 0.5,
            last_connected_at: None,
            avg_response_time: None,
            failure_count: 0,
            auth_required: false,
            payment_required: false,
        }
    }
}

/// One author's advertised relays.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub pubkey: Pubkey,
    pub read_relays: BTreeMap<RelayUrl, RelayMetadata>,
    pub write_relays: BTreeMap<RelayUrl, RelayMetadata>,
    pub source: RelaySource,
    pub cached_at: Instant,
}

/// Projection wanted from [`OutboxTracker::get_relays`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayListKind {
    Read,
    Write,
    Both,
}

/// Which list-kind event a pending background fetch is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    /// kind-10002 relay list
    RelayList,
    /// kind-3 contact list relay hints, the fallback
    ContactList,
}

#[derive(Debug, Clone, Copy)]
struct PendingFetch {
    sub: SubId,
    phase: FetchPhase,
}

/// Per-author cache of read/write relays, fed by NIP-65 events with
/// contact-list fallback. Writers are only this type's own mutating
/// operations; the pool drives background fetches through the pending-set
/// API so concurrent interest in one author coalesces onto one fetch.
pub struct OutboxTracker {
    entries: HashMap<Pubkey, RelayInfo>,
    blacklist: HashSet<RelayUrl>,
    pending: HashMap<Pubkey, PendingFetch>,
    /// subscriptions parked on an author whose relay list is still being
    /// fetched; re-staged when the fetch settles
    waiters: HashMap<Pubkey, BTreeSet<SubId>>,
    max_age: Duration,
}

impl Default for OutboxTracker {
    fn default() -> Self {
        Self::new(HashSet::new(), Duration::from_secs(60 * 60))
    }
}

impl OutboxTracker {
    pub fn new(blacklist: HashSet<RelayUrl>, max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            blacklist,
            pending: HashMap::new(),
            waiters: HashMap::new(),
            max_age,
        }
    }

    pub fn is_blacklisted(&self, url: &RelayUrl) -> bool {
        self.blacklist.contains(url)
    }

    /// Inserts or updates an author's relay lists. Blacklisted URLs never
    /// enter the table. Existing metadata for a kept URL survives the
    /// update; a lower-priority source never overwrites a higher one.
    pub fn track<R, W>(&mut self, pubkey: Pubkey, read: R, write: W, source: RelaySource)
    where
        R: IntoIterator<Item = RelayUrl>,
        W: IntoIterator<Item = RelayUrl>,
    {
        if let Some(existing) = self.entries.get(&pubkey) {
            if existing.source > source && !self.expired(existing) {
                return;
            }
        }

        let keep = |url: &RelayUrl| !self.blacklist.contains(url);
        let old = self.entries.remove(&pubkey);
        let carry = |old_map: Option<&BTreeMap<RelayUrl, RelayMetadata>>, url: &RelayUrl| {
            old_map
                .and_then(|m| m.get(url).cloned())
                .unwrap_or_default()
        };

        let read_relays: BTreeMap<RelayUrl, RelayMetadata> = read
            .into_iter()
            .filter(keep)
            .map(|url| {
                let meta = carry(old.as_ref().map(|o| &o.read_relays), &url);
                (url, meta)
            })
            .collect();
        let write_relays: BTreeMap<RelayUrl, RelayMetadata> = write
            .into_iter()
            .filter(keep)
            .map(|url| {
                let meta = carry(old.as_ref().map(|o| &o.write_relays), &url);
                (url, meta)
            })
            .collect();

        self.entries.insert(
            pubkey,
            RelayInfo {
                pubkey,
                read_relays,
                write_relays,
                source,
                cached_at: Instant::now(),
            },
        );
        self.pending.remove(&pubkey);
    }

    pub fn get_info(&self, pubkey: &Pubkey) -> Option<&RelayInfo> {
        let info = self.entries.get(pubkey)?;
        if self.expired(info) {
            return None;
        }
        Some(info)
    }

    /// The cached projection for `pubkey`, or None when nothing (fresh) is
    /// known about the author.
    pub fn get_relays(&self, pubkey: &Pubkey, kind: RelayListKind) -> Option<Vec<RelayUrl>> {
        let info = self.get_info(pubkey)?;
        let urls: Vec<RelayUrl> = match kind {
            RelayListKind::Read => info.read_relays.keys().cloned().collect(),
            RelayListKind::Write => info.write_relays.keys().cloned().collect(),
            RelayListKind::Both => {
                let mut set: std::collections::BTreeSet<RelayUrl> =
                    info.read_relays.keys().cloned().collect();
                set.extend(info.write_relays.keys().cloned());
                set.into_iter().collect()
            }
        };
        Some(urls)
    }

    /// Merges fresh telemetry into every cached entry that references
    /// `url`.
    pub fn update_relay_metadata(&mut self, url: &RelayUrl, metadata: &RelayMetadata) {
        for info in self.entries.values_mut() {
            for map in [&mut info.read_relays, &mut info.write_relays] {
                if let Some(meta) = map.get_mut(url) {
                    merge_metadata(meta, metadata);
                }
            }
        }
    }

    /// Learns relay lists from inbound events. Returns true when the event
    /// changed the table.
    pub fn ingest_event(&mut self, event: &Event) -> bool {
        match event.kind {
            RELAY_LIST_KIND => {
                let (read, write) = parse_nip65(event);
                if read.is_empty() && write.is_empty() {
                    return false;
                }
                self.track(event.pubkey, read, write, RelaySource::Nip65);
                true
            }
            CONTACT_LIST_KIND => {
                let (read, write) = parse_contact_list(event);
                if read.is_empty() && write.is_empty() {
                    return false;
                }
                self.track(event.pubkey, read, write, RelaySource::ContactList);
                true
            }
            _ => false,
        }
    }

    // ---- background fetch coalescing ----

    /// Authors from `pubkeys` with no fresh entry and no fetch in flight.
    /// Marks them pending against `sub` so overlapping interest coalesces.
    pub fn begin_fetches<'a, I>(&mut self, pubkeys: I, sub: SubId, phase: FetchPhase) -> Vec<Pubkey>
    where
        I: IntoIterator<Item = &'a Pubkey>,
    {
        let mut started = Vec::new();
        for pubkey in pubkeys {
            if self.get_info(pubkey).is_some() || self.pending.contains_key(pubkey) {
                continue;
            }
            self.pending.insert(*pubkey, PendingFetch { sub, phase });
            started.push(*pubkey);
        }
        if !started.is_empty() {
            debug!("fetching relay lists for {} authors", started.len());
        }
        started
    }

    /// Ends the fetch identified by `sub`, returning the authors that are
    /// still unknown (candidates for the fallback phase).
    pub fn finish_fetch(&mut self, sub: SubId) -> (FetchPhase, Vec<Pubkey>) {
        let mut phase = FetchPhase::RelayList;
        let mut unresolved = Vec::new();
        self.pending.retain(|pubkey, fetch| {
            if fetch.sub != sub {
                return true;
            }
            phase = fetch.phase;
            unresolved.push(*pubkey);
            false
        });
        unresolved.retain(|pk| self.entries.get(pk).is_none());
        (phase, unresolved)
    }

    pub fn has_pending(&self, pubkey: &Pubkey) -> bool {
        self.pending.contains_key(pubkey)
    }

    /// Parks `sub` on `pubkey`: it could not select any relay without the
    /// author's list. Every interested subscription registers here, not
    /// just the one that started the fetch.
    pub fn add_waiter(&mut self, pubkey: Pubkey, sub: SubId) {
        self.waiters.entry(pubkey).or_default().insert(sub);
    }

    /// Drops `sub` from every waiter set (the subscription closed).
    pub fn remove_waiter(&mut self, sub: &SubId) {
        self.waiters.retain(|_, subs| {
            subs.remove(sub);
            !subs.is_empty()
        });
    }

    /// Drains the waiters of every author whose fetch has settled —
    /// either the relay list arrived or every phase gave up. Authors with
    /// a fetch still in flight keep their waiters.
    pub fn take_ready_waiters(&mut self) -> Vec<SubId> {
        let pending = &self.pending;
        let mut ready: BTreeSet<SubId> = BTreeSet::new();
        self.waiters.retain(|pubkey, subs| {
            if pending.contains_key(pubkey) {
                return true;
            }
            ready.extend(subs.iter().copied());
            false
        });
        ready.into_iter().collect()
    }

    fn expired(&self, info: &RelayInfo) -> bool {
        info.cached_at.elapsed() > self.max_age
    }
}

fn merge_metadata(into: &mut RelayMetadata, from: &RelayMetadata) {
    into.score = from.score;
    into.failure_count = from.failure_count;
    into.auth_required = from.auth_required;
    into.payment_required = from.payment_required;
    if from.last_connected_at.is_some() {
        into.last_connected_at = from.last_connected_at;
    }
    if from.avg_response_time.is_some() {
        into.avg_response_time = from.avg_response_time;
    }
}

/// NIP-65 `r` tags: `["r", url]` means read+write, `["r", url, "read"]`
/// read-only, `["r", url, "write"]` write-only.
fn parse_nip65(event: &Event) -> (Vec<RelayUrl>, Vec<RelayUrl>) {
    let mut read = Vec::new();
    let mut write = Vec::new();
    for tag in event.tags_named("r") {
        let Some(url) = tag.get(1) else {
            continue;
        };
        let Ok(url) = RelayUrl::parse(url) else {
            continue;
        };
        match tag.get(2).map(String::as_str) {
            Some("read") => read.push(url),
            Some("write") => write.push(url),
            _ => {
                read.push(url.clone());
                write.push(url);
            }
        }
    }
    (read, write)
}

/// Legacy kind-3 relay hints: the content is a JSON object
/// `{ url: {"read": bool, "write": bool} }`.
fn parse_contact_list(event: &Event) -> (Vec<RelayUrl>, Vec<RelayUrl>) {
    let mut read = Vec::new();
    let mut write = Vec::new();

    #[derive(serde::Deserialize)]
    struct Markers {
        #[serde(default)]
        read: bool,
        #[serde(default)]
        write: bool,
    }

    let Ok(hints) = serde_json::from_str::<BTreeMap<String, Markers>>(&event.content) else {
        return (read, write);
    };

    for (url, markers) in hints {
        let Ok(url) = RelayUrl::parse(&url) else {
            continue;
        };
        if markers.read {
            read.push(url.clone());
        }
        if markers.write {
            write.push(url);
        }
    }
    (read, write)
}
