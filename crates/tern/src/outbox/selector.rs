use crate::outbox::{OutboxTracker, RankContext, RelayListKind, RelayRanker, RELAY_LIST_KIND};
use crate::relay::RelayUrl;
use crate::{Event, Filter, Pubkey};

use hashbrown::{HashMap, HashSet};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// pad with defaults below this
    pub min_relay_count: usize,
    /// truncate (best-first) above this
    pub max_relay_count: usize,
    /// coverage target per author for fetch combinations
    pub relays_per_author: usize,
    pub default_relays: Vec<RelayUrl>,
    pub blacklist: HashSet<RelayUrl>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            min_relay_count: 2,
            max_relay_count: 8,
            relays_per_author: 2,
            default_relays: Vec::new(),
            blacklist: HashSet::new(),
        }
    }
}

/// How the relay set was arrived at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMethod {
    /// per-author outbox data drove the choice
    Outbox,
    /// not enough outbox data; defaults were mixed in
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Selection {
    /// best-first
    pub relays: Vec<RelayUrl>,
    pub method: SelectionMethod,
    /// authors we had no (fresh) relay lists for; callers kick off
    /// background fetches for these
    pub missing_relay_info: Vec<Pubkey>,
}

/// Chooses the relay set for a publish or a fetch from tracker knowledge,
/// ranked by the health scorer. Borrows its collaborators per call, like
/// the per-frame relay views in the coordinator.
pub struct RelaySelector<'a> {
    tracker: &'a OutboxTracker,
    ranker: &'a RelayRanker,
    config: &'a SelectorConfig,
}

impl<'a> RelaySelector<'a> {
    pub fn new(
        tracker: &'a OutboxTracker,
        ranker: &'a RelayRanker,
        config: &'a SelectorConfig,
    ) -> Self {
        Self {
            tracker,
            ranker,
            config,
        }
    }

    /// Target set for publishing `event`: the author's write relays, every
    /// `p`-tagged user's write relays (read as fallback), relay hints in
    /// `e`/`a` tags, and — for relay-list events themselves — the author's
    /// read relays too.
    #[profiling::function]
    pub fn select_for_publishing(
        &self,
        event: &Event,
        connected: &HashSet<RelayUrl>,
        now: Instant,
    ) -> Selection {
        let mut candidates: BTreeSet<RelayUrl> = BTreeSet::new();
        let mut missing = Vec::new();
        let mut coverage: HashMap<RelayUrl, usize> = HashMap::new();
        let mut authors = 0usize;

        let mut add_author = |urls: Option<Vec<RelayUrl>>,
                              pubkey: Pubkey,
                              candidates: &mut BTreeSet<RelayUrl>,
                              missing: &mut Vec<Pubkey>| {
            authors += 1;
            let Some(urls) = urls else {
                missing.push(pubkey);
                return;
            };
            for url in urls {
                *coverage.entry(url.clone()).or_default() += 1;
                candidates.insert(url);
            }
        };

        add_author(
            self.tracker.get_relays(&event.pubkey, RelayListKind::Write),
            event.pubkey,
            &mut candidates,
            &mut missing,
        );

        if event.kind == RELAY_LIST_KIND {
            if let Some(urls) = self.tracker.get_relays(&event.pubkey, RelayListKind::Read) {
                candidates.extend(urls);
            }
        }

        for tag in event.tags_named("p") {
            let Some(target) = tag.get(1).and_then(|v| Pubkey::parse(v)) else {
                continue;
            };
            let urls = self
                .tracker
                .get_relays(&target, RelayListKind::Write)
                .filter(|u| !u.is_empty())
                .or_else(|| self.tracker.get_relays(&target, RelayListKind::Read));
            add_author(urls, target, &mut candidates, &mut missing);
        }

        for name in ["e", "a"] {
            for tag in event.tags_named(name) {
                let Some(hint) = tag.get(2) else {
                    continue;
                };
                let Ok(url) = RelayUrl::parse(hint) else {
                    continue;
                };
                candidates.insert(url);
            }
        }

        candidates.retain(|url| !self.config.blacklist.contains(url));

        self.finish(candidates, coverage, authors, missing, connected, now)
    }

    /// Relay set for a fetch: the current user's read relays, each
    /// requested author's read relays (write as fallback), and the read
    /// relays of every `#p`-referenced user.
    #[profiling::function]
    pub fn select_for_fetching(
        &self,
        filters: &[Filter],
        user: Option<&Pubkey>,
        connected: &HashSet<RelayUrl>,
        now: Instant,
    ) -> Selection {
        let mut candidates: BTreeSet<RelayUrl> = BTreeSet::new();
        let mut missing = Vec::new();
        let mut coverage: HashMap<RelayUrl, usize> = HashMap::new();
        let mut authors = 0usize;

        if let Some(user) = user {
            if let Some(urls) = self.tracker.get_relays(user, RelayListKind::Read) {
                candidates.extend(urls);
            }
        }

        for pubkey in referenced_authors(filters) {
            authors += 1;
            let urls = self
                .tracker
                .get_relays(&pubkey, RelayListKind::Read)
                .filter(|u| !u.is_empty())
                .or_else(|| self.tracker.get_relays(&pubkey, RelayListKind::Write));
            let Some(urls) = urls else {
                missing.push(pubkey);
                continue;
            };
            for url in urls {
                *coverage.entry(url.clone()).or_default() += 1;
                candidates.insert(url);
            }
        }

        candidates.retain(|url| !self.config.blacklist.contains(url));

        self.finish(candidates, coverage, authors, missing, connected, now)
    }

    /// Greedy set cover: assigns each author to relays until everyone is
    /// covered `relays_per_author` times, preferring relays that serve many
    /// of the remaining authors at once.
    pub fn choose_relay_combination(
        &self,
        pubkeys: &[Pubkey],
        kind: RelayListKind,
    ) -> BTreeMap<RelayUrl, BTreeSet<Pubkey>> {
        let mut serves: BTreeMap<RelayUrl, BTreeSet<Pubkey>> = BTreeMap::new();
        for pubkey in pubkeys {
            let Some(urls) = self.tracker.get_relays(pubkey, kind) else {
                continue;
            };
            for url in urls {
                if self.config.blacklist.contains(&url) {
                    continue;
                }
                serves.entry(url).or_default().insert(*pubkey);
            }
        }

        let mut need: BTreeMap<Pubkey, usize> = pubkeys
            .iter()
            .map(|pk| (*pk, self.config.relays_per_author))
            .collect();
        let mut chosen: BTreeMap<RelayUrl, BTreeSet<Pubkey>> = BTreeMap::new();

        while need.values().any(|n| *n > 0) {
            // the relay covering the most still-needy authors wins;
            // BTreeMap iteration makes ties deterministic
            let best = serves
                .iter()
                .filter(|(url, _)| !chosen.contains_key(*url))
                .map(|(url, pks)| {
                    let gain = pks
                        .iter()
                        .filter(|pk| need.get(*pk).is_some_and(|n| *n > 0))
                        .count();
                    (url.clone(), gain)
                })
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));

            let Some((url, gain)) = best else {
                break;
            };
            if gain == 0 {
                break;
            }

            let covered = serves.remove(&url).unwrap_or_default();
            for pk in &covered {
                if let Some(n) = need.get_mut(pk) {
                    *n = n.saturating_sub(1);
                }
            }
            chosen.insert(url, covered);
        }

        chosen
    }

    fn finish(
        &self,
        candidates: BTreeSet<RelayUrl>,
        coverage: HashMap<RelayUrl, usize>,
        authors: usize,
        missing: Vec<Pubkey>,
        connected: &HashSet<RelayUrl>,
        now: Instant,
    ) -> Selection {
        let mut candidates = candidates;
        let mut method = SelectionMethod::Outbox;

        if candidates.len() < self.config.min_relay_count {
            for url in &self.config.default_relays {
                if candidates.len() >= self.config.min_relay_count {
                    break;
                }
                if self.config.blacklist.contains(url) {
                    continue;
                }
                if candidates.insert(url.clone()) {
                    method = SelectionMethod::Fallback;
                }
            }
        }

        let ctx = RankContext {
            connected: connected.clone(),
            coverage,
            author_count: authors,
        };
        let mut relays: Vec<RelayUrl> = self
            .ranker
            .rank(candidates, &ctx, now)
            .into_iter()
            .map(|(url, _)| url)
            .collect();
        if relays.len() > self.config.max_relay_count {
            debug!(
                "truncating selection from {} to {} relays",
                relays.len(),
                self.config.max_relay_count
            );
            relays.truncate(self.config.max_relay_count);
        }

        Selection {
            relays,
            method,
            missing_relay_info: missing,
        }
    }
}

/// Authors a filter set asks about: the `authors` constraint plus every
/// `#p` reference.
pub fn referenced_authors(filters: &[Filter]) -> BTreeSet<Pubkey> {
    let mut authors = BTreeSet::new();
    for filter in filters {
        if let Some(hexes) = &filter.authors {
            authors.extend(hexes.iter().filter_map(|h| Pubkey::parse(h)));
        }
        for (key, values) in &filter.tags {
            if key.as_char() == 'p' {
                authors.extend(values.iter().filter_map(|h| Pubkey::parse(h)));
            }
        }
    }
    authors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTemplate;
    use crate::outbox::RelaySource;
    use std::time::Duration;

    const AA: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BB: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const CC: &str = "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

    fn pk(hex: &str) -> Pubkey {
        Pubkey::from_hex(hex).expect("pk")
    }

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).expect("url")
    }

    fn select<'a>(
        tracker: &'a OutboxTracker,
        ranker: &'a RelayRanker,
        config: &'a SelectorConfig,
    ) -> RelaySelector<'a> {
        RelaySelector::new(tracker, ranker, config)
    }

    /// The outbox publish scenario: author writes to R1/R2, the mentioned
    /// user writes to R3, an e-tag hints R4 which is blacklisted.
    #[test]
    fn publish_targets_author_mention_and_hint_relays() {
        let mut tracker = OutboxTracker::default();
        tracker.track(
            pk(AA),
            vec![],
            vec![url("wss://r1.example.com"), url("wss://r2.example.com")],
            RelaySource::Nip65,
        );
        tracker.track(
            pk(BB),
            vec![],
            vec![url("wss://r3.example.com")],
            RelaySource::Nip65,
        );

        let config = SelectorConfig {
            min_relay_count: 1,
            blacklist: [url("wss://r4.example.com")].into_iter().collect(),
            ..Default::default()
        };
        let ranker = RelayRanker::default();

        let event = EventTemplate::new(1, "hello", 100)
            .tag(vec!["p".into(), BB.into()])
            .tag(vec![
                "e".into(),
                "11".repeat(32),
                "wss://r4.example.com".into(),
            ])
            .unsigned(pk(AA))
            .sign_with(String::new());

        let selection = select(&tracker, &ranker, &config).select_for_publishing(
            &event,
            &HashSet::new(),
            Instant::now(),
        );

        let got: BTreeSet<&str> = selection.relays.iter().map(|r| r.as_str()).collect();
        let want: BTreeSet<&str> = [
            "wss://r1.example.com/",
            "wss://r2.example.com/",
            "wss://r3.example.com/",
        ]
        .into_iter()
        .collect();
        assert_eq!(got, want);
        assert_eq!(selection.method, SelectionMethod::Outbox);
        assert!(selection.missing_relay_info.is_empty());
    }

    #[test]
    fn publish_falls_back_to_defaults_when_outbox_is_empty() {
        let tracker = OutboxTracker::default();
        let ranker = RelayRanker::default();
        let config = SelectorConfig {
            min_relay_count: 2,
            default_relays: vec![url("wss://d1.example.com"), url("wss://d2.example.com")],
            ..Default::default()
        };

        let event = EventTemplate::new(1, "hello", 100)
            .unsigned(pk(AA))
            .sign_with(String::new());
        let selection = select(&tracker, &ranker, &config).select_for_publishing(
            &event,
            &HashSet::new(),
            Instant::now(),
        );

        assert_eq!(selection.method, SelectionMethod::Fallback);
        assert_eq!(selection.relays.len(), 2);
        assert_eq!(selection.missing_relay_info, vec![pk(AA)]);
    }

    #[test]
    fn relay_list_events_also_go_to_read_relays() {
        let mut tracker = OutboxTracker::default();
        tracker.track(
            pk(AA),
            vec![url("wss://read.example.com")],
            vec![url("wss://write.example.com")],
            RelaySource::Nip65,
        );
        let ranker = RelayRanker::default();
        let config = SelectorConfig {
            min_relay_count: 1,
            ..Default::default()
        };

        let event = EventTemplate::new(RELAY_LIST_KIND, "", 100)
            .unsigned(pk(AA))
            .sign_with(String::new());
        let selection = select(&tracker, &ranker, &config).select_for_publishing(
            &event,
            &HashSet::new(),
            Instant::now(),
        );

        let got: BTreeSet<&str> = selection.relays.iter().map(|r| r.as_str()).collect();
        assert!(got.contains("wss://read.example.com/"));
        assert!(got.contains("wss://write.example.com/"));
    }

    #[test]
    fn fetch_uses_author_read_relays_with_write_fallback() {
        let mut tracker = OutboxTracker::default();
        tracker.track(
            pk(AA),
            vec![url("wss://aread.example.com")],
            vec![],
            RelaySource::Nip65,
        );
        // BB advertised only write relays
        tracker.track(
            pk(BB),
            vec![],
            vec![url("wss://bwrite.example.com")],
            RelaySource::Nip65,
        );

        let ranker = RelayRanker::default();
        let config = SelectorConfig {
            min_relay_count: 1,
            ..Default::default()
        };
        let filters = vec![Filter::new().kinds([1]).authors([AA, BB, CC])];

        let selection = select(&tracker, &ranker, &config).select_for_fetching(
            &filters,
            None,
            &HashSet::new(),
            Instant::now(),
        );

        let got: BTreeSet<&str> = selection.relays.iter().map(|r| r.as_str()).collect();
        assert!(got.contains("wss://aread.example.com/"));
        assert!(got.contains("wss://bwrite.example.com/"));
        assert_eq!(selection.missing_relay_info, vec![pk(CC)]);
    }

    #[test]
    fn selection_truncates_to_max_by_rank() {
        let mut tracker = OutboxTracker::default();
        let urls: Vec<RelayUrl> = (0..6)
            .map(|i| url(&format!("wss://r{i}.example.com")))
            .collect();
        tracker.track(pk(AA), urls.clone(), vec![], RelaySource::Nip65);

        let mut ranker = RelayRanker::default();
        // make r5 clearly the best
        for _ in 0..5 {
            ranker.update_performance(&urls[5], true, Some(Duration::from_millis(50)));
        }

        let config = SelectorConfig {
            min_relay_count: 1,
            max_relay_count: 3,
            ..Default::default()
        };
        let filters = vec![Filter::new().kinds([1]).authors([AA])];
        let selection = select(&tracker, &ranker, &config).select_for_fetching(
            &filters,
            None,
            &HashSet::new(),
            Instant::now(),
        );

        assert_eq!(selection.relays.len(), 3);
        assert_eq!(selection.relays[0], urls[5]);
    }

    #[test]
    fn combination_prefers_relays_covering_many_authors() {
        let mut tracker = OutboxTracker::default();
        let shared = url("wss://shared.example.com");
        // AA and BB share a relay; CC is elsewhere
        tracker.track(
            pk(AA),
            vec![shared.clone(), url("wss://a-only.example.com")],
            vec![],
            RelaySource::Nip65,
        );
        tracker.track(
            pk(BB),
            vec![shared.clone(), url("wss://b-only.example.com")],
            vec![],
            RelaySource::Nip65,
        );
        tracker.track(
            pk(CC),
            vec![url("wss://c-only.example.com")],
            vec![],
            RelaySource::Nip65,
        );

        let ranker = RelayRanker::default();
        let config = SelectorConfig {
            relays_per_author: 1,
            ..Default::default()
        };
        let combo = select(&tracker, &ranker, &config)
            .choose_relay_combination(&[pk(AA), pk(BB), pk(CC)], RelayListKind::Read);

        let shared_authors = combo.get(&shared).expect("shared relay chosen");
        assert_eq!(shared_authors.len(), 2);
        assert!(combo.contains_key(&url("wss://c-only.example.com")));
        // single-author relays for AA/BB are unnecessary once shared covers them
        assert!(!combo.contains_key(&url("wss://a-only.example.com")));
        assert!(!combo.contains_key(&url("wss://b-only.example.com")));
    }

    #[test]
    fn referenced_authors_spans_authors_and_p_tags() {
        let filters = vec![
            Filter::new().kinds([1]).authors([AA]),
            Filter::new().kinds([4]).tag('p', [BB.to_owned()]),
        ];
        let authors = referenced_authors(&filters);
        assert_eq!(authors.len(), 2);
        assert!(authors.contains(&pk(AA)));
        assert!(authors.contains(&pk(BB)));
    }
}
