use crate::{Error, Event, Result};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Single-letter tag key of a `#x` filter constraint, e.g. `#e`, `#p`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagKey(char);

impl TagKey {
    pub fn new(c: char) -> Result<Self> {
        if c.is_ascii_alphabetic() {
            Ok(TagKey(c))
        } else {
            Err(Error::InvalidFilter(format!("bad tag key '{c}'")))
        }
    }

    pub fn as_char(&self) -> char {
        self.0
    }
}

impl fmt::Debug for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Serialize for TagKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("#{}", self.0))
    }
}

impl<'de> Deserialize<'de> for TagKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mut chars = s.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some('#'), Some(c), None) => TagKey::new(c).map_err(serde::de::Error::custom),
            _ => Err(serde::de::Error::custom(format!("bad tag key '{s}'"))),
        }
    }
}

/// The REQ query language: a conjunction of optional constraints. An event
/// matches iff every present constraint matches.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// single-letter `#x` constraints; an empty map flattens to nothing
    #[serde(flatten)]
    pub tags: BTreeMap<TagKey, BTreeSet<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I: IntoIterator<Item = S>, S: Into<String>>(mut self, authors: I) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I: IntoIterator<Item = u16>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn tag<I: IntoIterator<Item = S>, S: Into<String>>(mut self, key: char, values: I) -> Self {
        if let Ok(key) = TagKey::new(key) {
            self.tags
                .entry(key)
                .or_default()
                .extend(values.into_iter().map(Into::into));
        }
        self
    }

    pub fn json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let filter: Filter = serde_json::from_str(s)
            .map_err(|e| Error::InvalidFilter(e.to_string()))?;
        Ok(filter)
    }

    /// A filter with no constraint at all matches everything; we reject
    /// those at subscription time.
    pub fn is_empty(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.since.is_none()
            && self.until.is_none()
            && self.limit.is_none()
            && self.tags.is_empty()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id.hex()) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey.hex()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, wanted) in &self.tags {
            let name = key.as_char().to_string();
            let mut any = false;
            for tag in event.tags_named(&name) {
                if tag.get(1).is_some_and(|v| wanted.contains(v)) {
                    any = true;
                    break;
                }
            }
            if !any {
                return false;
            }
        }
        true
    }

    /// The grouping key: filters sharing a fingerprint describe the same
    /// constraint shape and may be candidates for a merged REQ.
    pub fn fingerprint(&self) -> FilterFingerprint {
        FilterFingerprint {
            kinds: self
                .kinds
                .as_ref()
                .map(|k| k.iter().copied().collect())
                .unwrap_or_default(),
            has_ids: self.ids.is_some(),
            has_authors: self.authors.is_some(),
            tag_keys: self.tags.keys().map(TagKey::as_char).collect(),
            has_limit: self.limit.is_some(),
            has_time: self.since.is_some() || self.until.is_some(),
        }
    }

    /// Whether the union of `self` and `other` is expressible as one filter.
    /// Filters carrying a limit never merge: limits are per-subscription and
    /// non-commutative.
    pub fn is_mergeable_with(&self, other: &Filter) -> bool {
        if self.limit.is_some() || other.limit.is_some() {
            return false;
        }
        if self.fingerprint() != other.fingerprint() {
            return false;
        }
        // Tightening since/until during the merge must leave a non-empty
        // window, otherwise each filter keeps its own REQ.
        let since = self.since.max(other.since);
        let until = match (self.until, other.until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        match (since, until) {
            (Some(s), Some(u)) => s <= u,
            _ => true,
        }
    }

    /// Set-union over ids/authors/kinds/tag values; `since = max(sinces)`,
    /// `until = min(untils)`. Callers check [`Filter::is_mergeable_with`]
    /// first.
    pub fn merge(&self, other: &Filter) -> Filter {
        let union = |a: &Option<BTreeSet<String>>, b: &Option<BTreeSet<String>>| match (a, b) {
            (Some(a), Some(b)) => Some(a.union(b).cloned().collect()),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };

        let mut tags = self.tags.clone();
        for (key, values) in &other.tags {
            tags.entry(*key).or_default().extend(values.iter().cloned());
        }

        Filter {
            ids: union(&self.ids, &other.ids),
            authors: union(&self.authors, &other.authors),
            kinds: self.kinds.clone().or_else(|| other.kinds.clone()),
            since: self.since.max(other.since),
            until: match (self.until, other.until) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            limit: None,
            tags,
        }
    }
}

/// Constraint shape of one filter; see [`Filter::fingerprint`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FilterFingerprint {
    kinds: Vec<u16>,
    has_ids: bool,
    has_authors: bool,
    tag_keys: Vec<char>,
    has_limit: bool,
    has_time: bool,
}

/// Grouping key of a whole logical subscription: the per-filter
/// fingerprints in order, plus the close-on-EOSE flag (a oneshot REQ and a
/// live REQ never share a wire id).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupFingerprint {
    filters: Vec<FilterFingerprint>,
    close_on_eose: bool,
}

impl GroupFingerprint {
    pub fn of(filters: &[Filter], close_on_eose: bool) -> Self {
        GroupFingerprint {
            filters: filters.iter().map(Filter::fingerprint).collect(),
            close_on_eose,
        }
    }
}

/// Validates a subscription's filter list: non-empty, and no filter that
/// matches everything.
pub fn validate_filters(filters: &[Filter]) -> Result<()> {
    if filters.is_empty() {
        return Err(Error::InvalidFilter(
            "subscription needs at least one filter".to_owned(),
        ));
    }
    for filter in filters {
        if filter.is_empty() {
            return Err(Error::InvalidFilter(
                "filter without constraints".to_owned(),
            ));
        }
    }
    Ok(())
}
