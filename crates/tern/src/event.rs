use crate::{Error, Pubkey, Result};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// 32-byte SHA-256 of the canonical event serialization.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EventId([u8; 32]);

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl EventId {
    pub fn new(bytes: [u8; 32]) -> Self {
        EventId(bytes)
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.bytes())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes =
            hex::decode(hex_str).map_err(|_| Error::InvalidEventId(hex_str.to_owned()))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidEventId(hex_str.to_owned()))?;
        Ok(EventId(arr))
    }

    /// Number of leading zero bits, the NIP-13 proof-of-work difficulty.
    pub fn pow_difficulty(&self) -> u32 {
        let mut bits = 0;
        for byte in self.0 {
            if byte == 0 {
                bits += 8;
                continue;
            }
            bits += byte.leading_zeros();
            break;
        }
        bits
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        EventId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A signed nostr event, immutable once built.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Event {
    /// 32-bytes sha256 of the serialized event data
    pub id: EventId,
    /// 32-bytes hex-encoded public key of the event creator
    pub pubkey: Pubkey,
    /// unix timestamp in seconds
    pub created_at: u64,
    pub kind: u16,
    /// Ordered tag list; the first element of each tag is its name
    pub tags: Vec<Vec<String>>,
    /// arbitrary string
    pub content: String,
    /// 64-bytes hex-encoded schnorr signature over `id`
    pub sig: String,
}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl Event {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(Into::into)
    }

    pub fn json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Recomputes the id from the event fields and compares it to `id`.
    /// Schnorr verification of `sig` is the embedder's job; an id mismatch
    /// alone already disqualifies the event.
    pub fn verify_id(&self) -> bool {
        compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ) == self.id
    }

    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All tags named `name`.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [String]> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .map(Vec::as_slice)
    }

    /// The mutable pre-signing form, e.g. for proof-of-work re-mining.
    pub fn to_template(&self) -> EventTemplate {
        EventTemplate {
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }
}

/// Event fields before signing. The id is derived, the signature is the
/// signer's; everything else is the caller's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: u16, content: impl Into<String>, created_at: u64) -> Self {
        Self {
            created_at,
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    pub fn tag(mut self, tag: Vec<String>) -> Self {
        self.tags.push(tag);
        self
    }

    /// Binds the template to an author, computing the canonical id.
    pub fn unsigned(self, pubkey: Pubkey) -> UnsignedEvent {
        let id = compute_id(&pubkey, self.created_at, self.kind, &self.tags, &self.content);
        UnsignedEvent {
            id,
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }
}

/// What a [`crate::Signer`] signs: a full event minus the signature.
#[derive(Debug, Clone)]
pub struct UnsignedEvent {
    pub id: EventId,
    pub pubkey: Pubkey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn sign_with(self, sig: String) -> Event {
        Event {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }

    /// Back to a template, e.g. to mutate tags and re-derive the id.
    pub fn into_template(self) -> EventTemplate {
        EventTemplate {
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }
}

/// Canonical serialization hashed into the event id:
/// `[0,pubkey,created_at,kind,tags,content]`, compact, no slash escaping.
pub fn canonical_json(
    pubkey: &Pubkey,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    // serde_json emits compact output and never escapes forward slashes,
    // which is exactly the NIP-01 canonical form.
    serde_json::to_string(&(0u8, pubkey.hex(), created_at, kind, tags, content))
        .expect("canonical serialization cannot fail")
}

pub fn compute_id(
    pubkey: &Pubkey,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> EventId {
    let canonical = canonical_json(pubkey, created_at, kind, tags, content);
    let digest = Sha256::digest(canonical.as_bytes());
    EventId(digest.into())
}
