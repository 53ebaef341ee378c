use crate::relay::RelayUrl;
use crate::{Event, EventId, Filter, Result};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-relay outcome of a publish, both live and persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PublishStatus {
    Pending,
    Succeeded,
    Failed { reason: String },
    RateLimited,
    NeedsPow { difficulty: u32 },
    Cancelled,
}

impl PublishStatus {
    /// Terminal states stop the per-relay retry loop.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            PublishStatus::Pending | PublishStatus::RateLimited | PublishStatus::NeedsPow { .. }
        )
    }
}

/// A publish that has not yet reached every target relay. Adapters persist
/// one record per event, named by event id, as a JSON object of exactly
/// this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpublishedEvent {
    pub event: Event,
    pub target_relays: BTreeSet<RelayUrl>,
    pub statuses: BTreeMap<RelayUrl, PublishStatus>,
    /// unix seconds
    pub created_at: u64,
    pub attempts: u32,
}

impl UnpublishedEvent {
    pub fn pending_relays(&self) -> impl Iterator<Item = &RelayUrl> {
        self.target_relays.iter().filter(|url| {
            !matches!(self.statuses.get(*url), Some(PublishStatus::Succeeded))
        })
    }

    pub fn is_fully_published(&self) -> bool {
        self.pending_relays().next().is_none()
    }
}

/// The storage boundary. The core never touches disk or a database
/// directly; adapters answer filter queries, absorb inbound events, and
/// keep unpublished events durable until every target relay accepted them.
pub trait CacheAdapter: Send {
    /// Stored events matching `filter`, most recent first.
    fn query(&self, filter: &Filter) -> Result<Vec<Event>>;

    fn save(&mut self, event: &Event) -> Result<()>;

    fn store_unpublished(&mut self, unpublished: &UnpublishedEvent) -> Result<()>;

    fn update_unpublished_status(
        &mut self,
        event_id: &EventId,
        relay: &RelayUrl,
        status: PublishStatus,
    ) -> Result<()>;

    fn list_unpublished(&self) -> Result<Vec<UnpublishedEvent>>;

    /// Drops the unpublished record; the event reached every target.
    fn mark_published(&mut self, event_id: &EventId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTemplate;
    use crate::Pubkey;

    const PK: &str = "379e863e8357163b5bce5d2688dc4f1dcc2d505222fb8d74db600f30535dfdfe";

    fn unpublished() -> UnpublishedEvent {
        let event = EventTemplate::new(1, "hello", 100)
            .unsigned(Pubkey::from_hex(PK).expect("pk"))
            .sign_with("00".repeat(64));
        let r1 = RelayUrl::parse("wss://r1.example.com").expect("r1");
        let r2 = RelayUrl::parse("wss://r2.example.com").expect("r2");

        let mut statuses = BTreeMap::new();
        statuses.insert(r1.clone(), PublishStatus::Succeeded);
        statuses.insert(
            r2.clone(),
            PublishStatus::Failed {
                reason: "error: mute".into(),
            },
        );

        UnpublishedEvent {
            event,
            target_relays: [r1, r2].into_iter().collect(),
            statuses,
            created_at: 100,
            attempts: 2,
        }
    }

    #[test]
    fn pending_relays_excludes_successes() {
        let record = unpublished();
        let pending: Vec<&str> = record.pending_relays().map(|r| r.as_str()).collect();
        assert_eq!(pending, vec!["wss://r2.example.com/"]);
        assert!(!record.is_fully_published());
    }

    #[test]
    fn persisted_layout_round_trips() {
        let record = unpublished();
        let json = serde_json::to_string(&record).expect("json");
        assert!(json.contains("\"target_relays\""), "got {json}");
        assert!(json.contains("\"state\":\"failed\""), "got {json}");

        let back: UnpublishedEvent = serde_json::from_str(&json).expect("parse");
        assert_eq!(back.event.id, record.event.id);
        assert_eq!(back.statuses, record.statuses);
        assert_eq!(back.attempts, 2);
    }

    #[test]
    fn terminal_classification() {
        assert!(PublishStatus::Succeeded.is_terminal());
        assert!(PublishStatus::Cancelled.is_terminal());
        assert!(!PublishStatus::Pending.is_terminal());
        assert!(!PublishStatus::RateLimited.is_terminal());
        assert!(!PublishStatus::NeedsPow { difficulty: 8 }.is_terminal());
    }
}
