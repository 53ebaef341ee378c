use crate::{Event, Filter, Result};
use serde_json::json;

/// An outgoing `["EVENT", ...]` frame.
#[derive(Debug, Clone)]
pub struct EventClientMessage {
    pub event: Event,
}

impl EventClientMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(format!("[\"EVENT\",{}]", self.event.json()?))
    }
}

/// Messages sent by clients, received by relays
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(EventClientMessage),
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    Close {
        sub_id: String,
    },
    Auth(Event),
}

impl ClientMessage {
    pub fn event(event: Event) -> Self {
        ClientMessage::Event(EventClientMessage { event })
    }

    pub fn req(sub_id: String, filters: Vec<Filter>) -> Self {
        ClientMessage::Req { sub_id, filters }
    }

    pub fn close(sub_id: String) -> Self {
        ClientMessage::Close { sub_id }
    }

    pub fn auth(event: Event) -> Self {
        ClientMessage::Auth(event)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(match self {
            Self::Event(ecm) => ecm.to_json()?,
            Self::Req { sub_id, filters } => {
                if filters.is_empty() {
                    format!("[\"REQ\",{},{{}}]", json!(sub_id))
                } else {
                    let filters_json: Result<Vec<String>> =
                        filters.iter().map(|f| f.json()).collect();
                    format!("[\"REQ\",{},{}]", json!(sub_id), filters_json?.join(","))
                }
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id]).to_string(),
            Self::Auth(event) => format!("[\"AUTH\",{}]", event.json()?),
        })
    }
}
