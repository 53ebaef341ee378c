use crate::{Error, Result};
use ewebsock::{WsEvent, WsMessage};
use serde::Deserialize;
use serde_json::value::RawValue;

/// An `["OK", ...]` publish acknowledgement.
#[derive(Debug, Eq, PartialEq)]
pub struct CommandResult {
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

/// Messages sent by relays, received by clients. Borrowed from the frame
/// text where cheap (the event JSON), owned where short (ids, notices).
#[derive(Debug, Eq, PartialEq)]
pub enum RelayMessage<'a> {
    /// `["EVENT", sub_id, {..}]`, or `["EVENT", {..}]` from relays that
    /// omit the subscription id; the array shape decides.
    Event {
        sub_id: Option<String>,
        event_json: &'a str,
    },
    Eose(String),
    OK(CommandResult),
    Notice(String),
    Auth(String),
    Count { sub_id: String, count: u64 },
    Closed { sub_id: String, message: String },
}

impl<'a> RelayMessage<'a> {
    pub fn from_json(msg: &'a str) -> Result<RelayMessage<'a>> {
        if msg.trim().is_empty() {
            return Err(Error::InvalidMessage {
                reason: "empty frame".to_owned(),
            });
        }

        // Parse the array shape only; element payloads stay raw until the
        // variant is known. This never panics on adversarial input.
        let parts: Vec<&RawValue> = serde_json::from_str(msg).map_err(|e| Error::InvalidMessage {
            reason: format!("not a json array: {e}"),
        })?;

        let mut parts = parts.into_iter();
        let tag: String = next_as(&mut parts, "message tag")?;

        match tag.as_str() {
            "EVENT" => Self::parse_event(parts),
            "EOSE" => Ok(RelayMessage::Eose(next_as(&mut parts, "sub id")?)),
            "OK" => {
                let event_id = next_as(&mut parts, "event id")?;
                let accepted = next_as(&mut parts, "status")?;
                // The message is optional on some relays.
                let message = next_as(&mut parts, "message").unwrap_or_default();
                Ok(RelayMessage::OK(CommandResult {
                    event_id,
                    accepted,
                    message,
                }))
            }
            "NOTICE" => Ok(RelayMessage::Notice(next_as(&mut parts, "notice")?)),
            "AUTH" => Ok(RelayMessage::Auth(next_as(&mut parts, "challenge")?)),
            "COUNT" => {
                let sub_id = next_as(&mut parts, "sub id")?;
                let body: CountBody = next_as(&mut parts, "count body")?;
                Ok(RelayMessage::Count {
                    sub_id,
                    count: body.count,
                })
            }
            "CLOSED" => {
                let sub_id = next_as(&mut parts, "sub id")?;
                let message = next_as(&mut parts, "message").unwrap_or_default();
                Ok(RelayMessage::Closed { sub_id, message })
            }
            other => Err(Error::InvalidMessage {
                reason: format!("unknown message tag '{other}'"),
            }),
        }
    }

    fn parse_event(
        mut parts: std::vec::IntoIter<&'a RawValue>,
    ) -> Result<RelayMessage<'a>> {
        let Some(second) = parts.next() else {
            return Err(Error::InvalidMessage {
                reason: "EVENT without payload".to_owned(),
            });
        };

        // ["EVENT", {..}] — subscription id omitted.
        if second.get().trim_start().starts_with('{') {
            return Ok(RelayMessage::Event {
                sub_id: None,
                event_json: second.get(),
            });
        }

        let sub_id: String = serde_json::from_str(second.get()).map_err(|e| {
            Error::InvalidMessage {
                reason: format!("bad EVENT sub id: {e}"),
            }
        })?;
        let Some(third) = parts.next() else {
            return Err(Error::InvalidMessage {
                reason: "EVENT without event object".to_owned(),
            });
        };
        Ok(RelayMessage::Event {
            sub_id: Some(sub_id),
            event_json: third.get(),
        })
    }
}

#[derive(Deserialize)]
struct CountBody {
    count: u64,
}

fn next_as<'a, T: Deserialize<'a>>(
    parts: &mut std::vec::IntoIter<&'a RawValue>,
    what: &str,
) -> Result<T> {
    let Some(raw) = parts.next() else {
        return Err(Error::InvalidMessage {
            reason: format!("missing {what}"),
        });
    };
    serde_json::from_str(raw.get()).map_err(|e| Error::InvalidMessage {
        reason: format!("bad {what}: {e}"),
    })
}

/// One websocket occurrence, normalized for the coordinator.
#[derive(Debug)]
pub enum RelayEvent<'a> {
    Opened,
    Closed,
    Other(&'a WsMessage),
    Error(Error),
    Message(RelayMessage<'a>),
}

impl<'a> From<&'a WsEvent> for RelayEvent<'a> {
    fn from(event: &'a WsEvent) -> RelayEvent<'a> {
        match event {
            WsEvent::Opened => RelayEvent::Opened,
            WsEvent::Closed => RelayEvent::Closed,
            WsEvent::Message(ws_msg) => ws_msg.into(),
            WsEvent::Error(s) => RelayEvent::Error(Error::Unknown(s.to_owned())),
        }
    }
}

impl<'a> From<&'a WsMessage> for RelayEvent<'a> {
    fn from(wsmsg: &'a WsMessage) -> RelayEvent<'a> {
        match wsmsg {
            WsMessage::Text(s) => match RelayMessage::from_json(s).map(RelayEvent::Message) {
                Ok(msg) => msg,
                Err(err) => RelayEvent::Error(err),
            },
            wsmsg => RelayEvent::Other(wsmsg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_notice() {
        let msg = RelayMessage::from_json(r#"["NOTICE","Invalid event format!"]"#).expect("parse");
        assert_eq!(msg, RelayMessage::Notice("Invalid event format!".into()));
    }

    #[test]
    fn parses_eose() {
        let msg = RelayMessage::from_json(r#"["EOSE","random-subscription-id"]"#).expect("parse");
        assert_eq!(msg, RelayMessage::Eose("random-subscription-id".into()));
    }

    #[test]
    fn parses_ok_with_pow_prefix() {
        let raw = r#"["OK","b1a649ebe8b435ec71d3784793f3bbf4b93e64e17568a741aecd4c7ddeafce30",false,"pow: difficulty 8 required"]"#;
        let RelayMessage::OK(result) = RelayMessage::from_json(raw).expect("parse") else {
            panic!("expected OK");
        };
        assert!(!result.accepted);
        assert_eq!(result.message, "pow: difficulty 8 required");
        assert_eq!(
            result.event_id,
            "b1a649ebe8b435ec71d3784793f3bbf4b93e64e17568a741aecd4c7ddeafce30"
        );
    }

    #[test]
    fn parses_ok_without_message() {
        let raw = r#"["OK","b1a649ebe8b435ec71d3784793f3bbf4b93e64e17568a741aecd4c7ddeafce30",true]"#;
        let RelayMessage::OK(result) = RelayMessage::from_json(raw).expect("parse") else {
            panic!("expected OK");
        };
        assert!(result.accepted);
        assert_eq!(result.message, "");
    }

    #[test]
    fn parses_event_with_sub_id() {
        let raw = r#"["EVENT","sub-7",{"id":"00","kind":1}]"#;
        let RelayMessage::Event { sub_id, event_json } =
            RelayMessage::from_json(raw).expect("parse")
        else {
            panic!("expected EVENT");
        };
        assert_eq!(sub_id.as_deref(), Some("sub-7"));
        assert_eq!(event_json, r#"{"id":"00","kind":1}"#);
    }

    #[test]
    fn parses_event_without_sub_id() {
        let raw = r#"["EVENT",{"id":"00","kind":1}]"#;
        let RelayMessage::Event { sub_id, event_json } =
            RelayMessage::from_json(raw).expect("parse")
        else {
            panic!("expected EVENT");
        };
        assert!(sub_id.is_none());
        assert_eq!(event_json, r#"{"id":"00","kind":1}"#);
    }

    #[test]
    fn parses_count() {
        let raw = r#"["COUNT","sub-1",{"count":42}]"#;
        let msg = RelayMessage::from_json(raw).expect("parse");
        assert_eq!(
            msg,
            RelayMessage::Count {
                sub_id: "sub-1".into(),
                count: 42
            }
        );
    }

    #[test]
    fn parses_closed() {
        let raw = r#"["CLOSED","sub-1","error: shutting down"]"#;
        let msg = RelayMessage::from_json(raw).expect("parse");
        assert_eq!(
            msg,
            RelayMessage::Closed {
                sub_id: "sub-1".into(),
                message: "error: shutting down".into()
            }
        );
    }

    #[test]
    fn adversarial_input_errors_without_panicking() {
        for bad in [
            "",
            "   ",
            "[",
            "[]",
            "[1,2,3]",
            r#"["NOTICE"]"#,
            r#"["NOTICE": 404]"#,
            r#"["EOSE",404]"#,
            r#"["OK","short"]"#,
            r#"["OK","x",hello,""]"#,
            r#"["EVENT"]"#,
            r#"["WHAT","ever"]"#,
            "\u{0}\u{0}\u{0}",
            "[\"EV",
        ] {
            assert!(RelayMessage::from_json(bad).is_err(), "should reject {bad:?}");
        }
    }
}
