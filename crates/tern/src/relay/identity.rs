use std::borrow::Borrow;
use std::fmt::{self, Display};

use url::Url;
use uuid::Uuid;

use crate::Error;

/// Stable id of one logical subscription, issued by the pool.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub struct SubId(pub u64);

/// The subscription id that actually goes on the wire in a REQ. Always a
/// fresh uuid, never a member's logical id: relays must not be able to
/// correlate wire ids across reconnects or learn grouping structure.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WireId(pub String);

impl Default for WireId {
    fn default() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<String> for WireId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WireId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<WireId> for String {
    fn from(value: WireId) -> Self {
        value.0
    }
}

impl Display for WireId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Borrow<str> for WireId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Status of one on-wire REQ.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReqStatus {
    /// Created, not yet eligible to send (inside the grouping window).
    Initial,
    /// Eligible to send on the next flush.
    Pending,
    /// Wants to be on the wire, the socket is down.
    WaitingForConnection,
    /// REQ sent, stream live.
    Running,
    /// Relay reported end of stored events.
    EoseSeen,
    /// CLOSE sent or CLOSED received; never replayed.
    Closed,
}

impl ReqStatus {
    /// Whether this REQ should be (re)sent when the connection opens.
    pub fn wants_wire(&self) -> bool {
        matches!(
            self,
            ReqStatus::Pending | ReqStatus::WaitingForConnection | ReqStatus::Running
        )
    }
}

/// A relay endpoint identity: the byte-exact normalized form of its URL.
/// Two URLs denote the same relay iff their normalized forms are identical.
#[derive(Eq, PartialEq, Hash, Clone, Debug, PartialOrd, Ord)]
pub struct RelayUrl {
    url: String,
}

impl RelayUrl {
    /// Normalizes: trim, default to `wss`, lowercase scheme and host, strip
    /// `www.`, drop userinfo/fragment/default ports, terminate the path
    /// with `/` (before any query).
    pub fn parse(input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("empty relay url".to_owned()));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_owned()
        } else {
            format!("wss://{trimmed}")
        };

        let parsed = Url::parse(&with_scheme)
            .map_err(|e| Error::InvalidInput(format!("relay url '{trimmed}': {e}")))?;

        let scheme = parsed.scheme().to_ascii_lowercase();
        if scheme != "ws" && scheme != "wss" {
            return Err(Error::InvalidInput(format!(
                "relay url '{trimmed}': scheme must be ws or wss"
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| Error::InvalidInput(format!("relay url '{trimmed}': missing host")))?
            .to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);

        let default_port = if scheme == "ws" { 80 } else { 443 };
        let port = parsed.port().filter(|p| *p != default_port);

        let mut path = parsed.path().to_owned();
        if !path.ends_with('/') {
            path.push('/');
        }

        let mut url = format!("{scheme}://{host}");
        if let Some(port) = port {
            url.push_str(&format!(":{port}"));
        }
        url.push_str(&path);
        if let Some(query) = parsed.query() {
            url.push('?');
            url.push_str(query);
        }

        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }
}

impl Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl Borrow<str> for RelayUrl {
    fn borrow(&self) -> &str {
        &self.url
    }
}

impl From<RelayUrl> for String {
    fn from(value: RelayUrl) -> Self {
        value.url
    }
}

impl std::str::FromStr for RelayUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelayUrl::parse(s)
    }
}

impl serde::Serialize for RelayUrl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.url)
    }
}

impl<'de> serde::Deserialize<'de> for RelayUrl {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        RelayUrl::parse(&s).map_err(serde::de::Error::custom)
    }
}
