use crate::{relay::RelayUrl, ClientMessage, Error, Result, Wakeup};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use ewebsock::{Options, WsMessage, WsReceiver, WsSender};
use tracing::debug;

/// Connection lifecycle of one relay endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Frame counters for one connection, across reconnects.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnCounters {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// WebsocketConn owns an outbound websocket connection to a relay. The
/// transport serializes writes and runs a single read loop internally; this
/// type is the single owner of both handles.
pub struct WebsocketConn {
    pub url: RelayUrl,
    pub status: RelayStatus,
    pub counters: ConnCounters,
    pub connected_at: Option<Instant>,
    sender: WsSender,
    pub(crate) receiver: WsReceiver,
}

impl fmt::Debug for WebsocketConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebsocketConn")
            .field("url", &self.url)
            .field("status", &self.status)
            .finish()
    }
}

impl Hash for WebsocketConn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}

impl PartialEq for WebsocketConn {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for WebsocketConn {}

impl WebsocketConn {
    pub fn connect<W>(url: RelayUrl, wakeup: W) -> Result<Self>
    where
        W: Wakeup,
    {
        let (sender, receiver) =
            ewebsock::connect_with_wakeup(url.as_str(), Options::default(), move || wakeup.wake())
                .map_err(|e| Error::ConnectionFailed {
                    relay: url.to_string(),
                    reason: e,
                })?;

        Ok(Self {
            url,
            status: RelayStatus::Connecting,
            counters: ConnCounters::default(),
            connected_at: None,
            sender,
            receiver,
        })
    }

    /// Replaces the underlying transport without changing identity.
    pub fn reconnect<W>(&mut self, wakeup: W) -> Result<()>
    where
        W: Wakeup,
    {
        let (sender, receiver) = ewebsock::connect_with_wakeup(
            self.url.as_str(),
            Options::default(),
            move || wakeup.wake(),
        )
        .map_err(|e| Error::ConnectionFailed {
            relay: self.url.to_string(),
            reason: e,
        })?;
        self.status = RelayStatus::Connecting;
        self.sender = sender;
        self.receiver = receiver;
        Ok(())
    }

    /// Sends a protocol frame. Only legal while Connected; queuing for a
    /// down relay is the coordinator's job, not the socket's.
    #[profiling::function]
    pub fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        if self.status != RelayStatus::Connected {
            return Err(Error::NotConnected {
                relay: self.url.to_string(),
            });
        }

        let json = msg.to_json()?;
        debug!("sending {} to {}", json, self.url);
        self.counters.frames_sent += 1;
        self.counters.bytes_sent += json.len() as u64;
        self.sender.send(WsMessage::Text(json));
        Ok(())
    }

    pub fn ping(&mut self) {
        self.sender.send(WsMessage::Ping(vec![]));
    }

    pub fn pong(&mut self, payload: Vec<u8>) {
        self.sender.send(WsMessage::Pong(payload));
    }

    pub fn close(&mut self) {
        self.status = RelayStatus::Disconnecting;
        self.sender.close();
    }

    pub fn set_status(&mut self, status: RelayStatus) {
        self.status = status;
        if status == RelayStatus::Connected {
            self.connected_at = Some(Instant::now());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == RelayStatus::Connected
    }
}
