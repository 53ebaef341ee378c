use crate::client::EventClientMessage;
use crate::relay::WebsocketConn;
use crate::ClientMessage;

use tracing::warn;

/// Outgoing EVENT frames that could not be sent because the relay was down.
/// Flushed in order when the socket (re)opens; a publish is never silently
/// dropped by a flapping connection.
#[derive(Default)]
pub struct BroadcastQueue {
    to_send: Vec<EventClientMessage>,
}

impl BroadcastQueue {
    /// Sends immediately when connected, otherwise queues.
    pub fn broadcast(&mut self, conn: Option<&mut WebsocketConn>, msg: EventClientMessage) {
        let Some(conn) = conn else {
            self.to_send.push(msg);
            return;
        };

        if !conn.is_connected() {
            self.to_send.push(msg);
            return;
        }

        if let Err(err) = conn.send(&ClientMessage::Event(msg.clone())) {
            warn!("queueing event for {}: {err}", conn.url);
            self.to_send.push(msg);
        }
    }

    #[profiling::function]
    pub fn try_flush(&mut self, conn: Option<&mut WebsocketConn>) {
        let Some(conn) = conn else {
            return;
        };

        if !conn.is_connected() || self.to_send.is_empty() {
            return;
        }

        for item in self.to_send.drain(..) {
            if let Err(err) = conn.send(&ClientMessage::Event(item)) {
                warn!("flush to {} failed: {err}", conn.url);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.to_send.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_send.is_empty()
    }
}
