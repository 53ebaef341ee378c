use crate::client::EventClientMessage;
use crate::filter::GroupFingerprint;
use crate::relay::{
    BroadcastQueue, RelayMessage, RelayStatus, RelayUrl, ReqStatus, SubId, WebsocketConn, WireId,
};
use crate::retry::{RetryPolicy, RetryState};
use crate::subscription::SubscriptionStore;
use crate::{ClientMessage, Error, Event, Filter, Result, Wakeup};

use ewebsock::{WsEvent, WsMessage};
use hashbrown::HashMap;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Caps imposed per relay (NIP-11 style).
#[derive(Debug, Clone, Copy)]
pub struct RelayLimits {
    /// corresponds to NIP-11 `max_message_length`
    pub max_json_bytes: usize,
    /// most filters allowed in one merged REQ
    pub max_filters_per_req: usize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_json_bytes: 400_000,
            max_filters_per_req: 10,
        }
    }
}

/// One on-wire REQ, potentially carrying several logical subscriptions
/// after grouping. `merged_filters` is always the current merge of the
/// members' filters.
pub struct RelayReq {
    pub wire_id: WireId,
    pub members: BTreeSet<SubId>,
    pub merged_filters: Vec<Filter>,
    pub fingerprint: GroupFingerprint,
    pub close_on_eose: bool,
    pub status: ReqStatus,
}

/// What one `try_recv` poll produced.
pub enum Recv {
    /// socket had nothing
    Empty,
    /// a frame was handled internally (ping, notice, stale wire id)
    Consumed,
    Item(CoordRecv),
}

/// Frames and transitions the pool must react to.
#[derive(Debug)]
pub enum CoordRecv {
    /// handshake done; the pool follows up with [`RelayCoordinator::replay`]
    Connected { handshake: Duration },
    Disconnected,
    /// `members: None` means the relay omitted the subscription id;
    /// route by filter match across all live subscriptions
    Event {
        members: Option<Vec<SubId>>,
        event_json: String,
    },
    Eose { members: Vec<SubId> },
    SubsClosed { members: Vec<SubId>, message: String },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    AuthChallenge(String),
    Count { members: Vec<SubId>, count: u64 },
}

/// One relay endpoint: the websocket state machine plus the grouping of
/// logical subscriptions into as few REQs as the merge rules allow.
pub struct RelayCoordinator {
    pub url: RelayUrl,
    websocket: Option<WebsocketConn>,
    reqs: HashMap<WireId, RelayReq>,
    members: HashMap<SubId, WireId>,
    queue: BroadcastQueue,
    limits: RelayLimits,
    retry: RetryState,
    retry_connect_after: Duration,
    last_connect_attempt: Instant,
    last_ping: Instant,
}

impl RelayCoordinator {
    /// The coordinator starts without a socket; call
    /// [`RelayCoordinator::connect`] (the pool does, on adding the relay)
    /// or let `tick` bring it up.
    pub fn new(url: RelayUrl, limits: RelayLimits, retry: RetryPolicy) -> Self {
        let retry_connect_after = retry.initial_delay;
        Self {
            url,
            websocket: None,
            reqs: HashMap::new(),
            members: HashMap::new(),
            queue: BroadcastQueue::default(),
            limits,
            retry: retry.state(),
            retry_connect_after,
            last_connect_attempt: Instant::now(),
            last_ping: Instant::now(),
        }
    }

    /// Initiates the handshake (or replaces a dead transport). Success is
    /// reported later through `try_recv` as `Connected`.
    pub fn connect<W>(&mut self, wakeup: &W)
    where
        W: Wakeup,
    {
        self.last_connect_attempt = Instant::now();

        if let Some(ws) = self.websocket.as_mut() {
            if let Err(e) = ws.reconnect(wakeup.clone()) {
                error!("error reconnecting to relay: {e}");
            }
            return;
        }

        match WebsocketConn::connect(self.url.clone(), wakeup.clone()) {
            Ok(conn) => self.websocket = Some(conn),
            Err(e) => error!("could not open websocket to {}: {e}", self.url),
        }
    }

    pub fn status(&self) -> RelayStatus {
        self.websocket
            .as_ref()
            .map(|ws| ws.status)
            .unwrap_or(RelayStatus::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == RelayStatus::Connected
    }

    pub fn counters(&self) -> crate::relay::ConnCounters {
        self.websocket
            .as_ref()
            .map(|ws| ws.counters)
            .unwrap_or_default()
    }

    pub fn has_member(&self, id: &SubId) -> bool {
        self.members.contains_key(id)
    }

    /// Members with a live (or pending) wire presence.
    pub fn active_subscription_ids(&self) -> Vec<SubId> {
        let mut ids: Vec<SubId> = self
            .reqs
            .values()
            .filter(|req| req.status != ReqStatus::Closed)
            .flat_map(|req| req.members.iter().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn wire_count(&self) -> usize {
        self.reqs
            .values()
            .filter(|req| req.status != ReqStatus::Closed)
            .count()
    }

    pub fn wire_of(&self, id: &SubId) -> Option<&WireId> {
        self.members.get(id)
    }

    pub fn req(&self, wire: &WireId) -> Option<&RelayReq> {
        self.reqs.get(wire)
    }

    // ---- grouping (C9) ----

    /// Adds a logical subscription, merging it into an existing REQ when
    /// the fingerprints agree and the merge rules allow; otherwise the
    /// subscription gets its own fresh wire id. REQs go out on the next
    /// [`RelayCoordinator::flush`].
    pub fn add_member(
        &mut self,
        id: SubId,
        filters: &[Filter],
        close_on_eose: bool,
    ) -> Result<()> {
        if self.members.contains_key(&id) {
            return Ok(());
        }

        if filters_json_size(filters)? > self.limits.max_json_bytes {
            return Err(Error::InvalidConfiguration {
                reason: format!(
                    "filters exceed {} byte message budget of {}",
                    self.limits.max_json_bytes, self.url
                ),
            });
        }

        let fingerprint = GroupFingerprint::of(filters, close_on_eose);

        let candidate = self.reqs.values_mut().find(|req| {
            matches!(req.status, ReqStatus::Initial | ReqStatus::Pending)
                && req.fingerprint == fingerprint
                && req.merged_filters.len() == filters.len()
                && req
                    .merged_filters
                    .iter()
                    .zip(filters)
                    .all(|(a, b)| a.is_mergeable_with(b))
        });

        if let Some(req) = candidate {
            let merged: Vec<Filter> = req
                .merged_filters
                .iter()
                .zip(filters)
                .map(|(a, b)| a.merge(b))
                .collect();

            let within_budget = filters_json_size(&merged)? <= self.limits.max_json_bytes
                && merged.len() <= self.limits.max_filters_per_req;
            if within_budget {
                trace!("merged sub {id:?} into wire {} on {}", req.wire_id, self.url);
                req.merged_filters = merged;
                req.members.insert(id);
                let wire = req.wire_id.clone();
                self.members.insert(id, wire);
                return Ok(());
            }
        }

        let wire_id = WireId::default();
        debug!("new wire req {wire_id} for sub {id:?} on {}", self.url);
        self.members.insert(id, wire_id.clone());
        self.reqs.insert(
            wire_id.clone(),
            RelayReq {
                wire_id,
                members: BTreeSet::from([id]),
                merged_filters: filters.to_vec(),
                fingerprint,
                close_on_eose,
                status: ReqStatus::Initial,
            },
        );
        Ok(())
    }

    /// Drops a member. The last member leaving a live REQ closes it on the
    /// wire.
    pub fn remove_member(&mut self, id: &SubId) {
        let Some(wire) = self.members.remove(id) else {
            return;
        };
        let Some(req) = self.reqs.get_mut(&wire) else {
            return;
        };

        req.members.remove(id);
        if !req.members.is_empty() {
            // remaining members keep the (broader) merged filters; their
            // own filter match still gates delivery
            return;
        }

        let was_live = matches!(req.status, ReqStatus::Running | ReqStatus::EoseSeen);
        req.status = ReqStatus::Closed;
        self.reqs.remove(&wire);

        if was_live {
            self.send_now(&ClientMessage::close(wire.0.clone()));
        }
    }

    /// A member's filters changed: re-merge the group and, per the update
    /// contract, issue CLOSE then REQ with the new merged filters. The
    /// tightened `since`/`until` of the merge can affect the stream, so a
    /// plain REQ replacement is not enough for every relay.
    pub fn update_member(&mut self, id: &SubId, subs: &SubscriptionStore) -> Result<()> {
        let Some(wire) = self.members.get(id).cloned() else {
            return Ok(());
        };
        let Some(req) = self.reqs.get(&wire) else {
            return Ok(());
        };

        let mut merged: Option<Vec<Filter>> = None;
        for member in &req.members {
            let Some(filters) = subs.filters(member) else {
                continue;
            };
            merged = Some(match merged {
                None => filters.to_vec(),
                Some(prev) => {
                    if prev.len() != filters.len()
                        || !prev
                            .iter()
                            .zip(filters)
                            .all(|(a, b)| a.is_mergeable_with(b))
                    {
                        return Err(Error::SubscriptionFailed {
                            reason: "updated filters no longer merge with the group".to_owned(),
                        });
                    }
                    prev.iter().zip(filters).map(|(a, b)| a.merge(b)).collect()
                }
            });
        }

        let Some(merged) = merged else {
            return Ok(());
        };
        if filters_json_size(&merged)? > self.limits.max_json_bytes {
            return Err(Error::InvalidConfiguration {
                reason: "merged filters exceed the relay message budget".to_owned(),
            });
        }

        let was_running = {
            let Some(req) = self.reqs.get_mut(&wire) else {
                return Ok(());
            };
            let was_running = matches!(req.status, ReqStatus::Running | ReqStatus::EoseSeen);
            req.merged_filters = merged;
            if !was_running {
                // not on the wire yet; the next flush picks up the change
                req.status = ReqStatus::Pending;
            }
            was_running
        };

        if was_running {
            self.send_now(&ClientMessage::close(wire.0.clone()));
            self.send_req(&wire);
        }
        Ok(())
    }

    /// Sends every REQ still waiting to go out. Down relays park them in
    /// WaitingForConnection for the reconnect replay.
    #[profiling::function]
    pub fn flush(&mut self) {
        let pending: Vec<WireId> = self
            .reqs
            .iter()
            .filter(|(_, req)| matches!(req.status, ReqStatus::Initial | ReqStatus::Pending))
            .map(|(wire, _)| wire.clone())
            .collect();

        for wire in pending {
            self.send_req(&wire);
        }
    }

    fn send_req(&mut self, wire: &WireId) {
        let connected = self
            .websocket
            .as_ref()
            .is_some_and(WebsocketConn::is_connected);

        let Some(req) = self.reqs.get_mut(wire) else {
            return;
        };

        if !connected {
            req.status = ReqStatus::WaitingForConnection;
            return;
        }

        let msg = ClientMessage::req(wire.0.clone(), req.merged_filters.clone());
        req.status = ReqStatus::Running;
        if let Some(ws) = self.websocket.as_mut() {
            if let Err(e) = ws.send(&msg) {
                warn!("REQ to {} failed: {e}", self.url);
                if let Some(req) = self.reqs.get_mut(wire) {
                    req.status = ReqStatus::WaitingForConnection;
                }
            }
        }
    }

    fn send_now(&mut self, msg: &ClientMessage) {
        let Some(ws) = self.websocket.as_mut() else {
            return;
        };
        if !ws.is_connected() {
            return;
        }
        if let Err(e) = ws.send(msg) {
            warn!("send to {} failed: {e}", self.url);
        }
    }

    /// Queues (or sends) an outgoing EVENT frame.
    pub fn send_event(&mut self, event: Event) {
        self.queue
            .broadcast(self.websocket.as_mut(), EventClientMessage { event });
    }

    // ---- receive path (C4) ----

    /// Drains at most one websocket event. State transitions are emitted
    /// exactly once: the status guard swallows duplicate Closed/Error
    /// frames from the transport.
    #[profiling::function]
    pub fn try_recv(&mut self) -> Recv {
        let Some(ws) = self.websocket.as_mut() else {
            return Recv::Empty;
        };

        let Some(event) = ws.receiver.try_recv() else {
            return Recv::Empty;
        };

        match event {
            WsEvent::Opened => {
                ws.set_status(RelayStatus::Connected);
                self.retry.reset();
                self.retry_connect_after = self.retry.policy().initial_delay;
                let handshake = Instant::now().saturating_duration_since(self.last_connect_attempt);
                debug!("connected to {} in {handshake:?}", self.url);

                self.queue.try_flush(self.websocket.as_mut());
                Recv::Item(CoordRecv::Connected { handshake })
            }
            WsEvent::Closed => self.handle_disconnect("closed by peer"),
            WsEvent::Error(err) => {
                error!("relay {} error: {err}", self.url);
                self.handle_disconnect("transport error")
            }
            WsEvent::Message(ws_msg) => match ws_msg {
                WsMessage::Ping(payload) => {
                    ws.pong(payload);
                    Recv::Consumed
                }
                WsMessage::Text(text) => {
                    ws.counters.frames_received += 1;
                    ws.counters.bytes_received += text.len() as u64;
                    self.handle_text(&text)
                }
                _ => Recv::Consumed,
            },
        }
    }

    fn handle_disconnect(&mut self, why: &str) -> Recv {
        let Some(ws) = self.websocket.as_mut() else {
            return Recv::Consumed;
        };
        if ws.status == RelayStatus::Disconnected {
            // transition already reported
            return Recv::Consumed;
        }
        debug!("disconnected from {} ({why})", self.url);
        ws.set_status(RelayStatus::Disconnected);
        self.park_live_reqs();
        Recv::Item(CoordRecv::Disconnected)
    }

    /// Live streams will need a fresh REQ once the socket is back.
    fn park_live_reqs(&mut self) {
        for req in self.reqs.values_mut() {
            if matches!(req.status, ReqStatus::Running | ReqStatus::EoseSeen) {
                req.status = ReqStatus::WaitingForConnection;
            }
        }
    }

    /// Parse errors are logged and the frame dropped; the socket stays up.
    fn handle_text(&mut self, text: &str) -> Recv {
        let msg = match RelayMessage::from_json(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("relay {} frame dropped: {err}", self.url);
                return Recv::Consumed;
            }
        };

        match msg {
            RelayMessage::Event { sub_id, event_json } => {
                let members = match sub_id {
                    None => None,
                    Some(sid) => match self.reqs.get(sid.as_str()) {
                        Some(req) => Some(req.members.iter().copied().collect()),
                        None => {
                            trace!("event for unknown wire id {sid} from {}", self.url);
                            return Recv::Consumed;
                        }
                    },
                };
                Recv::Item(CoordRecv::Event {
                    members,
                    event_json: event_json.to_owned(),
                })
            }
            RelayMessage::Eose(sid) => {
                let Some(req) = self.reqs.get_mut(sid.as_str()) else {
                    trace!("EOSE for unknown wire id {sid} from {}", self.url);
                    return Recv::Consumed;
                };
                debug!("EOSE for {sid} from {}", self.url);
                req.status = ReqStatus::EoseSeen;
                let members: Vec<SubId> = req.members.iter().copied().collect();

                if req.close_on_eose {
                    let wire = req.wire_id.clone();
                    for member in &members {
                        self.members.remove(member);
                    }
                    self.reqs.remove(&wire);
                    self.send_now(&ClientMessage::close(wire.0.clone()));
                }
                Recv::Item(CoordRecv::Eose { members })
            }
            RelayMessage::OK(result) => Recv::Item(CoordRecv::Ok {
                event_id: result.event_id,
                accepted: result.accepted,
                message: result.message,
            }),
            RelayMessage::Notice(notice) => {
                warn!("notice from {}: {notice}", self.url);
                Recv::Consumed
            }
            RelayMessage::Auth(challenge) => Recv::Item(CoordRecv::AuthChallenge(challenge)),
            RelayMessage::Count { sub_id, count } => {
                let Some(req) = self.reqs.get(sub_id.as_str()) else {
                    return Recv::Consumed;
                };
                Recv::Item(CoordRecv::Count {
                    members: req.members.iter().copied().collect(),
                    count,
                })
            }
            RelayMessage::Closed { sub_id, message } => {
                let Some(req) = self.reqs.get_mut(sub_id.as_str()) else {
                    return Recv::Consumed;
                };
                warn!("relay {} closed req {sub_id}: {message}", self.url);
                req.status = ReqStatus::Closed;
                let members: Vec<SubId> = req.members.iter().copied().collect();
                let wire = req.wire_id.clone();
                for member in &members {
                    self.members.remove(member);
                }
                self.reqs.remove(&wire);
                Recv::Item(CoordRecv::SubsClosed { members, message })
            }
        }
    }

    /// Orderly shutdown: the transport closes, live REQs park in case the
    /// relay is re-added later.
    pub fn disconnect(&mut self) {
        self.park_live_reqs();
        if let Some(ws) = self.websocket.as_mut() {
            ws.close();
        }
    }

    /// Re-sends every REQ parked on the connection, in one pass; EOSE'd
    /// close-on-eose reqs were already dropped and are never replayed.
    /// Merged filters are recomputed from the members' current filters
    /// first, so since-optimized subscriptions replay only the gap.
    /// Returns the member subscriptions whose streams restarted.
    pub fn replay(&mut self, subs: &SubscriptionStore) -> Vec<SubId> {
        let waiting: Vec<WireId> = self
            .reqs
            .iter()
            .filter(|(_, req)| req.status == ReqStatus::WaitingForConnection)
            .map(|(wire, _)| wire.clone())
            .collect();

        let mut replayed = Vec::new();
        for wire in waiting {
            if let Some(req) = self.reqs.get_mut(&wire) {
                replayed.extend(req.members.iter().copied());
                if let Some(merged) = remerge_members(req, subs) {
                    req.merged_filters = merged;
                }
            }
            self.send_req(&wire);
        }
        replayed.sort_unstable();
        replayed.dedup();
        replayed
    }

    // ---- timers ----

    /// Reconnect backoff and keepalive, driven from the pool's drive pass.
    pub fn tick<W>(&mut self, now: Instant, keepalive: Duration, wakeup: &W)
    where
        W: Wakeup,
    {
        match self.status() {
            RelayStatus::Disconnected => {
                let due = self.last_connect_attempt + self.retry_connect_after;
                if now < due {
                    return;
                }
                let next = self.retry.next_delay().unwrap_or(self.retry_connect_after);
                debug!(
                    "retrying connect to {} (next attempt in {:?})",
                    self.url, next
                );
                self.retry_connect_after = next;
                self.connect(wakeup);
            }
            RelayStatus::Connected => {
                if now.saturating_duration_since(self.last_ping) > keepalive {
                    trace!("pinging {}", self.url);
                    if let Some(ws) = self.websocket.as_mut() {
                        ws.ping();
                    }
                    self.last_ping = now;
                }
            }
            RelayStatus::Connecting | RelayStatus::Disconnecting => {}
        }
    }

}

fn filters_json_size(filters: &[Filter]) -> Result<usize> {
    let mut total = 0;
    for filter in filters {
        total += filter.json()?.len();
    }
    Ok(total)
}

/// Fresh pairwise merge of a req's member filters; None when a member is
/// gone or the filters have drifted out of mergeability (the previous,
/// broader merge stays in place then).
fn remerge_members(req: &RelayReq, subs: &SubscriptionStore) -> Option<Vec<Filter>> {
    let mut merged: Option<Vec<Filter>> = None;
    for member in &req.members {
        let filters = subs.filters(member)?;
        merged = Some(match merged {
            None => filters.to_vec(),
            Some(prev) => {
                if prev.len() != filters.len()
                    || !prev
                        .iter()
                        .zip(filters)
                        .all(|(a, b)| a.is_mergeable_with(b))
                {
                    return None;
                }
                prev.iter().zip(filters).map(|(a, b)| a.merge(b)).collect()
            }
        });
    }
    merged
}
