use crate::relay::SubId;
use crate::{Error, Event};

use crossbeam_channel::Sender;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::trace;

/// What a subscription's update stream yields.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    Event(Event),
    /// The EOSE quorum was reached. Emitted at most once.
    Eose,
    Error(String),
}

/// Control messages handles push back into the pool; drained on the next
/// `drive` pass.
#[derive(Debug, Clone, Copy)]
pub enum PoolControl {
    CloseSubscription(SubId),
    CancelPublish(crate::EventId),
}

struct Buffers {
    events: VecDeque<Event>,
    updates: VecDeque<SubscriptionUpdate>,
    eose_seen: bool,
    closed: bool,
    dropped: u64,
}

/// The bounded bridge between the pool task and one consumer. The pool
/// side never blocks: when a consumer lags past capacity the oldest
/// buffered event is discarded (drop-oldest, counted). Consumers may block.
pub struct SubChannel {
    buffers: Mutex<Buffers>,
    ready: Condvar,
    capacity: usize,
}

impl SubChannel {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Buffers {
                events: VecDeque::new(),
                updates: VecDeque::new(),
                eose_seen: false,
                closed: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Buffers> {
        match self.buffers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ---- pool side ----

    pub(crate) fn push_event(&self, event: Event) {
        let mut buffers = self.lock();
        if buffers.closed {
            return;
        }
        if buffers.events.len() >= self.capacity {
            buffers.events.pop_front();
            buffers.dropped += 1;
        }
        if buffers.updates.len() >= self.capacity {
            buffers.updates.pop_front();
            buffers.dropped += 1;
        }
        buffers.events.push_back(event.clone());
        buffers.updates.push_back(SubscriptionUpdate::Event(event));
        drop(buffers);
        self.ready.notify_all();
    }

    pub(crate) fn push_eose(&self) {
        let mut buffers = self.lock();
        if buffers.closed || buffers.eose_seen {
            return;
        }
        buffers.eose_seen = true;
        buffers.updates.push_back(SubscriptionUpdate::Eose);
        drop(buffers);
        self.ready.notify_all();
    }

    pub(crate) fn push_error(&self, error: &Error) {
        let mut buffers = self.lock();
        if buffers.closed {
            return;
        }
        buffers
            .updates
            .push_back(SubscriptionUpdate::Error(format!(
                "{}.{}: {error}",
                error.category(),
                error.code()
            )));
        drop(buffers);
        self.ready.notify_all();
    }

    /// Terminates both sequences; buffered items stay readable.
    pub(crate) fn close(&self) {
        let mut buffers = self.lock();
        buffers.closed = true;
        drop(buffers);
        self.ready.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    // ---- consumer side ----

    /// Next event; blocks until one arrives or the subscription closes.
    pub fn recv_event(&self) -> Option<Event> {
        let mut buffers = self.lock();
        loop {
            if let Some(event) = buffers.events.pop_front() {
                return Some(event);
            }
            if buffers.closed {
                return None;
            }
            buffers = match self.ready.wait(buffers) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn try_recv_event(&self) -> Option<Event> {
        self.lock().events.pop_front()
    }

    pub fn recv_update(&self) -> Option<SubscriptionUpdate> {
        let mut buffers = self.lock();
        loop {
            if let Some(update) = buffers.updates.pop_front() {
                return Some(update);
            }
            if buffers.closed {
                return None;
            }
            buffers = match self.ready.wait(buffers) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn try_recv_update(&self) -> Option<SubscriptionUpdate> {
        self.lock().updates.pop_front()
    }

    /// Blocks until the EOSE quorum is first reached or the subscription
    /// closes. Resolves exactly once per subscription lifetime; subsequent
    /// calls return immediately.
    pub fn wait_for_eose(&self, timeout: Option<Duration>) -> bool {
        let mut buffers = self.lock();
        loop {
            if buffers.eose_seen || buffers.closed {
                return buffers.eose_seen;
            }
            match timeout {
                None => {
                    buffers = match self.ready.wait(buffers) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                Some(t) => {
                    let (guard, res) = match self.ready.wait_timeout(buffers, t) {
                        Ok(pair) => pair,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    buffers = guard;
                    if res.timed_out() {
                        return buffers.eose_seen;
                    }
                }
            }
        }
    }

    /// Events discarded because the consumer lagged.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

/// A caller's grip on one logical subscription: a lazy event sequence, an
/// update sequence, and close control. Not clonable; dropping the handle
/// closes the subscription.
pub struct SubscriptionHandle {
    id: SubId,
    channel: Arc<SubChannel>,
    control: Sender<PoolControl>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: SubId, channel: Arc<SubChannel>, control: Sender<PoolControl>) -> Self {
        Self {
            id,
            channel,
            control,
        }
    }

    pub fn id(&self) -> SubId {
        self.id
    }

    /// The event sequence. Iterating drains the internal buffer; one
    /// consumer at a time.
    pub fn events(&self) -> EventIter<'_> {
        EventIter { handle: self }
    }

    /// Non-blocking variant of one `events()` step.
    pub fn try_next(&self) -> Option<Event> {
        self.channel.try_recv_event()
    }

    /// The tagged update sequence: events, the EOSE marker, errors.
    pub fn updates(&self) -> UpdateIter<'_> {
        UpdateIter { handle: self }
    }

    pub fn try_next_update(&self) -> Option<SubscriptionUpdate> {
        self.channel.try_recv_update()
    }

    /// See [`SubChannel::wait_for_eose`].
    pub fn wait_for_eose(&self, timeout: Option<Duration>) -> bool {
        self.channel.wait_for_eose(timeout)
    }

    pub fn dropped_events(&self) -> u64 {
        self.channel.dropped()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Ends the subscription: wire CLOSEs go out on the next drive pass,
    /// and both sequences terminate after the buffered tail.
    pub fn close(&self) {
        let _ = self.control.send(PoolControl::CloseSubscription(self.id));
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        trace!("subscription handle {:?} dropped, closing", self.id);
        let _ = self.control.send(PoolControl::CloseSubscription(self.id));
    }
}

pub struct EventIter<'a> {
    handle: &'a SubscriptionHandle,
}

impl Iterator for EventIter<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.handle.channel.recv_event()
    }
}

pub struct UpdateIter<'a> {
    handle: &'a SubscriptionHandle,
}

impl Iterator for UpdateIter<'_> {
    type Item = SubscriptionUpdate;

    fn next(&mut self) -> Option<SubscriptionUpdate> {
        self.handle.channel.recv_update()
    }
}
