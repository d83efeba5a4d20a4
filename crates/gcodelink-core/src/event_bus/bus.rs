//! Mailboxes and listener registries.
//!
//! Each actor owns one [`Mailbox`]: an unbounded FIFO drained by the actor
//! itself. Other actors hold a cloneable [`MailboxSender`] and enqueue into
//! it. Fan-out is done through a [`ListenerRegistry`], a map from actor id to
//! the sink that reaches that actor. The registry never owns the actors it
//! points at, so teardown order is unconstrained.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::events::{ActorId, Event, EventKind, Payload};

/// Anything an event can be delivered into
///
/// Delivery is fire-and-forget. `deliver` returns false once the receiving
/// side is gone, which lets registries prune dead listeners.
pub trait EventSink: Send + Sync {
    /// Enqueue an event
    fn deliver(&self, event: Event) -> bool;
}

impl EventSink for Sender<Event> {
    fn deliver(&self, event: Event) -> bool {
        self.send(event).is_ok()
    }
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<Event> {
    fn deliver(&self, event: Event) -> bool {
        self.send(event).is_ok()
    }
}

/// Error returned when every sender of a mailbox has been dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("mailbox closed")]
pub struct MailboxClosed;

/// Create a mailbox for `owner` together with its first sender
pub fn mailbox(owner: ActorId) -> (MailboxSender, Mailbox) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (MailboxSender { owner, tx }, Mailbox { owner, rx })
}

/// Receiving half of an actor's event queue
#[derive(Debug)]
pub struct Mailbox {
    owner: ActorId,
    rx: Receiver<Event>,
}

impl Mailbox {
    /// Id of the owning actor
    pub fn owner(&self) -> ActorId {
        self.owner
    }

    /// Wait up to `timeout` for the next event
    ///
    /// Returns `Ok(None)` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Event>, MailboxClosed> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(MailboxClosed),
        }
    }

    /// Take the next event if one is queued
    pub fn try_recv(&self) -> Result<Option<Event>, MailboxClosed> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(MailboxClosed),
        }
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Sending half of an actor's event queue
#[derive(Debug, Clone)]
pub struct MailboxSender {
    owner: ActorId,
    tx: Sender<Event>,
}

impl MailboxSender {
    /// Id of the actor this sender reaches
    pub fn owner(&self) -> ActorId {
        self.owner
    }

    /// Append an event to the owner's mailbox
    pub fn add_event(&self, kind: EventKind, payload: Payload, sender: ActorId) -> bool {
        self.deliver(Event::new(kind, payload, sender))
    }
}

impl EventSink for MailboxSender {
    fn deliver(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Directed registry of listeners (actor id -> sink)
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<Vec<(ActorId, Arc<dyn EventSink>)>>>,
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, replacing any previous sink for the same id
    pub fn add_listener(&self, id: ActorId, sink: Arc<dyn EventSink>) {
        let mut listeners = self.listeners.write();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.push((id, sink));
        tracing::debug!("Listener {} added", id);
    }

    /// Deregister a listener
    ///
    /// Returns true if the listener was registered.
    pub fn remove_listener(&self, id: ActorId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if removed {
            tracing::debug!("Listener {} removed", id);
        }
        removed
    }

    /// True if `id` is registered
    pub fn contains(&self, id: ActorId) -> bool {
        self.listeners.read().iter().any(|(existing, _)| *existing == id)
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// True if no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Enqueue `event` into every listener's mailbox
    ///
    /// Listeners whose receiving side is gone are pruned. Returns the number
    /// of listeners the event reached.
    pub fn notify(&self, event: &Event) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sink) in self.listeners.read().iter() {
            if sink.deliver(event.clone()) {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }
        if !dead.is_empty() {
            let mut listeners = self.listeners.write();
            listeners.retain(|(id, _)| !dead.contains(id));
            tracing::debug!("Pruned {} closed listener(s)", dead.len());
        }
        delivered
    }

    /// Build an event from `owner` and fan it out
    pub fn notify_listeners(&self, owner: ActorId, kind: EventKind, payload: Payload) -> usize {
        self.notify(&Event::new(kind, payload, owner))
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<ActorId> = self.listeners.read().iter().map(|(id, _)| *id).collect();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &ids)
            .finish()
    }
}
