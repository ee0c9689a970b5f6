//! Typed events emitted by the transport and the bus that delivers them.
//!
//! Every subscription is its own unbounded channel, so a slow consumer never
//! causes another one to miss events and each consumer sees frames in wire
//! order.

use crate::types::{ServerPart, ToolCall, ToolCallCancellation};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Identifies one WebSocket connection of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A decoded block of 16-bit mono PCM from the model.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseInfo {
    pub connection: ConnectionId,
    pub code: Option<u16>,
    pub reason: String,
    /// True when the close came from a local `disconnect`.
    pub local: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// The socket is established; setup has not been acknowledged yet.
    Open(ConnectionId),
    SetupComplete,
    Audio(AudioChunk),
    /// Non-audio parts of a model turn (text, executable code, ...).
    Content(Vec<ServerPart>),
    ToolCall(ToolCall),
    ToolCallCancellation(ToolCallCancellation),
    TurnComplete,
    /// The in-flight turn was cut short; queued playback must be dropped.
    Interrupted,
    /// The service refused the configured voice.
    VoiceError(String),
    /// Always the last event of a connection.
    Close(CloseInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    SetupComplete,
    Audio,
    Content,
    ToolCall,
    ToolCallCancellation,
    TurnComplete,
    Interrupted,
    VoiceError,
    Close,
}

impl LiveEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LiveEvent::Open(_) => EventKind::Open,
            LiveEvent::SetupComplete => EventKind::SetupComplete,
            LiveEvent::Audio(_) => EventKind::Audio,
            LiveEvent::Content(_) => EventKind::Content,
            LiveEvent::ToolCall(_) => EventKind::ToolCall,
            LiveEvent::ToolCallCancellation(_) => EventKind::ToolCallCancellation,
            LiveEvent::TurnComplete => EventKind::TurnComplete,
            LiveEvent::Interrupted => EventKind::Interrupted,
            LiveEvent::VoiceError(_) => EventKind::VoiceError,
            LiveEvent::Close(_) => EventKind::Close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    /// `None` means every kind.
    kinds: Option<Vec<EventKind>>,
    tx: mpsc::UnboundedSender<LiveEvent>,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().is_none_or(|k| k.contains(&kind))
    }
}

/// Fan-out of transport events to any number of subscribers.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the given event kinds only.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.add(Some(kinds.to_vec()))
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.add(None)
    }

    fn add(&self, kinds: Option<Vec<EventKind>>) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(Subscriber { id, kinds, tx });
        Subscription { id, rx }
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Delivers `event` to every interested subscriber, pruning dropped ones.
    pub fn publish(&self, event: LiveEvent) {
        let kind = event.kind();
        self.lock().retain(|s| {
            if !s.wants(kind) {
                return true;
            }
            if s.tx.send(event.clone()).is_err() {
                debug!(subscription = s.id.0, "Pruning dropped subscription");
                return false;
            }
            true
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        // A panic while holding this lock cannot leave the list inconsistent.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<LiveEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next event; `None` once the bus is gone or unsubscribed.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        self.rx.try_recv().ok()
    }
}
