//! Event dispatch: typed subscriptions over inbound event frames

use crate::{
    error::AmiError,
    frame::Frame,
};
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Which events a subscription receives.
///
/// Names compare case-insensitively. `"*"` parses to [`Any`](Self::Any) and
/// a trailing `*` to [`Prefix`](Self::Prefix).
///
/// ```
/// use asterisk_ami_tokio::EventPattern;
///
/// assert_eq!(EventPattern::from("*"), EventPattern::Any);
/// assert_eq!(
///     EventPattern::from("Confbridge*"),
///     EventPattern::Prefix("Confbridge".into())
/// );
/// assert!(EventPattern::from("Confbridge*").matches("ConfbridgeJoin"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    /// Every event.
    Any,
    /// Exactly this event name.
    Name(String),
    /// Event names starting with this prefix.
    Prefix(String),
}

impl EventPattern {
    /// Exact-name pattern.
    pub fn name(name: impl Into<String>) -> Self {
        EventPattern::Name(name.into())
    }

    pub fn matches(&self, event_name: &str) -> bool {
        match self {
            EventPattern::Any => true,
            EventPattern::Name(name) => name.eq_ignore_ascii_case(event_name),
            EventPattern::Prefix(prefix) => event_name
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix)),
        }
    }
}

impl From<&str> for EventPattern {
    fn from(s: &str) -> Self {
        match s.strip_suffix('*') {
            Some("") => EventPattern::Any,
            Some(prefix) => EventPattern::Prefix(prefix.to_string()),
            None => EventPattern::Name(s.to_string()),
        }
    }
}

/// Handle returned by [`EventDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Frame) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    pattern: EventPattern,
    handler: Handler,
}

/// Routes event frames to subscribers.
///
/// Handlers run synchronously on the connection's read task, in
/// registration order. They must not block; hand work off to a channel or a
/// spawned task instead.
pub struct EventDispatcher {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscriptions", &self.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for events matching `pattern`.
    pub fn subscribe<F>(&self, pattern: impl Into<EventPattern>, handler: F) -> SubscriptionId
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let id = SubscriptionId(
            self.next_id
                .fetch_add(1, Ordering::Relaxed),
        );
        let pattern = pattern.into();
        trace!("Subscription {:?} registered for {:?}", id, pattern);
        self.subscriptions
            .write()
            .push(Subscription {
                id,
                pattern,
                handler: Arc::new(handler),
            });
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Deliver an event frame to every matching handler. Returns how many ran.
    ///
    /// Handlers are collected first and invoked without the lock held, so a
    /// handler may subscribe or unsubscribe.
    pub fn dispatch(&self, frame: &Frame) -> usize {
        let Some(name) = frame.event_name() else {
            return 0;
        };
        let handlers: Vec<Handler> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| {
                s.pattern
                    .matches(name)
            })
            .map(|s| s.handler.clone())
            .collect();

        for handler in &handlers {
            handler(frame);
        }
        handlers.len()
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe a bounded channel and return it as a stream.
    ///
    /// When the consumer falls behind, events are dropped and a single
    /// `Err(AmiError::QueueFull)` is queued once space frees up.
    pub fn stream(
        self: &Arc<Self>,
        pattern: impl Into<EventPattern>,
        capacity: usize,
    ) -> AmiEventStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let state = Arc::new(StreamState {
            overflow: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let handler_state = state.clone();
        let id = self.subscribe(pattern, move |frame| {
            forward_event(&tx, &handler_state, frame);
        });

        AmiEventStream {
            rx,
            state,
            subscription: id,
            dispatcher: Arc::downgrade(self),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

struct StreamState {
    overflow: AtomicBool,
    dropped: AtomicU64,
}

/// try_send the event; on a full queue drop it and remember to report the
/// overflow ahead of the next delivered event.
fn forward_event(tx: &mpsc::Sender<Result<Frame, AmiError>>, state: &StreamState, frame: &Frame) {
    if state
        .overflow
        .load(Ordering::Relaxed)
    {
        match tx.try_send(Err(AmiError::QueueFull)) {
            Ok(()) => state
                .overflow
                .store(false, Ordering::Relaxed),
            Err(mpsc::error::TrySendError::Closed(_)) => return,
            Err(mpsc::error::TrySendError::Full(_)) => {}
        }
    }

    match tx.try_send(Ok(frame.clone())) {
        Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            state
                .overflow
                .store(true, Ordering::Relaxed);
            state
                .dropped
                .fetch_add(1, Ordering::Relaxed);
            warn!("Event queue full, dropping event");
        }
    }
}

/// Event receiver backed by a dispatcher subscription.
///
/// Dropping the stream unsubscribes it.
pub struct AmiEventStream {
    rx: mpsc::Receiver<Result<Frame, AmiError>>,
    state: Arc<StreamState>,
    subscription: SubscriptionId,
    dispatcher: Weak<EventDispatcher>,
}

impl std::fmt::Debug for AmiEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiEventStream")
            .field("subscription", &self.subscription)
            .field("dropped", &self.dropped_event_count())
            .finish()
    }
}

impl AmiEventStream {
    /// Receive the next event, or `None` once the dispatcher is gone.
    ///
    /// `Err(AmiError::QueueFull)` is a one-time notice per overflow episode.
    pub async fn recv(&mut self) -> Option<Result<Frame, AmiError>> {
        self.rx
            .recv()
            .await
    }

    /// Events dropped because the queue was full.
    pub fn dropped_event_count(&self) -> u64 {
        self.state
            .dropped
            .load(Ordering::Relaxed)
    }
}

impl Drop for AmiEventStream {
    fn drop(&mut self) {
        if let Some(dispatcher) = self
            .dispatcher
            .upgrade()
        {
            dispatcher.unsubscribe(self.subscription);
        }
    }
}

impl futures_util::Stream for AmiEventStream {
    type Item = Result<Frame, AmiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}
