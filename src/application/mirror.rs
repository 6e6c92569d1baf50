//! Client-side mirror of relayed updates.
//!
//! Each event name gets an [`InboundMatcher`] holding an ordered list of
//! subscriptions. A relayed `(criteria, value)` pair is handed to every
//! subscription whose criteria test accepts it. Dispatchers reuse the same
//! structure for server-local interest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use serde_json::Value;
use subsocket_wire::{Criteria, RelayFrame};
use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::lock::mutex_lock;

const SOURCE: &str = "application::mirror";

pub type CriteriaTest = Arc<dyn Fn(&[String]) -> bool + Send + Sync>;
pub type UpdateCallback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("matcher for `{event}` has no outbound connection")]
    Detached { event: String },
    #[error("outbound connection closed")]
    Closed,
    #[error("malformed relay frame: {0}")]
    Frame(#[from] serde_json::Error),
}

/// Sink for updates a client pushes to the server.
pub trait Outbound: Send + Sync {
    fn send(&self, frame: RelayFrame) -> Result<(), MirrorError>;
}

struct SubscriptionInner {
    id: u64,
    test: Option<CriteriaTest>,
    on_update: UpdateCallback,
}

impl SubscriptionInner {
    fn accepts(&self, criteria: &[String]) -> bool {
        self.test.as_ref().is_none_or(|test| test(criteria))
    }
}

/// Handle to one registered interest.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
    matcher: Weak<MatcherInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn matches(&self, criteria: &[String]) -> bool {
        self.inner.accepts(criteria)
    }

    /// Remove this subscription from its matcher. Returns false when it was
    /// already removed or the matcher is gone.
    pub fn off(&self) -> bool {
        match self.matcher.upgrade() {
            Some(matcher) => matcher.remove_id(self.inner.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("filtered", &self.inner.test.is_some())
            .finish()
    }
}

struct MatcherInner {
    event: String,
    subscriptions: Mutex<Vec<Arc<SubscriptionInner>>>,
    next_id: AtomicU64,
    outbound: Option<Arc<dyn Outbound>>,
}

impl MatcherInner {
    fn remove_id(&self, id: u64) -> bool {
        let mut subscriptions = mutex_lock(&self.subscriptions, SOURCE, "remove");
        match subscriptions.iter().position(|sub| sub.id == id) {
            Some(index) => {
                subscriptions.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Per-event list of subscriptions.
#[derive(Clone)]
pub struct InboundMatcher {
    inner: Arc<MatcherInner>,
}

impl InboundMatcher {
    /// A matcher that only delivers locally and cannot push updates.
    pub fn detached(event: impl Into<String>) -> Self {
        Self::build(event.into(), None)
    }

    pub fn connected(event: impl Into<String>, outbound: Arc<dyn Outbound>) -> Self {
        Self::build(event.into(), Some(outbound))
    }

    fn build(event: String, outbound: Option<Arc<dyn Outbound>>) -> Self {
        Self {
            inner: Arc::new(MatcherInner {
                event,
                subscriptions: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                outbound,
            }),
        }
    }

    pub fn event(&self) -> &str {
        &self.inner.event
    }

    /// Subscribe to every update of this event.
    pub fn add<F>(&self, on_update: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.insert(Arc::new(on_update), None)
    }

    /// Subscribe to updates whose criteria pass `test`.
    pub fn add_matching<F, T>(&self, on_update: F, test: T) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
        T: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.insert(Arc::new(on_update), Some(Arc::new(test)))
    }

    fn insert(&self, on_update: UpdateCallback, test: Option<CriteriaTest>) -> Subscription {
        let inner = Arc::new(SubscriptionInner {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            test,
            on_update,
        });
        mutex_lock(&self.inner.subscriptions, SOURCE, "add").push(Arc::clone(&inner));
        Subscription {
            inner,
            matcher: Arc::downgrade(&self.inner),
        }
    }

    pub fn remove(&self, subscription: &Subscription) -> bool {
        self.inner.remove_id(subscription.id())
    }

    pub fn remove_all(&self) -> usize {
        let mut subscriptions = mutex_lock(&self.inner.subscriptions, SOURCE, "remove_all");
        let removed = subscriptions.len();
        subscriptions.clear();
        removed
    }

    /// Drop every subscription that currently accepts `criteria`.
    pub fn remove_matching(&self, criteria: &[String]) -> usize {
        let mut subscriptions =
            mutex_lock(&self.inner.subscriptions, SOURCE, "remove_matching");
        let before = subscriptions.len();
        subscriptions.retain(|sub| !sub.accepts(criteria));
        before - subscriptions.len()
    }

    /// Deliver a relayed update. Returns how many subscriptions accepted it.
    pub fn receive(&self, criteria: &[String], value: &Value) -> usize {
        let delivered = self.deliver(criteria, value);
        trace!(event = %self.inner.event, delivered, "relayed update delivered");
        delivered
    }

    /// Deliver an update known locally, ahead of any server relay.
    pub fn emit_local_update(&self, criteria: &[String], value: &Value) -> usize {
        let delivered = self.deliver(criteria, value);
        debug!(event = %self.inner.event, delivered, "local update emitted");
        delivered
    }

    /// Push an update for this event to the server.
    pub fn send_update(&self, criteria: Criteria, value: Value) -> Result<(), MirrorError> {
        let outbound = self
            .inner
            .outbound
            .as_ref()
            .ok_or_else(|| MirrorError::Detached {
                event: self.inner.event.clone(),
            })?;
        outbound.send(RelayFrame::new(self.inner.event.clone(), criteria, value))
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.subscriptions, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deliver(&self, criteria: &[String], value: &Value) -> usize {
        // Callbacks run outside the lock so they may subscribe or unsubscribe.
        let subscriptions: Vec<Arc<SubscriptionInner>> =
            mutex_lock(&self.inner.subscriptions, SOURCE, "deliver").clone();
        let mut delivered = 0;
        for sub in subscriptions.iter().filter(|sub| sub.accepts(criteria)) {
            (sub.on_update)(value);
            delivered += 1;
        }
        delivered
    }
}

/// All matchers a connected client holds, keyed by qualified event name.
pub struct ClientMirror {
    outbound: Arc<dyn Outbound>,
    matchers: DashMap<String, InboundMatcher>,
}

impl ClientMirror {
    pub fn new(outbound: Arc<dyn Outbound>) -> Self {
        Self {
            outbound,
            matchers: DashMap::new(),
        }
    }

    /// The matcher for `event`, created on first use.
    pub fn matcher(&self, event: &str) -> InboundMatcher {
        self.matchers
            .entry(event.to_string())
            .or_insert_with(|| InboundMatcher::connected(event, Arc::clone(&self.outbound)))
            .clone()
    }

    /// Route a relayed frame to its matcher. Frames for events nobody
    /// listens to are dropped.
    pub fn handle_frame(&self, frame: &RelayFrame) -> usize {
        let matcher = self.matchers.get(&frame.event).map(|entry| entry.clone());
        match matcher {
            Some(matcher) => matcher.receive(&frame.criteria, &frame.data),
            None => {
                trace!(event = %frame.event, "no local interest in relayed event");
                0
            }
        }
    }

    pub fn handle_text(&self, text: &str) -> Result<usize, MirrorError> {
        let frame: RelayFrame = serde_json::from_str(text)?;
        Ok(self.handle_frame(&frame))
    }
}
