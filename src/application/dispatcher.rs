//! Binding of one `namespace:event` to its value source and relay.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use subsocket_wire::{Criteria, RelayFrame, qualify};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::application::mirror::{InboundMatcher, Subscription};
use crate::application::transport::{Broadcaster, Origin};
use crate::cache::{BuildError, CacheNode, Resolved};
use crate::domain::{ApplyError, ErrorReason, SubsocketError};

pub(crate) const METRIC_RELAY: &str = "subsocket_relay_total";
pub(crate) const METRIC_MUTATION_REJECTED: &str = "subsocket_mutation_rejected_total";
pub(crate) const METRIC_MUTATION_MS: &str = "subsocket_mutation_ms";

/// Caller-supplied business logic run against the current value of a
/// mutation target. Changes made to `current` are written back to the cache.
#[async_trait]
pub trait ApplyMutation: Send + Sync {
    async fn apply(
        &self,
        current: &mut Value,
        new_data: &Value,
        criteria: &[String],
    ) -> Result<(), ApplyError>;
}

struct SyncApply<F> {
    f: F,
}

#[async_trait]
impl<F> ApplyMutation for SyncApply<F>
where
    F: Fn(&mut Value, &Value, &[String]) -> Result<(), ApplyError> + Send + Sync,
{
    async fn apply(
        &self,
        current: &mut Value,
        new_data: &Value,
        criteria: &[String],
    ) -> Result<(), ApplyError> {
        (self.f)(current, new_data, criteria)
    }
}

struct AsyncApply<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ApplyMutation for AsyncApply<F, Fut>
where
    F: Fn(Value, Value, Criteria) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ApplyError>> + Send,
{
    async fn apply(
        &self,
        current: &mut Value,
        new_data: &Value,
        criteria: &[String],
    ) -> Result<(), ApplyError> {
        let updated = (self.f)(current.take(), new_data.clone(), criteria.to_vec()).await?;
        *current = updated;
        Ok(())
    }
}

/// Apply logic that edits the cached value in place.
pub fn apply_with<F>(f: F) -> Arc<dyn ApplyMutation>
where
    F: Fn(&mut Value, &Value, &[String]) -> Result<(), ApplyError> + Send + Sync + 'static,
{
    Arc::new(SyncApply { f })
}

/// Apply logic that may await (for instance to persist elsewhere) and
/// returns the value to keep.
pub fn apply_async<F, Fut>(f: F) -> Arc<dyn ApplyMutation>
where
    F: Fn(Value, Value, Criteria) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ApplyError>> + Send + 'static,
{
    Arc::new(AsyncApply {
        f,
        _marker: PhantomData,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The callback ran and `value` was relayed.
    Applied { value: Value },
    /// The criteria addressed nothing; no callback ran and nothing was relayed.
    Rejected(ErrorReason),
}

impl MutationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MutationOutcome::Applied { .. })
    }
}

pub struct Dispatcher {
    event: String,
    qualified: String,
    source: CacheNode<String, Value>,
    apply: Arc<dyn ApplyMutation>,
    relay: Arc<dyn Broadcaster>,
    emit_all: bool,
    /// Held for the whole read-apply-write of a mutation. Shared by every
    /// dispatcher that writes the same source.
    write_lock: Arc<Mutex<()>>,
    local: InboundMatcher,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("event", &self.qualified)
            .field("emit_all", &self.emit_all)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub(crate) fn new(
        namespace: &str,
        event: &str,
        source: CacheNode<String, Value>,
        apply: Arc<dyn ApplyMutation>,
        relay: Arc<dyn Broadcaster>,
        emit_all: bool,
    ) -> Self {
        let qualified = qualify(namespace, event);
        Self {
            event: event.to_string(),
            local: InboundMatcher::detached(qualified.clone()),
            qualified,
            source,
            apply,
            relay,
            emit_all,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Serialize this dispatcher's mutations with every other holder of
    /// `lock`. Dispatchers over one source must share one lock, or their
    /// write-backs overwrite each other.
    pub(crate) fn with_write_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.write_lock = lock;
        self
    }

    /// Event name within its namespace.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// `namespace:event`, as carried on the wire.
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    pub fn source(&self) -> &CacheNode<String, Value> {
        &self.source
    }

    /// Read the value at `criteria`, building it on a miss. Never relays.
    pub async fn resolve(&self, criteria: &[String]) -> Result<Option<Value>, BuildError> {
        Ok(self.source.get(criteria).await?.map(Value::from))
    }

    /// Apply a mutation and relay the resulting value.
    ///
    /// Mutations of every dispatcher writing this source are serialized, so
    /// the relayed value is always the one this mutation wrote. Criteria that
    /// address a nested level rather than a value are rejected like absent
    /// ones. A failing callback propagates and nothing is written back or
    /// relayed.
    #[instrument(skip(self, origin, new_data), fields(event = %self.qualified))]
    pub async fn apply_mutation(
        &self,
        origin: Origin<'_>,
        criteria: &[String],
        new_data: Value,
    ) -> Result<MutationOutcome, SubsocketError> {
        let started = Instant::now();
        let _guard = self.write_lock.lock().await;

        let Some(mut current) = self.resolve_target(criteria).await? else {
            counter!(METRIC_MUTATION_REJECTED).increment(1);
            debug!(?criteria, "mutation target is absent");
            return Ok(MutationOutcome::Rejected(ErrorReason::invalid_criteria(
                self.qualified.clone(),
            )));
        };

        self.apply.apply(&mut current, &new_data, criteria).await?;
        self.write_back(criteria, current);

        let value = self.resolve(criteria).await?.unwrap_or(Value::Null);
        self.relay(origin, RelayFrame::new(self.qualified.clone(), criteria.to_vec(), value.clone()));

        histogram!(METRIC_MUTATION_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        Ok(MutationOutcome::Applied { value })
    }

    /// Run the apply callback directly, without the absent-target check and
    /// without relaying. An absent target is presented to the callback as
    /// `null`.
    pub async fn invoke(&self, criteria: &[String], new_data: Value) -> Result<(), SubsocketError> {
        let _guard = self.write_lock.lock().await;
        let mut current = self.resolve_target(criteria).await?.unwrap_or(Value::Null);
        self.apply.apply(&mut current, &new_data, criteria).await?;
        self.write_back(criteria, current);
        Ok(())
    }

    /// Register server-local interest in this event's relays.
    pub fn subscribe<F>(&self, on_update: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.local.add(on_update)
    }

    pub fn subscribe_matching<F, T>(&self, on_update: F, test: T) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
        T: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.local.add_matching(on_update, test)
    }

    pub fn subscriptions(&self) -> &InboundMatcher {
        &self.local
    }

    /// The non-null value a mutation may edit. Nested levels never qualify.
    async fn resolve_target(&self, criteria: &[String]) -> Result<Option<Value>, BuildError> {
        Ok(self
            .source
            .get(criteria)
            .await?
            .and_then(Resolved::into_value)
            .filter(|value| !value.is_null()))
    }

    fn write_back(&self, criteria: &[String], value: Value) {
        if !self.source.store(criteria, value) {
            debug!(
                event = %self.qualified,
                ?criteria,
                "mutation target is not cached; write-back skipped"
            );
        }
    }

    fn relay(&self, origin: Origin<'_>, frame: RelayFrame) {
        counter!(METRIC_RELAY).increment(1);
        match origin {
            Origin::Server => self.relay.broadcast_all(frame.clone()),
            Origin::Peer(peer) => {
                if self.emit_all {
                    peer.emit(frame.clone());
                }
                peer.broadcast(frame.clone());
            }
        }
        self.local.receive(&frame.criteria, &frame.data);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::application::transport::{InboundListener, PeerConnection, PeerId};
    use crate::cache::{CacheEntry, build_fn};

    #[derive(Default)]
    struct RecordingRelay {
        frames: StdMutex<Vec<RelayFrame>>,
    }

    impl Broadcaster for RecordingRelay {
        fn broadcast_all(&self, frame: RelayFrame) {
            self.frames.lock().expect("relay lock").push(frame);
        }
    }

    #[derive(Default)]
    struct RecordingPeer {
        emitted: StdMutex<Vec<RelayFrame>>,
        broadcast: StdMutex<Vec<RelayFrame>>,
    }

    impl PeerConnection for RecordingPeer {
        fn id(&self) -> PeerId {
            PeerId::nil()
        }

        fn emit(&self, frame: RelayFrame) {
            self.emitted.lock().expect("peer lock").push(frame);
        }

        fn broadcast(&self, frame: RelayFrame) {
            self.broadcast.lock().expect("peer lock").push(frame);
        }

        fn on_any(&self, _listener: InboundListener) {}
    }

    fn rooms_source() -> CacheNode<String, Value> {
        CacheNode::new(build_fn(|id: String| async move {
            if id == "missing" {
                Ok(None)
            } else {
                Ok(Some(CacheEntry::Terminal(json!({ "messages": [] }))))
            }
        }))
    }

    fn append_message() -> Arc<dyn ApplyMutation> {
        apply_with(|current, new_data, _criteria| {
            let messages = current
                .get_mut("messages")
                .and_then(Value::as_array_mut)
                .ok_or_else(|| ApplyError::message("messages must be an array"))?;
            messages.push(new_data.clone());
            Ok(())
        })
    }

    fn dispatcher(relay: Arc<RecordingRelay>, emit_all: bool) -> Dispatcher {
        Dispatcher::new("rooms", "chat", rooms_source(), append_message(), relay, emit_all)
    }

    fn criteria(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn applied_mutation_relays_post_apply_value() {
        let relay = Arc::new(RecordingRelay::default());
        let dispatcher = dispatcher(Arc::clone(&relay), false);

        let outcome = dispatcher
            .apply_mutation(Origin::Server, &criteria(&["room1"]), json!("hi"))
            .await
            .expect("mutation ok");
        assert_eq!(
            outcome,
            MutationOutcome::Applied {
                value: json!({ "messages": ["hi"] })
            }
        );

        let frames = relay.frames.lock().expect("relay lock").clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "rooms:chat");
        let fresh = dispatcher
            .resolve(&criteria(&["room1"]))
            .await
            .expect("resolve ok");
        assert_eq!(Some(frames[0].data.clone()), fresh);
    }

    #[tokio::test]
    async fn absent_target_is_rejected_without_side_effects() {
        let relay = Arc::new(RecordingRelay::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let dispatcher = Dispatcher::new(
            "rooms",
            "chat",
            rooms_source(),
            apply_with(move |_, _, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            relay.clone(),
            false,
        );

        let outcome = dispatcher
            .apply_mutation(Origin::Server, &criteria(&["missing"]), json!("v"))
            .await
            .expect("mutation ok");
        let MutationOutcome::Rejected(reason) = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(reason.status_code, 400);
        assert_eq!(reason.event, "rooms:chat");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(relay.frames.lock().expect("relay lock").is_empty());
        assert!(dispatcher.source().is_empty());
    }

    #[tokio::test]
    async fn failing_callback_relays_nothing() {
        let relay = Arc::new(RecordingRelay::default());
        let dispatcher = Dispatcher::new(
            "rooms",
            "chat",
            rooms_source(),
            apply_with(|current, _, _| {
                current["messages"] = json!(["partial"]);
                Err(ApplyError::message("database unavailable"))
            }),
            relay.clone(),
            false,
        );

        let err = dispatcher
            .apply_mutation(Origin::Server, &criteria(&["room1"]), json!("hi"))
            .await
            .expect_err("callback fails");
        assert!(matches!(err, SubsocketError::Apply(_)));
        assert!(relay.frames.lock().expect("relay lock").is_empty());
        assert_eq!(
            dispatcher.resolve(&criteria(&["room1"])).await.expect("ok"),
            Some(json!({ "messages": [] }))
        );
    }

    #[tokio::test]
    async fn peer_origin_skips_sender_unless_emit_all() {
        let relay = Arc::new(RecordingRelay::default());
        let quiet = dispatcher(Arc::clone(&relay), false);
        let peer = RecordingPeer::default();
        quiet
            .apply_mutation(Origin::Peer(&peer), &criteria(&["room1"]), json!("a"))
            .await
            .expect("ok");
        assert!(peer.emitted.lock().expect("peer lock").is_empty());
        assert_eq!(peer.broadcast.lock().expect("peer lock").len(), 1);

        let echoing = dispatcher(Arc::clone(&relay), true);
        let peer = RecordingPeer::default();
        echoing
            .apply_mutation(Origin::Peer(&peer), &criteria(&["room1"]), json!("b"))
            .await
            .expect("ok");
        assert_eq!(peer.emitted.lock().expect("peer lock").len(), 1);
        assert_eq!(peer.broadcast.lock().expect("peer lock").len(), 1);
        assert!(relay.frames.lock().expect("relay lock").is_empty());
    }

    #[tokio::test]
    async fn local_subscriptions_follow_predicates() {
        let relay = Arc::new(RecordingRelay::default());
        let dispatcher = dispatcher(relay, false);
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        dispatcher.subscribe_matching(
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            |criteria| criteria.first().is_some_and(|id| id == "room1"),
        );

        for room in ["room1", "room2", "room1"] {
            dispatcher
                .apply_mutation(Origin::Server, &criteria(&[room]), json!("x"))
                .await
                .expect("ok");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_mutations_do_not_lose_writes() {
        let relay = Arc::new(RecordingRelay::default());
        let dispatcher = Arc::new(Dispatcher::new(
            "rooms",
            "chat",
            rooms_source(),
            apply_async(|mut current, new_data, _criteria| async move {
                tokio::task::yield_now().await;
                if let Some(messages) = current["messages"].as_array_mut() {
                    messages.push(new_data);
                }
                Ok(current)
            }),
            relay,
            false,
        ));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    dispatcher
                        .apply_mutation(Origin::Server, &["room1".to_string()], json!(i))
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.expect("join").expect("ok").is_applied());
        }

        let value = dispatcher
            .resolve(&criteria(&["room1"]))
            .await
            .expect("ok")
            .expect("present");
        assert_eq!(value["messages"].as_array().map(Vec::len), Some(8));
    }

    fn slow_append() -> Arc<dyn ApplyMutation> {
        apply_async(|mut current, new_data, _criteria| async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if let Some(messages) = current["messages"].as_array_mut() {
                messages.push(new_data);
            }
            Ok(current)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn dispatchers_sharing_a_source_do_not_lose_writes() {
        let relay = Arc::new(RecordingRelay::default());
        let source = rooms_source();
        let lock = Arc::new(Mutex::new(()));
        let chat = Dispatcher::new("rooms", "chat", source.clone(), slow_append(), relay.clone(), false)
            .with_write_lock(Arc::clone(&lock));
        let announce =
            Dispatcher::new("rooms", "announce", source, slow_append(), relay, false)
                .with_write_lock(lock);

        let room = criteria(&["room1"]);
        let (a, b) = tokio::join!(
            chat.apply_mutation(Origin::Server, &room, json!("a")),
            announce.apply_mutation(Origin::Server, &room, json!("b")),
        );
        assert!(a.expect("ok").is_applied());
        assert!(b.expect("ok").is_applied());

        let value = chat.resolve(&room).await.expect("ok").expect("present");
        assert_eq!(value["messages"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn nested_levels_are_not_mutation_targets() {
        let relay = Arc::new(RecordingRelay::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let members: CacheNode<String, Value> = CacheNode::new(build_fn(|_room: String| async {
            let users = CacheNode::new(build_fn(|user: String| async move {
                Ok(Some(CacheEntry::Terminal(json!({ "user": user, "status": "offline" }))))
            }));
            Ok(Some(CacheEntry::Nested(users)))
        }));
        let presence = Dispatcher::new(
            "rooms",
            "presence",
            members,
            apply_with(move |current, status, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                current["status"] = status.clone();
                Ok(())
            }),
            relay.clone(),
            false,
        );

        let outcome = presence
            .apply_mutation(Origin::Server, &criteria(&["lobby"]), json!("online"))
            .await
            .expect("ok");
        let MutationOutcome::Rejected(reason) = outcome else {
            panic!("expected rejection, got {outcome:?}");
        };
        assert_eq!(reason.status_code, 400);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(relay.frames.lock().expect("relay lock").is_empty());

        let outcome = presence
            .apply_mutation(Origin::Server, &criteria(&["lobby", "ada"]), json!("online"))
            .await
            .expect("ok");
        assert!(outcome.is_applied());
        assert_eq!(
            presence.resolve(&criteria(&["lobby", "ada"])).await.expect("ok"),
            Some(json!({ "user": "ada", "status": "online" }))
        );
    }

    #[tokio::test]
    async fn invoke_runs_callback_without_relay() {
        let relay = Arc::new(RecordingRelay::default());
        let dispatcher = dispatcher(Arc::clone(&relay), false);
        dispatcher
            .invoke(&criteria(&["room1"]), json!("quiet"))
            .await
            .expect("ok");
        assert!(relay.frames.lock().expect("relay lock").is_empty());
        assert_eq!(
            dispatcher.resolve(&criteria(&["room1"])).await.expect("ok"),
            Some(json!({ "messages": ["quiet"] }))
        );
    }
}
