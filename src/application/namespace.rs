//! A named topic: one shared init cache plus the dispatchers bound to it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::{Map, Value};
use subsocket_wire::Criteria;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::application::dispatcher::{ApplyMutation, Dispatcher, MutationOutcome};
use crate::application::routing::{RouteTable, inbound_listener};
use crate::application::transport::{Broadcaster, Origin, PeerConnection};
use crate::cache::{BuildData, BuildError, CacheEntry, CacheNode, Sweeper, build_fn, sweepable};
use crate::domain::SubsocketError;
use crate::domain::names::validate_event;

pub type ValueSource = Arc<dyn BuildData<String, Value>>;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct NamespaceOptions {
    /// Also relay a peer's mutation back to that peer.
    pub emit_all: bool,
}

/// Init builder used when a namespace is registered without one: every
/// identifier starts out as an empty object.
pub fn empty_object_source() -> ValueSource {
    build_fn(|_identifier: String| async {
        Ok(Some(CacheEntry::Terminal(Value::Object(Map::new()))))
    })
}

pub struct Namespace {
    name: String,
    init: CacheNode<String, Value>,
    /// Held by every dispatcher bound to `init` while it applies a mutation.
    init_lock: Arc<Mutex<()>>,
    options: NamespaceOptions,
    ttl: Duration,
    routes: Arc<RouteTable>,
    relay: Arc<dyn Broadcaster>,
    sweeper: Arc<Sweeper>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Namespace {
    pub(crate) fn new(
        name: String,
        init: ValueSource,
        options: NamespaceOptions,
        ttl: Duration,
        routes: Arc<RouteTable>,
        relay: Arc<dyn Broadcaster>,
        sweeper: Arc<Sweeper>,
    ) -> Self {
        let init = CacheNode::with_ttl(init, ttl);
        sweeper.register(sweepable(&init));
        Self {
            name,
            init,
            init_lock: Arc::new(Mutex::new(())),
            options,
            ttl,
            routes,
            relay,
            sweeper,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> NamespaceOptions {
        self.options
    }

    /// Bind `event` to a dispatcher. Without a `source` the dispatcher reads
    /// and writes this namespace's init cache, and its mutations serialize
    /// with those of every other dispatcher doing the same.
    pub fn on(
        &self,
        event: &str,
        apply: Arc<dyn ApplyMutation>,
        source: Option<ValueSource>,
    ) -> Result<Arc<Dispatcher>, SubsocketError> {
        validate_event(event)?;
        if self.routes.get(&self.name, event).is_some() {
            return Err(SubsocketError::DuplicateEvent {
                event: subsocket_wire::qualify(&self.name, event),
            });
        }

        let (cache, owned) = match source {
            Some(source) => (CacheNode::with_ttl(source, self.ttl), true),
            None => (self.init.clone(), false),
        };
        let mut dispatcher = Dispatcher::new(
            &self.name,
            event,
            cache,
            apply,
            Arc::clone(&self.relay),
            self.options.emit_all,
        );
        if !owned {
            dispatcher = dispatcher.with_write_lock(Arc::clone(&self.init_lock));
        }
        let dispatcher = self.routes.bind(&self.name, event, Arc::new(dispatcher))?;
        if owned {
            self.sweeper.register(sweepable(dispatcher.source()));
        }

        info!(
            event = %dispatcher.qualified_name(),
            shared_source = !owned,
            "Dispatcher bound"
        );
        Ok(dispatcher)
    }

    pub fn dispatcher(&self, event: &str) -> Option<Arc<Dispatcher>> {
        self.routes.get(&self.name, event)
    }

    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self
            .routes
            .dispatchers_of(&self.name)
            .iter()
            .map(|dispatcher| dispatcher.event().to_string())
            .collect();
        events.sort();
        events
    }

    /// Feed `peer`'s inbound frames for this namespace into its dispatchers.
    pub fn bind_transport(&self, peer: &Arc<dyn PeerConnection>) {
        peer.on_any(inbound_listener(
            Arc::clone(&self.routes),
            Some(self.name.clone()),
            peer,
        ));
        debug!(namespace = %self.name, peer = %peer.id(), "Transport bound");
    }

    /// Server-originated mutation, relayed to every connected peer.
    pub async fn publish(
        &self,
        event: &str,
        criteria: &[String],
        data: Value,
    ) -> Result<MutationOutcome, SubsocketError> {
        let dispatcher = self.require(event)?;
        dispatcher.apply_mutation(Origin::Server, criteria, data).await
    }

    /// Run `event`'s apply callback directly, without relaying. Returns
    /// false when nothing is bound to `event`.
    pub async fn trigger(
        &self,
        event: &str,
        criteria: &[String],
        new_data: Value,
    ) -> Result<bool, SubsocketError> {
        if event.is_empty() {
            return Err(SubsocketError::invalid_argument(
                "event",
                "event name must not be empty",
            ));
        }
        if new_data.is_null() {
            return Err(SubsocketError::invalid_argument(
                "new_data",
                "new data must be defined",
            ));
        }

        let Some(dispatcher) = self.dispatcher(event) else {
            debug!(namespace = %self.name, event, "trigger for unbound event");
            return Ok(false);
        };
        dispatcher.invoke(criteria, new_data).await?;
        Ok(true)
    }

    pub fn init_cache(&self) -> &CacheNode<String, Value> {
        &self.init
    }

    /// Init value at `criteria`, or `null` when it does not exist.
    pub async fn init_value(&self, criteria: &[String]) -> Result<Value, BuildError> {
        Ok(self
            .init
            .get(criteria)
            .await?
            .map(Value::from)
            .unwrap_or(Value::Null))
    }

    /// Init values for each entry of `criteria_list`, in order, or the full
    /// init snapshot when no list is given.
    pub async fn init_snapshot(
        &self,
        criteria_list: Option<&[Criteria]>,
    ) -> Result<Value, BuildError> {
        match criteria_list {
            None => Ok(Value::from(self.init.snapshot())),
            Some(list) => {
                let values =
                    try_join_all(list.iter().map(|criteria| self.init_value(criteria))).await?;
                Ok(Value::Array(values))
            }
        }
    }

    /// Drop every cached entry this namespace owns.
    pub fn clear_caches(&self) -> usize {
        let own_sources: usize = self
            .routes
            .dispatchers_of(&self.name)
            .iter()
            .filter(|dispatcher| !dispatcher.source().same_node(&self.init))
            .map(|dispatcher| dispatcher.source().clear())
            .sum();
        own_sources + self.init.clear()
    }

    fn require(&self, event: &str) -> Result<Arc<Dispatcher>, SubsocketError> {
        self.dispatcher(event)
            .ok_or_else(|| SubsocketError::UnknownEvent {
                event: subsocket_wire::qualify(&self.name, event),
            })
    }
}
