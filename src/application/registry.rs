//! Process-wide collection of namespaces, owned by the composition root.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tracing::info;

use crate::application::dispatcher::Dispatcher;
use crate::application::namespace::{Namespace, NamespaceOptions, ValueSource, empty_object_source};
use crate::application::routing::{RouteTable, inbound_listener};
use crate::application::transport::{Broadcaster, PeerConnection};
use crate::cache::lock::mutex_lock;
use crate::cache::{CacheConfig, Sweeper};
use crate::domain::SubsocketError;
use crate::domain::names::validate_namespace;

const SOURCE: &str = "application::registry";

pub struct Registry {
    namespaces: DashMap<String, Arc<Namespace>>,
    routes: Arc<RouteTable>,
    relay: Arc<dyn Broadcaster>,
    sweeper: Arc<Sweeper>,
    cache: CacheConfig,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    pub fn new(relay: Arc<dyn Broadcaster>, cache: CacheConfig) -> Self {
        Self {
            namespaces: DashMap::new(),
            routes: Arc::new(RouteTable::new()),
            relay,
            sweeper: Arc::new(Sweeper::new()),
            cache,
            sweeper_task: Mutex::new(None),
        }
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.cache
    }

    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }

    /// Register a namespace. Without an `init` builder every identifier of
    /// its init cache starts out as an empty object.
    pub fn register(
        &self,
        name: &str,
        init: Option<ValueSource>,
        options: NamespaceOptions,
    ) -> Result<Arc<Namespace>, SubsocketError> {
        validate_namespace(name)?;
        match self.namespaces.entry(name.to_string()) {
            Entry::Occupied(_) => Err(SubsocketError::DuplicateNamespace {
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                let namespace = Arc::new(Namespace::new(
                    name.to_string(),
                    init.unwrap_or_else(empty_object_source),
                    options,
                    self.cache.ttl,
                    Arc::clone(&self.routes),
                    Arc::clone(&self.relay),
                    Arc::clone(&self.sweeper),
                ));
                slot.insert(Arc::clone(&namespace));
                info!(namespace = name, emit_all = options.emit_all, "Namespace registered");
                Ok(namespace)
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn dispatcher(&self, namespace: &str, event: &str) -> Option<Arc<Dispatcher>> {
        self.routes.get(namespace, event)
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .namespaces
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Route `peer`'s inbound frames to every namespace of this registry,
    /// including ones registered later.
    pub fn bind_transport(&self, peer: &Arc<dyn PeerConnection>) {
        peer.on_any(inbound_listener(Arc::clone(&self.routes), None, peer));
    }

    /// Start the expiry sweeper. Calling this again while it runs is a no-op.
    pub fn init(&self) {
        let mut task = mutex_lock(&self.sweeper_task, SOURCE, "init");
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *task = Some(Arc::clone(&self.sweeper).spawn(self.cache.sweep_interval));
    }

    pub fn is_running(&self) -> bool {
        mutex_lock(&self.sweeper_task, SOURCE, "is_running")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the sweeper and drop every cached entry.
    pub async fn shutdown(&self) {
        let task = mutex_lock(&self.sweeper_task, SOURCE, "shutdown").take();
        if let Some(handle) = task {
            handle.abort();
            let _ = handle.await;
        }

        let evicted: usize = self
            .namespaces
            .iter()
            .map(|entry| entry.value().clear_caches())
            .sum();
        info!(evicted, "Registry shut down");
    }
}
