//! Exact-match routing from `(namespace, event)` to dispatchers.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use subsocket_wire::{RelayFrame, split_event_name};
use tracing::{debug, warn};

use crate::application::dispatcher::{Dispatcher, MutationOutcome};
use crate::application::transport::{InboundListener, Origin, PeerConnection};
use crate::domain::SubsocketError;

type RouteKey = (String, String);

/// Every dispatcher of a registry, built up as events are bound.
#[derive(Default)]
pub struct RouteTable {
    routes: DashMap<RouteKey, Arc<Dispatcher>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(
        &self,
        namespace: &str,
        event: &str,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<Dispatcher>, SubsocketError> {
        match self.routes.entry((namespace.to_string(), event.to_string())) {
            Entry::Occupied(_) => Err(SubsocketError::DuplicateEvent {
                event: dispatcher.qualified_name().to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&dispatcher));
                Ok(dispatcher)
            }
        }
    }

    pub fn get(&self, namespace: &str, event: &str) -> Option<Arc<Dispatcher>> {
        self.routes
            .get(&(namespace.to_string(), event.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn dispatchers_of(&self, namespace: &str) -> Vec<Arc<Dispatcher>> {
        self.routes
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Build the catch-all listener that feeds a peer's inbound frames into the
/// matching dispatchers. With `scope` set, frames for other namespaces are
/// ignored.
pub(crate) fn inbound_listener(
    routes: Arc<RouteTable>,
    scope: Option<String>,
    peer: &Arc<dyn PeerConnection>,
) -> InboundListener {
    // The listener is stored inside the peer, so it must not keep it alive.
    let peer: Weak<dyn PeerConnection> = Arc::downgrade(peer);
    Arc::new(move |frame: RelayFrame| -> BoxFuture<'static, ()> {
        let routes = Arc::clone(&routes);
        let scope = scope.clone();
        let peer = peer.clone();
        Box::pin(async move {
            let Some(peer) = peer.upgrade() else {
                return;
            };
            route_frame(&routes, scope.as_deref(), peer.as_ref(), frame).await;
        })
    })
}

async fn route_frame(
    routes: &RouteTable,
    scope: Option<&str>,
    peer: &dyn PeerConnection,
    frame: RelayFrame,
) {
    let Some((namespace, event)) = split_event_name(&frame.event) else {
        debug!(event = %frame.event, "inbound frame without a namespace");
        return;
    };
    if scope.is_some_and(|scope| scope != namespace) {
        return;
    }
    let Some(dispatcher) = routes.get(namespace, event) else {
        debug!(event = %frame.event, "no dispatcher bound for inbound frame");
        return;
    };

    match dispatcher
        .apply_mutation(Origin::Peer(peer), &frame.criteria, frame.data)
        .await
    {
        Ok(MutationOutcome::Applied { .. }) => {}
        Ok(MutationOutcome::Rejected(reason)) => {
            debug!(
                peer = %peer.id(),
                event = %reason.event,
                status = reason.status_code,
                reason = %reason.reason,
                "inbound mutation rejected"
            );
        }
        Err(err) => {
            warn!(peer = %peer.id(), event = %frame.event, error = %err, "inbound mutation failed");
        }
    }
}
