//! Abstract peer capabilities consumed by dispatchers.
//!
//! Any bidirectional transport that can address one peer, fan out to every
//! other peer and surface inbound frames can carry the relay protocol.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use subsocket_wire::RelayFrame;
use uuid::Uuid;

use crate::cache::lock::mutex_lock;

const SOURCE: &str = "application::transport";

pub type PeerId = Uuid;

/// Callback invoked for every frame a peer receives.
pub type InboundListener = Arc<dyn Fn(RelayFrame) -> BoxFuture<'static, ()> + Send + Sync>;

pub trait PeerConnection: Send + Sync {
    fn id(&self) -> PeerId;

    /// Deliver a frame to this peer only.
    fn emit(&self, frame: RelayFrame);

    /// Deliver a frame to every connected peer except this one.
    fn broadcast(&self, frame: RelayFrame);

    /// Register a catch-all listener for inbound frames.
    fn on_any(&self, listener: InboundListener);
}

/// Fan-out to every connected peer, used for server-originated relays.
pub trait Broadcaster: Send + Sync {
    fn broadcast_all(&self, frame: RelayFrame);
}

/// Who asked for a mutation. Peer-originated relays skip the sender unless
/// the namespace echoes to it.
#[derive(Clone, Copy)]
pub enum Origin<'a> {
    Server,
    Peer(&'a dyn PeerConnection),
}

/// Ordered set of inbound listeners, shared by transport implementations.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<Vec<InboundListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, listener: InboundListener) {
        mutex_lock(&self.listeners, SOURCE, "push").push(listener);
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.listeners, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every listener against `frame`, in registration order.
    pub async fn dispatch(&self, frame: RelayFrame) {
        let listeners: Vec<InboundListener> = mutex_lock(&self.listeners, SOURCE, "dispatch").clone();
        for listener in listeners {
            listener(frame.clone()).await;
        }
    }
}
