//! In-process fan-out shared by every connected peer.

use std::sync::Arc;

use subsocket_wire::RelayFrame;
use tokio::sync::broadcast;
use tracing::debug;

use crate::application::transport::{Broadcaster, PeerId};

/// One relayed frame and the peer it came from, if any.
#[derive(Debug)]
pub struct Relay {
    pub origin: Option<PeerId>,
    pub frame: RelayFrame,
}

impl Relay {
    /// Whether `peer` should receive this relay.
    pub fn is_for(&self, peer: PeerId) -> bool {
        self.origin != Some(peer)
    }
}

/// Broadcast channel of relays. Peers subscribe on connect and skip the
/// relays they originated themselves.
#[derive(Clone)]
pub struct Hub {
    tx: broadcast::Sender<Arc<Relay>>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, origin: Option<PeerId>, frame: RelayFrame) {
        let event = frame.event.clone();
        match self.tx.send(Arc::new(Relay { origin, frame })) {
            Ok(receivers) => debug!(event = %event, receivers, "Relay published"),
            Err(_) => debug!(event = %event, "No peers connected for relay"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Relay>> {
        self.tx.subscribe()
    }

    pub fn peer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Broadcaster for Hub {
    fn broadcast_all(&self, frame: RelayFrame) {
        self.publish(None, frame);
    }
}
