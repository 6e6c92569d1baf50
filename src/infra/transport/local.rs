//! In-process peer over a [`Hub`], for embedding and tests.

use std::sync::Arc;

use subsocket_wire::RelayFrame;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use super::hub::Hub;
use crate::application::mirror::{MirrorError, Outbound};
use crate::application::transport::{InboundListener, ListenerSet, PeerConnection, PeerId};

/// Frames delivered to a [`LocalPeer`], in arrival order.
pub struct LocalInbox {
    rx: mpsc::UnboundedReceiver<RelayFrame>,
}

impl LocalInbox {
    pub async fn recv(&mut self) -> Option<RelayFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RelayFrame> {
        self.rx.try_recv().ok()
    }
}

pub struct LocalPeer {
    id: PeerId,
    hub: Hub,
    out: mpsc::UnboundedSender<RelayFrame>,
    listeners: Arc<ListenerSet>,
    forward: JoinHandle<()>,
}

impl LocalPeer {
    /// Connect a new peer to `hub`. Relays published after this returns are
    /// delivered to the inbox.
    pub fn connect(hub: &Hub) -> (Arc<Self>, LocalInbox) {
        let id = Uuid::new_v4();
        let (out, rx) = mpsc::unbounded_channel();
        let mut relays = hub.subscribe();
        let forward_out = out.clone();
        let forward = tokio::spawn(async move {
            loop {
                match relays.recv().await {
                    Ok(relay) if relay.is_for(id) => {
                        if forward_out.send(relay.frame.clone()).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(peer = %id, skipped, "Local peer lagged, relays dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let peer = Arc::new(Self {
            id,
            hub: hub.clone(),
            out,
            listeners: Arc::new(ListenerSet::new()),
            forward,
        });
        (peer, LocalInbox { rx })
    }

    /// Hand `frame` to this peer's inbound listeners, as if it had arrived
    /// from the remote end.
    pub async fn inject(&self, frame: RelayFrame) {
        self.listeners.dispatch(frame).await;
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Drop for LocalPeer {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

impl PeerConnection for LocalPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn emit(&self, frame: RelayFrame) {
        let _ = self.out.send(frame);
    }

    fn broadcast(&self, frame: RelayFrame) {
        self.hub.publish(Some(self.id), frame);
    }

    fn on_any(&self, listener: InboundListener) {
        self.listeners.push(listener);
    }
}

/// Lets a client mirror push updates through the peer. The frame is queued
/// on a task because [`Outbound::send`] is synchronous.
impl Outbound for LocalPeer {
    fn send(&self, frame: RelayFrame) -> Result<(), MirrorError> {
        let listeners = Arc::clone(&self.listeners);
        tokio::spawn(async move { listeners.dispatch(frame).await });
        Ok(())
    }
}
