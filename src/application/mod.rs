//! Relay protocol services: dispatchers, namespaces and the client mirror.

pub mod dispatcher;
pub mod error;
pub mod mirror;
pub mod namespace;
pub mod registry;
pub mod routing;
pub mod transport;

pub use dispatcher::{ApplyMutation, Dispatcher, MutationOutcome, apply_async, apply_with};
pub use mirror::{ClientMirror, InboundMatcher, MirrorError, Outbound, Subscription};
pub use namespace::{Namespace, NamespaceOptions, ValueSource, empty_object_source};
pub use registry::Registry;
pub use routing::RouteTable;
pub use transport::{Broadcaster, InboundListener, ListenerSet, Origin, PeerConnection, PeerId};
