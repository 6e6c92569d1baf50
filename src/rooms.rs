//! Sample `rooms` namespace served by the binary.
//!
//! - `rooms:chat` with criteria `[room]` appends a message to the room.
//! - `rooms:presence` with criteria `[room, user]` sets a user's status. Each
//!   room is a nested cache level holding one entry per user.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::application::dispatcher::apply_with;
use crate::application::namespace::{Namespace, NamespaceOptions, ValueSource};
use crate::application::registry::Registry;
use crate::cache::{CacheEntry, CacheNode, build_fn};
use crate::config::RoomsSettings;
use crate::domain::{ApplyError, SubsocketError};

pub const NAMESPACE: &str = "rooms";
pub const CHAT_EVENT: &str = "chat";
pub const PRESENCE_EVENT: &str = "presence";

pub fn register(registry: &Registry, settings: &RoomsSettings) -> Result<Arc<Namespace>, SubsocketError> {
    let rooms = registry.register(
        NAMESPACE,
        Some(room_source()),
        NamespaceOptions {
            emit_all: settings.emit_all,
        },
    )?;
    rooms.on(CHAT_EVENT, apply_with(append_message), None)?;
    rooms.on(
        PRESENCE_EVENT,
        apply_with(set_status),
        Some(presence_source(registry.cache_config().ttl)),
    )?;
    Ok(rooms)
}

fn room_source() -> ValueSource {
    build_fn(|_room: String| async { Ok(Some(CacheEntry::Terminal(json!({ "messages": [] })))) })
}

fn presence_source(ttl: Duration) -> ValueSource {
    build_fn(move |room: String| async move {
        let members = CacheNode::with_ttl(
            build_fn(move |user: String| {
                let room = room.clone();
                async move {
                    Ok(Some(CacheEntry::Terminal(json!({
                        "room": room,
                        "user": user,
                        "status": "offline",
                    }))))
                }
            }),
            ttl,
        );
        Ok(Some(CacheEntry::Nested(members)))
    })
}

fn append_message(current: &mut Value, message: &Value, _criteria: &[String]) -> Result<(), ApplyError> {
    let room = current
        .as_object_mut()
        .ok_or_else(|| ApplyError::message("room state must be an object"))?;
    match room
        .entry("messages")
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(messages) => {
            messages.push(message.clone());
            Ok(())
        }
        _ => Err(ApplyError::message("room messages must be an array")),
    }
}

fn set_status(current: &mut Value, status: &Value, _criteria: &[String]) -> Result<(), ApplyError> {
    let member = current
        .as_object_mut()
        .ok_or_else(|| ApplyError::message("presence entry must be an object"))?;
    member.insert("status".to_string(), status.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use subsocket_wire::RelayFrame;

    use super::*;
    use crate::application::dispatcher::MutationOutcome;
    use crate::application::transport::Broadcaster;
    use crate::cache::CacheConfig;

    struct NullRelay;

    impl Broadcaster for NullRelay {
        fn broadcast_all(&self, _frame: RelayFrame) {}
    }

    fn rooms() -> (Registry, Arc<Namespace>) {
        let registry = Registry::new(Arc::new(NullRelay), CacheConfig::default());
        let rooms = register(&registry, &RoomsSettings { emit_all: false }).expect("register");
        (registry, rooms)
    }

    fn criteria(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn chat_appends_messages() {
        let (_registry, rooms) = rooms();
        rooms
            .publish(CHAT_EVENT, &criteria(&["lobby"]), json!("hello"))
            .await
            .expect("ok");
        let outcome = rooms
            .publish(CHAT_EVENT, &criteria(&["lobby"]), json!("again"))
            .await
            .expect("ok");
        assert_eq!(
            outcome,
            MutationOutcome::Applied {
                value: json!({ "messages": ["hello", "again"] })
            }
        );
        assert_eq!(
            rooms.init_snapshot(None).await.expect("ok"),
            json!({ "lobby": { "messages": ["hello", "again"] } })
        );
    }

    #[tokio::test]
    async fn presence_is_addressed_per_room_and_user() {
        let (_registry, rooms) = rooms();
        rooms
            .publish(PRESENCE_EVENT, &criteria(&["lobby", "ada"]), json!("online"))
            .await
            .expect("ok");

        let presence = rooms.dispatcher(PRESENCE_EVENT).expect("bound");
        assert_eq!(
            presence.resolve(&criteria(&["lobby"])).await.expect("ok"),
            Some(json!({ "ada": { "room": "lobby", "user": "ada", "status": "online" } }))
        );

        let whole_room = rooms
            .publish(PRESENCE_EVENT, &criteria(&["lobby"]), json!("online"))
            .await
            .expect("ok");
        let MutationOutcome::Rejected(reason) = whole_room else {
            panic!("a room is not a presence entry, got {whole_room:?}");
        };
        assert_eq!(reason.status_code, 400);

        assert!(presence.source().evict(&"lobby".to_string()));
        assert!(!presence.source().contains(&criteria(&["lobby", "ada"])));
    }
}
