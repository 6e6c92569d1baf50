//! Naming rules for namespaces and events.
//!
//! A namespace is a single URL path segment and never contains the event
//! separator, so `<namespace>:<event>` always splits at its first `:`.
//! Events may contain `:`; each `:`-separated segment maps to one URL path
//! segment of the HTTP ingress.

use subsocket_wire::EVENT_SEPARATOR;

use super::error::SubsocketError;

pub fn validate_namespace(name: &str) -> Result<(), SubsocketError> {
    if name.is_empty() {
        return Err(SubsocketError::invalid_argument(
            "name",
            "namespace name must not be empty",
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| *c == EVENT_SEPARATOR || *c == '/' || c.is_whitespace())
    {
        return Err(SubsocketError::invalid_argument(
            "name",
            format!("namespace name `{name}` must not contain {bad:?}"),
        ));
    }
    Ok(())
}

pub fn validate_event(event: &str) -> Result<(), SubsocketError> {
    if event.is_empty() {
        return Err(SubsocketError::invalid_argument(
            "event",
            "event name must not be empty",
        ));
    }
    if event.contains('/') || event.chars().any(char::is_whitespace) {
        return Err(SubsocketError::invalid_argument(
            "event",
            format!("event name `{event}` must not contain '/' or whitespace"),
        ));
    }
    if event.split(EVENT_SEPARATOR).any(str::is_empty) {
        return Err(SubsocketError::invalid_argument(
            "event",
            format!("event name `{event}` has an empty segment"),
        ));
    }
    Ok(())
}
