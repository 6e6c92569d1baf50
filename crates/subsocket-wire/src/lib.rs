//! Wire types for the subsocket relay protocol.
//!
//! These are shared by the server (HTTP ingress, WebSocket transport) and by
//! client-side mirrors, so both ends agree on frame layout and naming rules.

use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::Value;

/// Header that must echo the namespace name on init requests.
pub const SUBSOCKET_HEADER: &str = "x-subsocket";

/// Separator between the namespace and event segments of a qualified event name.
pub const EVENT_SEPARATOR: char = ':';

/// Ordered identifiers addressing a value through nested cache levels.
pub type Criteria = Vec<String>;

/// A relayed update or an inbound mutation, as carried over a peer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    /// Qualified event name, `<namespace>:<event>`.
    pub event: String,
    #[serde(default, deserialize_with = "deserialize_criteria")]
    pub criteria: Criteria,
    #[serde(default)]
    pub data: Value,
}

impl RelayFrame {
    pub fn new(event: impl Into<String>, criteria: Criteria, data: Value) -> Self {
        Self {
            event: event.into(),
            criteria,
            data,
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing plain strings and JSON values cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Body of `POST /<namespace>/<event...>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationRequest {
    #[serde(default, deserialize_with = "deserialize_criteria")]
    pub criteria: Criteria,
    #[serde(default)]
    pub data: Value,
}

/// Body of `POST /<namespace>/init`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitRequest {
    #[serde(
        rename = "criteriaList",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_criteria_list"
    )]
    pub criteria_list: Option<Vec<Criteria>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Join a namespace and an event into the qualified name used on the wire.
pub fn qualify(namespace: &str, event: &str) -> String {
    format!("{namespace}{EVENT_SEPARATOR}{event}")
}

/// Split a qualified event name into `(namespace, event)`.
///
/// Namespaces never contain the separator, so the first one wins and the
/// event part may itself contain separators.
pub fn split_event_name(qualified: &str) -> Option<(&str, &str)> {
    let (namespace, event) = qualified.split_once(EVENT_SEPARATOR)?;
    if namespace.is_empty() || event.is_empty() {
        return None;
    }
    Some((namespace, event))
}

/// Map an HTTP path tail (`a/b`) to the event name it addresses (`a:b`).
pub fn event_from_path(path: &str) -> Option<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }
    Some(segments.join(&EVENT_SEPARATOR.to_string()))
}

fn identifier_from_value(value: Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("criteria entries must be scalars, found {other}")),
    }
}

fn criteria_from_value(value: Value) -> Result<Criteria, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.into_iter().map(identifier_from_value).collect(),
        other => Err(format!("criteria must be an array, found {other}")),
    }
}

/// Accept criteria as an array of strings, numbers or booleans.
pub fn deserialize_criteria<'de, D>(deserializer: D) -> Result<Criteria, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    criteria_from_value(value).map_err(de::Error::custom)
}

fn deserialize_criteria_list<'de, D>(deserializer: D) -> Result<Option<Vec<Criteria>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Array(items) => items
            .into_iter()
            .map(criteria_from_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
            .map_err(de::Error::custom),
        other => Err(de::Error::custom(format!(
            "criteriaList must be an array, found {other}"
        ))),
    }
}
