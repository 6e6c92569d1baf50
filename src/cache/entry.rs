//! Cache entries and resolved read results.

use std::collections::HashMap;
use std::hash::Hash;

use serde_json::{Map, Value};

use super::node::CacheNode;

/// What a build function produced for one identifier.
///
/// The variant is fixed when the slot is populated; a terminal slot never
/// turns into a nested one (or back) until it is evicted and rebuilt.
pub enum CacheEntry<K, V> {
    Terminal(V),
    Nested(CacheNode<K, V>),
}

impl<K, V: Clone> Clone for CacheEntry<K, V> {
    fn clone(&self) -> Self {
        match self {
            CacheEntry::Terminal(value) => CacheEntry::Terminal(value.clone()),
            CacheEntry::Nested(node) => CacheEntry::Nested(node.clone()),
        }
    }
}

impl<K, V: std::fmt::Debug> std::fmt::Debug for CacheEntry<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheEntry::Terminal(value) => f.debug_tuple("Terminal").field(value).finish(),
            CacheEntry::Nested(_) => f.write_str("Nested(..)"),
        }
    }
}

/// A read result. Nested levels are copied out as branches so callers never
/// hold a handle into the live cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<K: Eq + Hash, V> {
    Value(V),
    Branch(HashMap<K, Resolved<K, V>>),
}

impl<K: Eq + Hash, V> Resolved<K, V> {
    pub fn into_value(self) -> Option<V> {
        match self {
            Resolved::Value(value) => Some(value),
            Resolved::Branch(_) => None,
        }
    }
}

impl From<Resolved<String, Value>> for Value {
    fn from(resolved: Resolved<String, Value>) -> Self {
        match resolved {
            Resolved::Value(value) => value,
            Resolved::Branch(branch) => Value::Object(
                branch
                    .into_iter()
                    .map(|(key, child)| (key, Value::from(child)))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn branches_flatten_into_json_objects() {
        let mut inner = HashMap::new();
        inner.insert("u1".to_string(), Resolved::Value(json!({ "name": "ada" })));
        let mut outer = HashMap::new();
        outer.insert("g1".to_string(), Resolved::Branch(inner));
        outer.insert("flag".to_string(), Resolved::Value(json!(true)));

        let value = Value::from(Resolved::Branch(outer));
        assert_eq!(value, json!({ "g1": { "u1": { "name": "ada" } }, "flag": true }));
    }
}
