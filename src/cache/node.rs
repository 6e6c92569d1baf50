//! One level of the criteria-addressed cache.
//!
//! A node maps identifiers to slots. Each slot holds a single-flight cell that
//! is populated by the node's build function on first access, and owns exactly
//! one current record in the node's expiry index. All slot-table mutation
//! happens under the node's mutex and never across an await point.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use metrics::counter;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::debug;

use super::builder::{BuildData, BuildError};
use super::config::DEFAULT_TTL;
use super::entry::{CacheEntry, Resolved};
use super::expiry::ExpiryIndex;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::node";

pub(crate) const METRIC_CACHE_HIT: &str = "subsocket_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "subsocket_cache_miss_total";
pub(crate) const METRIC_CACHE_EVICT: &str = "subsocket_cache_evict_total";
pub(crate) const METRIC_BUILD: &str = "subsocket_build_total";

/// Bounds every cache identifier satisfies.
pub trait Identifier: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Identifier for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// What one build produced, shared with every caller that waited on it.
type Outcome<K, V> = Result<Option<CacheEntry<K, V>>, Arc<BuildError>>;
type Cell<K, V> = Arc<OnceCell<Outcome<K, V>>>;

struct Slot<K, V> {
    cell: Cell<K, V>,
    /// Sequence number of this slot's current expiry record.
    seq: u64,
}

impl<K, V> Slot<K, V> {
    /// The stored entry, if the build finished and produced one.
    fn entry(&self) -> Option<&CacheEntry<K, V>> {
        match self.cell.get() {
            Some(Ok(Some(entry))) => Some(entry),
            _ => None,
        }
    }
}

enum Lookup<K, V> {
    Hit(CacheEntry<K, V>),
    Pending(Cell<K, V>),
}

struct NodeState<K, V> {
    slots: HashMap<K, Slot<K, V>>,
    expiry: ExpiryIndex<K>,
}

struct NodeInner<K, V> {
    builder: Arc<dyn BuildData<K, V>>,
    ttl: Duration,
    state: Mutex<NodeState<K, V>>,
}

/// A lazily populated, access-refreshed cache level.
///
/// Cloning a node yields another handle to the same level.
pub struct CacheNode<K, V> {
    inner: Arc<NodeInner<K, V>>,
}

impl<K, V> Clone for CacheNode<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for CacheNode<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheNode")
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}

impl<K, V> CacheNode<K, V>
where
    K: Identifier,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty node with the default thirty minute lifetime.
    pub fn new(builder: Arc<dyn BuildData<K, V>>) -> Self {
        Self::with_ttl(builder, DEFAULT_TTL)
    }

    pub fn with_ttl(builder: Arc<dyn BuildData<K, V>>, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                builder,
                ttl,
                state: Mutex::new(NodeState {
                    slots: HashMap::new(),
                    expiry: ExpiryIndex::new(),
                }),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// True when both handles refer to the same level.
    pub fn same_node(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolve `path` through this node and any nested nodes below it.
    ///
    /// An empty path yields a snapshot of this level. Criteria left over after
    /// reaching a terminal value are ignored. A nested level reached with no
    /// criteria left is returned as a snapshot, never as a live handle.
    pub fn get<'a>(
        &'a self,
        path: &'a [K],
    ) -> BoxFuture<'a, Result<Option<Resolved<K, V>>, BuildError>> {
        Box::pin(async move {
            let Some((head, rest)) = path.split_first() else {
                return Ok(Some(self.snapshot()));
            };

            match self.entry(head).await? {
                None => Ok(None),
                Some(CacheEntry::Terminal(value)) => Ok(Some(Resolved::Value(value))),
                Some(CacheEntry::Nested(child)) if rest.is_empty() => Ok(Some(child.snapshot())),
                Some(CacheEntry::Nested(child)) => child.get(rest).await,
            }
        })
    }

    /// Fetch the entry for one identifier, building it on a miss.
    ///
    /// Concurrent callers for an identifier that is still being built wait
    /// for that build and share its outcome, whether it produced an entry,
    /// nothing or an error. A successful access pushes the identifier's
    /// deadline to `now + ttl`.
    pub async fn entry(&self, identifier: &K) -> Result<Option<CacheEntry<K, V>>, BuildError> {
        let cell = match self.lookup(identifier) {
            Lookup::Hit(entry) => {
                counter!(METRIC_CACHE_HIT).increment(1);
                return Ok(Some(entry));
            }
            Lookup::Pending(cell) => cell,
        };

        counter!(METRIC_CACHE_MISS).increment(1);
        let outcome = cell
            .get_or_init(|| async {
                counter!(METRIC_BUILD).increment(1);
                debug!(identifier = ?identifier, "building cache entry");
                self.inner.builder.build(identifier).await.map_err(Arc::new)
            })
            .await;

        match outcome {
            Ok(Some(entry)) => {
                let entry = entry.clone();
                self.touch(identifier, &cell);
                Ok(Some(entry))
            }
            Ok(None) => {
                self.discard_unpopulated(identifier, &cell);
                Ok(None)
            }
            Err(err) => {
                self.discard_unpopulated(identifier, &cell);
                Err(BuildError::Shared(Arc::clone(err)))
            }
        }
    }

    /// Copy out every populated entry of this level, descending into nested
    /// levels. Does not refresh deadlines.
    pub fn snapshot(&self) -> Resolved<K, V> {
        let entries: Vec<(K, CacheEntry<K, V>)> = {
            let state = mutex_lock(&self.inner.state, SOURCE, "snapshot");
            state
                .slots
                .iter()
                .filter_map(|(key, slot)| slot.entry().map(|entry| (key.clone(), entry.clone())))
                .collect()
        };

        let branch = entries
            .into_iter()
            .map(|(key, entry)| {
                let resolved = match entry {
                    CacheEntry::Terminal(value) => Resolved::Value(value),
                    CacheEntry::Nested(child) => child.snapshot(),
                };
                (key, resolved)
            })
            .collect();
        Resolved::Branch(branch)
    }

    /// True when `path` addresses a populated entry. Never builds.
    pub fn contains(&self, path: &[K]) -> bool {
        let Some((head, rest)) = path.split_first() else {
            return true;
        };
        match self.peek(head) {
            None => false,
            Some(CacheEntry::Terminal(_)) => true,
            Some(CacheEntry::Nested(child)) => child.contains(rest),
        }
    }

    /// Replace the terminal value addressed by `path`, refreshing its
    /// deadline. Returns false when the path does not reach a populated
    /// terminal value.
    pub fn store(&self, path: &[K], value: V) -> bool {
        let Some((head, rest)) = path.split_first() else {
            return false;
        };
        match self.peek(head) {
            Some(CacheEntry::Nested(child)) if !rest.is_empty() => child.store(rest, value),
            Some(CacheEntry::Terminal(_)) => self.replace_terminal(head, value),
            _ => false,
        }
    }

    /// Remove one identifier of this level, tearing down any nested level
    /// beneath it. Evicting an absent identifier is a no-op.
    pub fn evict(&self, identifier: &K) -> bool {
        let removed = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "evict");
            let removed = state.slots.remove(identifier);
            if removed.is_some() {
                state.expiry.cancel(identifier);
            }
            removed
        };

        let Some(slot) = removed else {
            return false;
        };
        let evicted = 1 + Self::cascade(&slot);
        counter!(METRIC_CACHE_EVICT).increment(evicted as u64);
        debug!(identifier = ?identifier, evicted, "cache entry evicted");
        true
    }

    /// Evict the entry addressed by `path` at whatever depth it lives.
    pub fn invalidate(&self, path: &[K]) -> bool {
        match path {
            [] => false,
            [identifier] => self.evict(identifier),
            [identifier, rest @ ..] => match self.peek(identifier) {
                Some(CacheEntry::Nested(child)) => child.invalidate(rest),
                Some(CacheEntry::Terminal(_)) => self.evict(identifier),
                None => false,
            },
        }
    }

    /// Evict every entry of this level. Returns the number of entries
    /// removed, descendants included.
    pub fn clear(&self) -> usize {
        let evicted = self.clear_quietly();
        if evicted > 0 {
            counter!(METRIC_CACHE_EVICT).increment(evicted as u64);
        }
        evicted
    }

    /// Evict every entry whose deadline has passed at `now`, here and in all
    /// live nested levels. Slots still being built are given a fresh
    /// deadline instead of being dropped.
    pub fn sweep(&self, now: Instant) -> usize {
        let (expired, children) = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "sweep");
            let NodeState { slots, expiry } = &mut *state;

            let mut expired = Vec::new();
            let mut pending = Vec::new();
            while let Some((key, seq)) = expiry.pop_due(now) {
                let Some(slot) = slots.get(&key) else {
                    continue;
                };
                if slot.seq != seq {
                    continue;
                }
                if !slot.cell.initialized() {
                    pending.push(key);
                    continue;
                }
                if let Some(slot) = slots.remove(&key) {
                    expired.push((key, slot));
                }
            }

            for key in pending {
                let seq = expiry.schedule(key.clone(), now + self.inner.ttl);
                if let Some(slot) = slots.get_mut(&key) {
                    slot.seq = seq;
                }
            }

            let children: Vec<CacheNode<K, V>> = slots
                .values()
                .filter_map(|slot| match slot.entry() {
                    Some(CacheEntry::Nested(child)) => Some(child.clone()),
                    _ => None,
                })
                .collect();
            (expired, children)
        };

        let mut evicted = 0;
        for (key, slot) in expired {
            let removed = 1 + Self::cascade(&slot);
            debug!(identifier = ?key, evicted = removed, "cache entry expired");
            evicted += removed;
        }
        if evicted > 0 {
            counter!(METRIC_CACHE_EVICT).increment(evicted as u64);
        }

        evicted
            + children
                .iter()
                .map(|child| child.sweep(now))
                .sum::<usize>()
    }

    /// Number of slots at this level, including ones still being built.
    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "len").slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of expiry records held by this level, stale ones included.
    pub fn scheduled_expiries(&self) -> usize {
        mutex_lock(&self.inner.state, SOURCE, "scheduled_expiries")
            .expiry
            .len()
    }

    /// Earliest deadline recorded at this level.
    pub fn next_expiry(&self) -> Option<Instant> {
        mutex_lock(&self.inner.state, SOURCE, "next_expiry")
            .expiry
            .next_deadline()
    }

    fn peek(&self, identifier: &K) -> Option<CacheEntry<K, V>> {
        let state = mutex_lock(&self.inner.state, SOURCE, "peek");
        state
            .slots
            .get(identifier)
            .and_then(|slot| slot.entry().cloned())
    }

    /// Return a populated entry with its deadline already refreshed, or the
    /// cell to wait on. The hit check and the refresh share one guard, so a
    /// concurrent sweep never evicts an entry this call is about to return.
    fn lookup(&self, identifier: &K) -> Lookup<K, V> {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "lookup");
        let NodeState { slots, expiry } = &mut *state;
        let deadline = Instant::now() + self.inner.ttl;

        if let Some(slot) = slots.get_mut(identifier) {
            let Some(entry) = slot.entry().cloned() else {
                return Lookup::Pending(Arc::clone(&slot.cell));
            };
            slot.seq = expiry.schedule(identifier.clone(), deadline);
            expiry.compact_if_bloated(slots.len(), |key, seq| {
                slots.get(key).is_some_and(|slot| slot.seq == seq)
            });
            return Lookup::Hit(entry);
        }

        let cell: Cell<K, V> = Arc::new(OnceCell::new());
        let seq = expiry.schedule(identifier.clone(), deadline);
        slots.insert(
            identifier.clone(),
            Slot {
                cell: Arc::clone(&cell),
                seq,
            },
        );
        Lookup::Pending(cell)
    }

    /// Push the deadline of `identifier` forward, provided its slot still
    /// holds `cell` (it may have been evicted while the caller was building).
    fn touch(&self, identifier: &K, cell: &Cell<K, V>) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "touch");
        let NodeState { slots, expiry } = &mut *state;
        let Some(slot) = slots.get_mut(identifier) else {
            return;
        };
        if !Arc::ptr_eq(&slot.cell, cell) {
            return;
        }
        slot.seq = expiry.schedule(identifier.clone(), Instant::now() + self.inner.ttl);
        expiry.compact_if_bloated(slots.len(), |key, seq| {
            slots.get(key).is_some_and(|slot| slot.seq == seq)
        });
    }

    /// Drop a slot whose build produced nothing. Callers still holding the
    /// cell keep reading the shared outcome; the next lookup builds afresh.
    fn discard_unpopulated(&self, identifier: &K, cell: &Cell<K, V>) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "discard_unpopulated");
        let owned = state
            .slots
            .get(identifier)
            .is_some_and(|slot| Arc::ptr_eq(&slot.cell, cell) && slot.entry().is_none());
        if owned {
            state.slots.remove(identifier);
            state.expiry.cancel(identifier);
        }
    }

    fn replace_terminal(&self, identifier: &K, value: V) -> bool {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "replace_terminal");
        let NodeState { slots, expiry } = &mut *state;
        let Some(slot) = slots.get_mut(identifier) else {
            return false;
        };
        if !matches!(slot.entry(), Some(CacheEntry::Terminal(_))) {
            return false;
        }
        // The new deadline is recorded under the same guard that publishes
        // the value, so a concurrent sweep sees both or neither.
        slot.seq = expiry.schedule(identifier.clone(), Instant::now() + self.inner.ttl);
        slot.cell = Arc::new(OnceCell::new_with(Some(Ok(Some(CacheEntry::Terminal(value))))));
        true
    }

    fn clear_quietly(&self) -> usize {
        let detached: Vec<Slot<K, V>> = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "clear");
            state.expiry.clear();
            state.slots.drain().map(|(_, slot)| slot).collect()
        };
        detached
            .iter()
            .map(|slot| 1 + Self::cascade(slot))
            .sum()
    }

    /// Tear down the nested level held by a detached slot, if any.
    fn cascade(slot: &Slot<K, V>) -> usize {
        match slot.entry() {
            Some(CacheEntry::Nested(child)) => child.clear_quietly(),
            _ => 0,
        }
    }
}
