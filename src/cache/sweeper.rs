//! Single background scheduler for cache expiry.
//!
//! Rather than one runtime timer per entry, every root node is registered
//! here and the sweeper walks them on a fixed cadence.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::lock::mutex_lock;
use super::node::{CacheNode, Identifier};

const SOURCE: &str = "cache::sweeper";

/// Anything the sweeper can expire.
pub trait Sweep: Send + Sync {
    fn sweep(&self, now: Instant) -> usize;
}

impl<K, V> Sweep for CacheNode<K, V>
where
    K: Identifier,
    V: Clone + Send + Sync + 'static,
{
    fn sweep(&self, now: Instant) -> usize {
        CacheNode::sweep(self, now)
    }
}

#[derive(Default)]
pub struct Sweeper {
    roots: Mutex<Vec<Arc<dyn Sweep>>>,
}

impl Sweeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, root: Arc<dyn Sweep>) {
        mutex_lock(&self.roots, SOURCE, "register").push(root);
    }

    pub fn root_count(&self) -> usize {
        mutex_lock(&self.roots, SOURCE, "root_count").len()
    }

    /// Expire everything due at `now` across all registered roots.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let roots: Vec<Arc<dyn Sweep>> = mutex_lock(&self.roots, SOURCE, "sweep").clone();
        roots.iter().map(|root| root.sweep(now)).sum()
    }

    pub fn sweep_now(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Run the sweeper on `interval` until the returned task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!(interval_ms = interval.as_millis() as u64, "Cache sweeper started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip the first immediate tick
            loop {
                ticker.tick().await;
                let evicted = self.sweep_now();
                if evicted > 0 {
                    debug!(evicted, "Cache sweep evicted expired entries");
                }
            }
        })
    }
}

/// Convenience for registering a node under its concrete type.
pub fn sweepable<K, V>(node: &CacheNode<K, V>) -> Arc<dyn Sweep>
where
    K: Identifier,
    V: Clone + Send + Sync + 'static,
{
    Arc::new(node.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::*;
    use crate::cache::builder::build_fn;
    use crate::cache::entry::CacheEntry;

    #[tokio::test(start_paused = true)]
    async fn spawned_sweeper_expires_idle_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let cache: CacheNode<String, Value> = CacheNode::with_ttl(
            build_fn(move |id: String| {
                let calls = Arc::clone(&counted);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(CacheEntry::Terminal(json!(id))))
                }
            }),
            Duration::from_millis(100),
        );

        let sweeper = Arc::new(Sweeper::new());
        sweeper.register(sweepable(&cache));
        let handle = Arc::clone(&sweeper).spawn(Duration::from_millis(10));

        cache.get(&["x".to_string()]).await.expect("build ok");
        assert!(cache.contains(&["x".to_string()]));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!cache.contains(&["x".to_string()]));

        cache.get(&["x".to_string()]).await.expect("build ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        handle.abort();
    }

    #[tokio::test]
    async fn sweep_at_walks_every_root() {
        let make = || -> CacheNode<String, Value> {
            CacheNode::with_ttl(
                build_fn(|_id: String| async { Ok(Some(CacheEntry::Terminal(json!(1)))) }),
                Duration::from_secs(1),
            )
        };
        let a = make();
        let b = make();
        a.get(&["1".to_string()]).await.expect("ok");
        b.get(&["2".to_string()]).await.expect("ok");

        let sweeper = Sweeper::new();
        sweeper.register(sweepable(&a));
        sweeper.register(sweepable(&b));
        assert_eq!(sweeper.root_count(), 2);

        let later = Instant::now() + Duration::from_secs(2);
        assert_eq!(sweeper.sweep_at(later), 2);
        assert!(a.is_empty());
        assert!(b.is_empty());
    }
}
