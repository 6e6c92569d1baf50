//! Criteria-addressed hierarchical cache.
//!
//! A [`CacheNode`] maps identifiers to entries produced lazily by a build
//! function. An entry is either a terminal value or another node addressed
//! by the remaining criteria, so a compound key such as `[guild, user]`
//! gets a natural grouping boundary at each level:
//!
//! - **Single-flight population**: concurrent misses for one identifier share
//!   a single build.
//! - **Access-refreshed expiry**: each hit or miss pushes the deadline to
//!   `now + ttl`; a [`Sweeper`] evicts idle entries.
//! - **Cascading eviction**: removing a nested entry tears down its subtree.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! ttl_seconds = 1800
//! sweep_interval_ms = 1000
//! ```

mod builder;
mod config;
mod entry;
mod expiry;
pub(crate) mod lock;
mod node;
mod sweeper;

pub use builder::{BuildData, BuildError, FnBuilder, build_fn};
pub use config::{CacheConfig, DEFAULT_TTL};
pub use entry::{CacheEntry, Resolved};
pub use node::{CacheNode, Identifier};
pub(crate) use node::{METRIC_BUILD, METRIC_CACHE_EVICT, METRIC_CACHE_HIT, METRIC_CACHE_MISS};
pub use sweeper::{Sweep, Sweeper, sweepable};
