pub mod cache;
pub mod config;

pub use cache::tile_cache_loop;
pub use config::TileCacheConfig;

use crate::models::{Page, Query};
use crate::monitor::Monitor;

/// Where the tile cache gets pages from.
pub trait PageSource: Send + Sync + 'static {
    /// Subscribe to the page for `query`. The monitor starts at
    /// [`Page::Loading`] until data for the query is known.
    /// Dropping the monitor releases the subscription.
    fn open(&self, query: &Query) -> Monitor<Page>;

    /// The cache discarded `query`; the next `open` must not assume its data
    /// is still fresh.
    fn evict(&self, query: &Query);
}
