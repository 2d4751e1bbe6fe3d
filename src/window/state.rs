//! Window membership bookkeeping.
//!
//! The window manager turns "the user is looking at page X" into explicit
//! instructions for the tile cache: which pages to start materializing, which
//! to pause and which to drop. [`WindowState::advance`] is a pure fold over
//! [`FetchEvent`]s.

use crate::models::Query;

#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    /// Start over from `query`, dropping everything cached (filter change).
    Reset(Query),
    /// The pivot moved to `query`.
    LoadMore(Query),
}

impl FetchEvent {
    pub fn query(&self) -> &Query {
        match self {
            FetchEvent::Reset(query) | FetchEvent::LoadMore(query) => query,
        }
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, FetchEvent::Reset(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TileRequest {
    /// Begin materializing the page.
    On(Query),
    /// Stop materializing but keep the last page.
    Off(Query),
    /// Stop materializing and discard the page.
    Evict(Query),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Pages on each side of the pivot that are turned on.
    pub on_pages: u32,
    /// Pages on each side of the pivot that are tracked in memory.
    pub off_pages: u32,
    /// Pages behind the lowest on-page beyond which cached pages are evicted.
    pub eviction_pages: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            on_pages: 1,
            off_pages: 2,
            eviction_pages: 3,
        }
    }
}

/// Requests produced by one fold step.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowDelta {
    pub reset: bool,
    pub pivot: Query,
    pub requests: Vec<TileRequest>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowState {
    pub previous_queries: Vec<Query>,
    pub current_queries: Vec<Query>,
    pub in_memory: Vec<Query>,
    pub to_evict: Vec<Query>,
}

fn band(pivot: &Query, pages: u32) -> Vec<Query> {
    let pages = i64::from(pages);
    (-pages..=pages)
        .filter_map(|shift| pivot.shifted(shift))
        .collect()
}

fn push_distinct(target: &mut Vec<Query>, query: Query) {
    if !target.contains(&query) {
        target.push(query);
    }
}

impl WindowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the window, returning the next state and the
    /// requests the tile cache must apply, in order: `On`, `Off`, `Evict`.
    pub fn advance(&self, event: &FetchEvent, config: &WindowConfig) -> (WindowState, WindowDelta) {
        let pivot = event.query();
        let on_band = band(pivot, config.on_pages);
        let tracked = band(pivot, config.on_pages.max(config.off_pages));

        let (in_memory, to_evict) = if event.is_reset() {
            let evicted = self
                .in_memory
                .iter()
                .filter(|query| !tracked.contains(query))
                .cloned()
                .collect();
            (tracked.clone(), evicted)
        } else {
            let mut in_memory = self.in_memory.clone();
            for query in &tracked {
                push_distinct(&mut in_memory, query.clone());
            }

            let floor = on_band
                .iter()
                .map(|query| query.offset)
                .min()
                .unwrap_or(pivot.offset);
            let threshold = config.eviction_pages.saturating_mul(pivot.limit);

            let (kept, evicted): (Vec<Query>, Vec<Query>) = in_memory
                .into_iter()
                .partition(|query| query.offset.abs_diff(floor) <= threshold);
            (kept, evicted)
        };

        let mut requests: Vec<TileRequest> =
            on_band.iter().cloned().map(TileRequest::On).collect();
        requests.extend(
            self.current_queries
                .iter()
                .filter(|query| !on_band.contains(query))
                .cloned()
                .map(TileRequest::Off),
        );
        requests.extend(to_evict.iter().cloned().map(TileRequest::Evict));

        let next = WindowState {
            previous_queries: self.current_queries.clone(),
            current_queries: on_band,
            in_memory,
            to_evict,
        };
        let delta = WindowDelta {
            reset: event.is_reset(),
            pivot: pivot.clone(),
            requests,
        };
        (next, delta)
    }
}
