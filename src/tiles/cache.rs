//! Windowed tile cache.
//!
//! One actor task per feed owns every tile (query -> page) for that feed. It
//! applies window deltas in arrival order, keeps one subscription to the page
//! source per turned-on tile, and publishes a merged, de-duplicated, offset
//! ordered item list once churn settles for `debounce`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{PageSource, TileCacheConfig};
use crate::models::{FeedItem, Page, Query};
use crate::monitor::Monitor;
use crate::window::{TileRequest, WindowDelta};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

const UPDATE_QUEUE_DEPTH: usize = 64;

struct Subscription {
    generation: u64,
    cancel: CancellationToken,
    _monitor: Monitor<Page>,
}

struct Tile {
    page: Page,
    subscription: Option<Subscription>,
    /// Logical time of the last `On`.
    touched: u64,
}

struct TileUpdate {
    query: Query,
    generation: u64,
    page: Page,
}

struct TileCache {
    source: Arc<dyn PageSource>,
    config: TileCacheConfig,
    tiles: HashMap<Query, Tile>,
    pivot: Option<Query>,
    reset_pending: bool,
    clock: u64,
    updates: mpsc::Sender<TileUpdate>,
    forwarders: JoinSet<()>,
    cancel: CancellationToken,
}

impl TileCache {
    fn new(
        source: Arc<dyn PageSource>,
        config: TileCacheConfig,
        updates: mpsc::Sender<TileUpdate>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            config,
            tiles: HashMap::new(),
            pivot: None,
            reset_pending: false,
            clock: 0,
            updates,
            forwarders: JoinSet::new(),
            cancel,
        }
    }

    fn apply_delta(&mut self, delta: WindowDelta) {
        self.pivot = Some(delta.pivot);
        self.reset_pending = delta.reset;
        for request in delta.requests {
            match request {
                // Tiles that survive a reset are reopened so they fetch again.
                TileRequest::On(query) if delta.reset => {
                    self.turn_off(&query);
                    self.source.evict(&query);
                    self.turn_on(query);
                }
                request => self.apply(request),
            }
        }
    }

    fn apply(&mut self, request: TileRequest) {
        match request {
            TileRequest::On(query) => self.turn_on(query),
            TileRequest::Off(query) => self.turn_off(&query),
            TileRequest::Evict(query) => self.evict(&query),
        }
    }

    fn turn_on(&mut self, query: Query) {
        self.clock += 1;
        let clock = self.clock;

        let tile = self.tiles.entry(query.clone()).or_insert_with(|| Tile {
            page: Page::Loading,
            subscription: None,
            touched: clock,
        });
        tile.touched = clock;
        if tile.subscription.is_some() {
            return;
        }

        log_debug!("tile {query} on");
        let monitor = self.source.open(&query);
        let pages = monitor.watch();
        let cancel = self.cancel.child_token();
        tile.subscription = Some(Subscription {
            generation: clock,
            cancel: cancel.clone(),
            _monitor: monitor,
        });

        self.forwarders.spawn(forward_pages(
            query,
            clock,
            pages,
            self.updates.clone(),
            cancel,
        ));
    }

    fn turn_off(&mut self, query: &Query) {
        if let Some(subscription) = self
            .tiles
            .get_mut(query)
            .and_then(|tile| tile.subscription.take())
        {
            log_debug!("tile {query} off");
            subscription.cancel.cancel();
        }
    }

    fn evict(&mut self, query: &Query) {
        if let Some(tile) = self.tiles.remove(query) {
            if let Some(subscription) = tile.subscription {
                subscription.cancel.cancel();
            }
            log_debug!("tile {query} evicted");
        }
        self.source.evict(query);
    }

    /// Store a page pushed by a subscription. Returns whether anything changed.
    fn accept(&mut self, update: TileUpdate) -> bool {
        let Some(tile) = self.tiles.get_mut(&update.query) else {
            return false;
        };
        match &tile.subscription {
            Some(subscription) if subscription.generation == update.generation => {}
            _ => return false,
        }
        // A resubscription starts from Loading; keep showing what we had.
        if update.page.is_loading() && !tile.page.is_loading() {
            return false;
        }
        if tile.page == update.page {
            return false;
        }
        tile.page = update.page;
        true
    }

    fn snapshot(&self) -> Vec<FeedItem> {
        let mut tiles: Vec<(&Query, &Tile)> = self.tiles.iter().collect();
        tiles.sort_by(|(query_a, tile_a), (query_b, tile_b)| {
            let by_distance = match &self.pivot {
                Some(pivot) => query_a.distance(pivot).cmp(&query_b.distance(pivot)),
                None => std::cmp::Ordering::Equal,
            };
            by_distance.then(tile_b.touched.cmp(&tile_a.touched))
        });
        tiles.truncate(self.config.limiter);
        tiles.sort_by(|(a, _), (b, _)| Query::pivot_cmp(a, b));

        let mut requested = self
            .tiles
            .values()
            .filter(|tile| tile.subscription.is_some())
            .peekable();
        let requested_all_loading =
            requested.peek().is_some() && requested.all(|tile| tile.page.is_loading());
        if self.reset_pending && requested_all_loading {
            return vec![FeedItem::Loading];
        }

        let mut seen = HashSet::new();
        let items: Vec<FeedItem> = tiles
            .iter()
            .flat_map(|(_, tile)| tile.page.items())
            .filter(|item| seen.insert(item.key()))
            .cloned()
            .map(FeedItem::Loaded)
            .collect();

        if items.is_empty() && self.tiles.values().any(|tile| tile.page.is_loading()) {
            return vec![FeedItem::Loading];
        }
        items
    }

    async fn shutdown(mut self) {
        self.cancel.cancel();
        self.forwarders.shutdown().await;
    }
}

async fn forward_pages(
    query: Query,
    generation: u64,
    mut pages: watch::Receiver<Page>,
    updates: mpsc::Sender<TileUpdate>,
    cancel: CancellationToken,
) {
    let mut page = pages.borrow_and_update().clone();
    loop {
        let update = TileUpdate {
            query: query.clone(),
            generation,
            page,
        };
        if updates.send(update).await.is_err() {
            break;
        }

        tokio::select! {
            changed = pages.changed() => {
                if changed.is_err() {
                    break;
                }
                page = pages.borrow_and_update().clone();
            }
            _ = cancel.cancelled() => break,
        }
    }
}

fn publish(output: &watch::Sender<Vec<FeedItem>>, snapshot: Vec<FeedItem>) {
    output.send_if_modified(|current| {
        if *current == snapshot {
            false
        } else {
            *current = snapshot;
            true
        }
    });
}

/// Run a tile cache until `cancel_token` fires, the delta stream ends or
/// nobody is listening to `output` any more. Every page subscription is
/// released before this returns.
pub async fn tile_cache_loop(
    source: Arc<dyn PageSource>,
    config: TileCacheConfig,
    mut deltas: mpsc::Receiver<WindowDelta>,
    output: watch::Sender<Vec<FeedItem>>,
    cancel_token: CancellationToken,
) {
    let (updates_tx, mut updates_rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);
    let mut cache = TileCache::new(source, config, updates_tx, cancel_token.child_token());

    let debounce = tokio::time::sleep(config.debounce);
    tokio::pin!(debounce);
    let mut dirty = false;

    loop {
        let changed = tokio::select! {
            delta = deltas.recv() => match delta {
                Some(delta) => {
                    cache.apply_delta(delta);
                    true
                }
                None => break,
            },
            Some(update) = updates_rx.recv() => cache.accept(update),
            Some(_) = cache.forwarders.join_next(), if !cache.forwarders.is_empty() => false,
            () = &mut debounce, if dirty => {
                dirty = false;
                publish(&output, cache.snapshot());
                false
            }
            _ = output.closed() => break,
            _ = cancel_token.cancelled() => break,
        };

        if changed {
            dirty = true;
            debounce.as_mut().reset(Instant::now() + config.debounce);
        }
    }

    cache.shutdown().await;
    log_info!("tile cache shutting down");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::{ContentKind, Item};

    #[derive(Default)]
    struct FakeSource {
        pages: Mutex<HashMap<Query, watch::Sender<Page>>>,
        opened: Mutex<Vec<u32>>,
        released: Arc<Mutex<Vec<u32>>>,
        evicted: Mutex<Vec<u32>>,
    }

    impl FakeSource {
        fn sender(&self, query: &Query) -> watch::Sender<Page> {
            self.pages
                .lock()
                .unwrap()
                .entry(query.clone())
                .or_insert_with(|| watch::channel(Page::Loading).0)
                .clone()
        }

        fn publish(&self, query: &Query, ids: &[&str]) {
            self.sender(query)
                .send_replace(Page::Loaded(ids.iter().map(|id| article(id)).collect()));
        }
    }

    impl PageSource for FakeSource {
        fn open(&self, query: &Query) -> Monitor<Page> {
            self.opened.lock().unwrap().push(query.offset);
            let released = self.released.clone();
            let offset = query.offset;
            Monitor::new(self.sender(query).subscribe(), move || {
                released.lock().unwrap().push(offset)
            })
        }

        fn evict(&self, query: &Query) {
            self.evicted.lock().unwrap().push(query.offset);
        }
    }

    fn article(id: &str) -> Item {
        Item {
            id: id.to_string(),
            kind: ContentKind::Articles,
            title: id.to_string(),
            summary: None,
            tags: Vec::new(),
            categories: Vec::new(),
            body: serde_json::Value::Null,
            published_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn q(offset: u32) -> Query {
        Query::new(ContentKind::Articles).with_offset(offset)
    }

    fn delta(reset: bool, pivot: u32, requests: Vec<TileRequest>) -> WindowDelta {
        WindowDelta {
            reset,
            pivot: q(pivot),
            requests,
        }
    }

    fn ids(items: &[FeedItem]) -> Vec<String> {
        items
            .iter()
            .map(|entry| match entry {
                FeedItem::Loading => "<loading>".to_string(),
                FeedItem::Loaded(item) => item.id.clone(),
            })
            .collect()
    }

    struct Harness {
        source: Arc<FakeSource>,
        deltas: mpsc::Sender<WindowDelta>,
        output: watch::Receiver<Vec<FeedItem>>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn harness(limiter: usize) -> Harness {
        let source = Arc::new(FakeSource::default());
        let (deltas, delta_rx) = mpsc::channel(16);
        let (output_tx, output) = watch::channel(Vec::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(tile_cache_loop(
            source.clone(),
            TileCacheConfig {
                limiter,
                debounce: Duration::from_millis(150),
            },
            delta_rx,
            output_tx,
            cancel.clone(),
        ));
        Harness {
            source,
            deltas,
            output,
            cancel,
            task,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn merged_output_is_offset_ordered_and_distinct() {
        let h = harness(4);
        h.deltas
            .send(delta(
                true,
                0,
                vec![TileRequest::On(q(0)), TileRequest::On(q(6))],
            ))
            .await
            .unwrap();
        settle().await;
        assert_eq!(ids(&h.output.borrow()), vec!["<loading>"]);

        // Later page lands first; "shared" is on both pages.
        h.source.publish(&q(6), &["c", "shared"]);
        settle().await;
        h.source.publish(&q(0), &["a", "shared"]);
        settle().await;

        assert_eq!(ids(&h.output.borrow()), vec!["a", "shared", "c"]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn off_keeps_last_page_and_evict_discards_it() {
        let h = harness(4);
        h.source.publish(&q(0), &["a"]);
        h.source.publish(&q(6), &["b"]);
        h.deltas
            .send(delta(
                false,
                0,
                vec![TileRequest::On(q(0)), TileRequest::On(q(6))],
            ))
            .await
            .unwrap();
        settle().await;
        assert_eq!(ids(&h.output.borrow()), vec!["a", "b"]);

        h.deltas
            .send(delta(false, 6, vec![TileRequest::Off(q(0))]))
            .await
            .unwrap();
        settle().await;
        // Changes after Off are not observed, the cached page stays.
        h.source.publish(&q(0), &["a2"]);
        settle().await;
        assert_eq!(ids(&h.output.borrow()), vec!["a", "b"]);

        h.deltas
            .send(delta(false, 6, vec![TileRequest::Evict(q(0))]))
            .await
            .unwrap();
        settle().await;
        assert_eq!(ids(&h.output.borrow()), vec!["b"]);
        assert_eq!(*h.source.released.lock().unwrap(), vec![0]);
        assert_eq!(*h.source.evicted.lock().unwrap(), vec![0]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn re_on_replays_cached_page_without_flicker() {
        let h = harness(4);
        h.source.publish(&q(0), &["a"]);
        h.deltas
            .send(delta(false, 0, vec![TileRequest::On(q(0))]))
            .await
            .unwrap();
        settle().await;

        h.deltas
            .send(delta(false, 6, vec![TileRequest::Off(q(0))]))
            .await
            .unwrap();
        // The source forgets its value; a resubscription starts at Loading.
        h.source.sender(&q(0)).send_replace(Page::Loading);
        h.deltas
            .send(delta(false, 0, vec![TileRequest::On(q(0))]))
            .await
            .unwrap();
        settle().await;

        assert_eq!(ids(&h.output.borrow()), vec!["a"]);
        assert_eq!(*h.source.opened.lock().unwrap(), vec![0, 0]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reset_reopens_tiles_it_keeps() {
        let h = harness(4);
        h.source.publish(&q(0), &["a"]);
        h.deltas
            .send(delta(true, 0, vec![TileRequest::On(q(0))]))
            .await
            .unwrap();
        settle().await;
        assert_eq!(ids(&h.output.borrow()), vec!["a"]);

        h.deltas
            .send(delta(true, 0, vec![TileRequest::On(q(0))]))
            .await
            .unwrap();
        settle().await;

        // The old subscription is released and forgotten before the new one opens.
        assert_eq!(*h.source.opened.lock().unwrap(), vec![0, 0]);
        assert_eq!(*h.source.released.lock().unwrap(), vec![0]);
        assert_eq!(*h.source.evicted.lock().unwrap(), vec![0, 0]);
        assert_eq!(ids(&h.output.borrow()), vec!["a"]);

        h.source.publish(&q(0), &["a", "fresh"]);
        settle().await;
        assert_eq!(ids(&h.output.borrow()), vec!["a", "fresh"]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_drops_pages_farthest_from_pivot() {
        let h = harness(2);
        for offset in [0, 6, 12] {
            h.source.publish(&q(offset), &[&format!("item{offset}")]);
        }
        h.deltas
            .send(delta(
                false,
                12,
                vec![
                    TileRequest::On(q(0)),
                    TileRequest::On(q(6)),
                    TileRequest::On(q(12)),
                ],
            ))
            .await
            .unwrap();
        settle().await;

        assert_eq!(ids(&h.output.borrow()), vec!["item6", "item12"]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_are_debounced_into_one_update() {
        let mut h = harness(4);
        h.source.publish(&q(0), &["a"]);
        h.source.publish(&q(6), &["b"]);
        h.output.borrow_and_update();

        h.deltas
            .send(delta(false, 0, vec![TileRequest::On(q(0))]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.deltas
            .send(delta(false, 0, vec![TileRequest::On(q(6))]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.output.has_changed().unwrap());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.output.has_changed().unwrap());
        assert_eq!(ids(&h.output.borrow_and_update()), vec!["a", "b"]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reset_shows_placeholder_but_resubscription_keeps_items() {
        let h = harness(4);
        h.source.publish(&q(0), &["a"]);
        h.deltas
            .send(delta(false, 0, vec![TileRequest::On(q(0))]))
            .await
            .unwrap();
        settle().await;

        // A non-reset pivot move onto an unloaded page keeps the old items.
        h.deltas
            .send(delta(false, 6, vec![TileRequest::On(q(6))]))
            .await
            .unwrap();
        settle().await;
        assert_eq!(ids(&h.output.borrow()), vec!["a"]);

        // A reset that evicts everything shows the placeholder.
        h.deltas
            .send(delta(
                true,
                12,
                vec![
                    TileRequest::On(q(12)),
                    TileRequest::Evict(q(0)),
                    TileRequest::Evict(q(6)),
                ],
            ))
            .await
            .unwrap();
        settle().await;
        assert_eq!(ids(&h.output.borrow()), vec!["<loading>"]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }
}
