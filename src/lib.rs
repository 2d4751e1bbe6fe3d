pub mod connectivity;
pub mod db;
pub mod fetch;
pub mod models;
pub mod monitor;
pub mod network;
pub mod repository;
pub mod settings;
pub mod store;
pub mod sync;
pub mod tiles;
pub mod utils;
pub mod window;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use connectivity::{probe_loop, ConnectivityMonitor};
use db::Database;
use fetch::BackoffFetcher;
use models::{ContentKind, FeedItem, Query};
use network::{ArchiveApi, HttpArchiveApi};
use repository::ArchiveRepository;
use settings::SettingsStore;
use store::LocalStore;
use sync::{ArchiveChunkProcessor, ChangeListSynchronizer, SyncRequest};

fn data_dir() -> PathBuf {
    std::env::var("FOLIO_DATA_DIR")
        .ok()
        .filter(|dir| !dir.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("folio-data"))
}

pub async fn run() -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Folio starting up...");

    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let settings = Arc::new(SettingsStore::new(data_dir.join("settings.json"))?);
    let config = settings.snapshot();

    let database = Database::new(data_dir.join("folio.sqlite3"))?;
    let store: Arc<dyn LocalStore> = Arc::new(database);
    let http = HttpArchiveApi::new(config.base_url.clone(), settings.clone())?;
    info!(
        "Using archive server {} ({})",
        http.base_url(),
        if http.is_signed_in() { "signed in" } else { "anonymous" }
    );
    let api: Arc<dyn ArchiveApi> = Arc::new(http);

    // Everything below lives until shutdown.
    let app_token = CancellationToken::new();

    // Unreachable until the first probe answers; that transition runs the
    // initial sync.
    let connectivity = ConnectivityMonitor::new(false);
    let probe = tokio::spawn(probe_loop(
        api.clone(),
        connectivity.clone(),
        config.probe_interval(),
        app_token.clone(),
    ));

    let (fetcher, fetch_handle) = BackoffFetcher::spawn(
        api.clone(),
        store.clone(),
        connectivity.clone(),
        config.backoff_config(),
        app_token.clone(),
    );

    let synchronizer = ChangeListSynchronizer::new(
        api.clone(),
        store.clone(),
        config.sync_config(),
        app_token.clone(),
    );
    for kind in ContentKind::ALL {
        synchronizer.register(SyncRequest {
            key: kind.collection_key().to_string(),
            processor: Arc::new(ArchiveChunkProcessor::new(kind, api.clone(), store.clone())),
        });
    }
    let reconnect = tokio::spawn(
        synchronizer
            .clone()
            .run_on_reconnect(connectivity.clone(), app_token.clone()),
    );

    let repository = ArchiveRepository::new(api, store, fetcher, app_token.clone());
    let feed = repository.open_feed(config.feed_config());
    feed.reset(Query::new(ContentKind::Articles).with_limit(config.page_limit))
        .await?;
    let mut items = feed.items();

    loop {
        tokio::select! {
            changed = items.changed() => {
                if changed.is_err() {
                    break;
                }
                let (loaded, loading) = {
                    let current = items.borrow_and_update();
                    let loading = current.iter().any(|item| matches!(item, FeedItem::Loading));
                    (current.iter().filter_map(FeedItem::item).count(), loading)
                };
                info!("articles feed: {loaded} items{}", if loading { " (loading)" } else { "" });
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!("failed to listen for Ctrl-C: {err}");
                }
                break;
            }
        }
    }

    info!("Folio shutting down...");
    feed.close().await;
    synchronizer.shutdown().await;
    app_token.cancel();

    for (name, handle) in [
        ("probe", probe),
        ("fetch", fetch_handle),
        ("reconnect", reconnect),
    ] {
        if let Err(err) = handle.await {
            error!("{name} task failed to join: {err}");
        }
    }

    Ok(())
}
