use std::sync::Arc;

use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::ConnectivityMonitor;
use crate::network::ArchiveApi;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const PROBE_TIMEOUT_SECS: u64 = 5;

/// Periodically ping the archive server and publish reachability.
pub async fn probe_loop(
    api: Arc<dyn ArchiveApi>,
    monitor: ConnectivityMonitor,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reachable = match tokio::time::timeout(
                    Duration::from_secs(PROBE_TIMEOUT_SECS),
                    api.ping(),
                )
                .await
                {
                    Ok(Ok(())) => true,
                    Ok(Err(err)) => {
                        if monitor.is_reachable() {
                            log_warn!("reachability probe failed: {err}");
                        }
                        false
                    }
                    Err(_) => {
                        if monitor.is_reachable() {
                            log_warn!("reachability probe timed out (> {}s)", PROBE_TIMEOUT_SECS);
                        }
                        false
                    }
                };

                if monitor.set_reachable(reachable) {
                    log_info!("network is now {}", if reachable { "reachable" } else { "unreachable" });
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("probe loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::models::{ChangeListItem, ContentKind, Item, ItemDraft, Query};
    use crate::network::ApiError;

    struct Flaky {
        up: AtomicBool,
    }

    #[async_trait]
    impl ArchiveApi for Flaky {
        async fn fetch_page(&self, _: &Query) -> Result<Vec<Item>, ApiError> {
            Ok(Vec::new())
        }

        async fn fetch_item(&self, _: ContentKind, id: &str) -> Result<Item, ApiError> {
            Err(ApiError::Transport(format!("no item {id}")))
        }

        async fn upsert_item(
            &self,
            _: ContentKind,
            _: Option<&str>,
            _: &ItemDraft,
        ) -> Result<String, ApiError> {
            Err(ApiError::Transport("offline".into()))
        }

        async fn fetch_change_list(
            &self,
            _: &str,
            _: Option<&str>,
        ) -> Result<Vec<ChangeListItem>, ApiError> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<(), ApiError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ApiError::Transport("connection refused".into()))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probe_tracks_server_state() {
        let api = Arc::new(Flaky {
            up: AtomicBool::new(false),
        });
        let monitor = ConnectivityMonitor::new(true);
        let cancel = CancellationToken::new();
        let mut rx = monitor.subscribe();

        let task = tokio::spawn(probe_loop(
            api.clone(),
            monitor.clone(),
            Duration::from_secs(1),
            cancel.clone(),
        ));

        rx.wait_for(|reachable| !*reachable).await.unwrap();
        api.up.store(true, Ordering::SeqCst);
        rx.wait_for(|reachable| *reachable).await.unwrap();

        cancel.cancel();
        task.await.unwrap();
    }
}
