use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::processor::ChunkProcessor;
use super::state::{SyncOutcome, SyncPhase};
use super::{SyncConfig, SyncRequest};
use crate::connectivity::ConnectivityMonitor;
use crate::network::ArchiveApi;
use crate::store::LocalStore;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

struct Run {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    outcome: watch::Receiver<Option<SyncOutcome>>,
}

#[derive(Default)]
struct State {
    collections: HashMap<String, Arc<dyn ChunkProcessor>>,
    phases: HashMap<String, watch::Sender<SyncPhase>>,
    runs: HashMap<String, Run>,
}

/// Incremental change-list sync for every registered collection.
///
/// Runs for one collection key are strictly sequential and "latest wins":
/// starting a run cancels the one in flight and waits for it to stop before
/// reading the cursor. Different keys sync in parallel.
pub struct ChangeListSynchronizer {
    api: Arc<dyn ArchiveApi>,
    store: Arc<dyn LocalStore>,
    config: SyncConfig,
    state: Mutex<State>,
    cancel_token: CancellationToken,
}

impl ChangeListSynchronizer {
    pub fn new(
        api: Arc<dyn ArchiveApi>,
        store: Arc<dyn LocalStore>,
        config: SyncConfig,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            store,
            config,
            state: Mutex::new(State::default()),
            cancel_token,
        })
    }

    pub fn register(&self, request: SyncRequest) {
        let mut state = self.lock();
        state
            .phases
            .entry(request.key.clone())
            .or_insert_with(|| watch::channel(SyncPhase::Idle).0);
        state.collections.insert(request.key, request.processor);
    }

    pub fn registered(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().collections.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Start a run for `key`, superseding any run in flight. Returns `false`
    /// for unknown keys.
    pub fn sync(&self, key: &str) -> bool {
        let mut state = self.lock();
        let Some(processor) = state.collections.get(key).cloned() else {
            log_warn!("sync requested for unregistered collection {key}");
            return false;
        };
        let Some(phase) = state.phases.get(key).cloned() else {
            return false;
        };

        let previous = state.runs.remove(key).map(|run| {
            run.cancel.cancel();
            run.handle
        });

        let cancel = self.cancel_token.child_token();
        let (outcome_tx, outcome) = watch::channel(None);
        let job = SyncJob {
            key: key.to_string(),
            processor,
            api: self.api.clone(),
            store: self.store.clone(),
            chunk_size: self.config.chunk_size.max(1),
            phase,
            cancel: cancel.clone(),
        };

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let outcome = job.run().await;
            match &outcome {
                SyncOutcome::FetchFailed | SyncOutcome::ChunkFailed { .. } => {
                    log_warn!("sync {}: {outcome}", job.key)
                }
                _ => log_info!("sync {}: {outcome}", job.key),
            }
            outcome_tx.send_replace(Some(outcome));
        });

        state.runs.insert(
            key.to_string(),
            Run {
                cancel,
                handle,
                outcome,
            },
        );
        true
    }

    pub fn sync_all(&self) {
        for key in self.registered() {
            self.sync(&key);
        }
    }

    pub fn phase(&self, key: &str) -> Option<SyncPhase> {
        self.lock().phases.get(key).map(|phase| phase.borrow().clone())
    }

    /// Wait for the latest run of `key` to finish. `None` if it never ran.
    pub async fn wait_idle(&self, key: &str) -> Option<SyncOutcome> {
        let mut outcome = self.lock().runs.get(key)?.outcome.clone();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(done) => done.clone(),
            Err(_) => Some(SyncOutcome::Cancelled),
        };
        result
    }

    /// Sync every registered collection now if the network is up, then again
    /// whenever it comes back.
    pub async fn run_on_reconnect(
        self: Arc<Self>,
        connectivity: ConnectivityMonitor,
        cancel_token: CancellationToken,
    ) {
        let mut reachable = connectivity.subscribe();
        let mut was_reachable = *reachable.borrow_and_update();
        if was_reachable {
            log_info!("network already reachable; syncing all collections");
            self.sync_all();
        }

        loop {
            tokio::select! {
                changed = reachable.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_reachable = *reachable.borrow_and_update();
                    if now_reachable && !was_reachable {
                        log_info!("network is back; resyncing all collections");
                        self.sync_all();
                    }
                    was_reachable = now_reachable;
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    /// Cancel all runs and wait for them to stop.
    pub async fn shutdown(&self) {
        let runs: Vec<Run> = self.lock().runs.drain().map(|(_, run)| run).collect();
        for run in runs {
            run.cancel.cancel();
            if let Err(err) = run.handle.await {
                log_error!("sync task failed: {err}");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct SyncJob {
    key: String,
    processor: Arc<dyn ChunkProcessor>,
    api: Arc<dyn ArchiveApi>,
    store: Arc<dyn LocalStore>,
    chunk_size: usize,
    phase: watch::Sender<SyncPhase>,
    cancel: CancellationToken,
}

impl SyncJob {
    async fn run(&self) -> SyncOutcome {
        let outcome = tokio::select! {
            outcome = self.apply() => outcome,
            _ = self.cancel.cancelled() => SyncOutcome::Cancelled,
        };
        self.phase.send_replace(SyncPhase::Idle);
        outcome
    }

    async fn apply(&self) -> SyncOutcome {
        let cursor = match self.store.get_cursor(&self.key).await {
            Ok(cursor) => cursor,
            Err(err) => {
                log_warn!("failed to read cursor for {}: {err:#}", self.key);
                return SyncOutcome::FetchFailed;
            }
        };
        self.phase.send_replace(SyncPhase::Fetching {
            cursor: cursor.clone(),
        });

        let changes = match self
            .api
            .fetch_change_list(&self.key, cursor.as_deref())
            .await
        {
            Ok(changes) => changes,
            Err(err) => {
                log_debug!("change list for {} unavailable: {err}", self.key);
                return SyncOutcome::FetchFailed;
            }
        };
        if changes.is_empty() {
            return SyncOutcome::UpToDate;
        }

        let mut applied = 0;
        for (index, chunk) in changes.chunks(self.chunk_size).enumerate() {
            let Some(last) = chunk.last() else {
                continue;
            };
            self.phase.send_replace(SyncPhase::Applying {
                chunk: index,
                last_id: last.id.clone(),
            });

            if let Err(err) = self.processor.process(&self.key, chunk).await {
                log_warn!("chunk {index} of {} failed: {err:#}", self.key);
                return SyncOutcome::ChunkFailed { applied };
            }
            if let Err(err) = self.store.set_cursor(&self.key, &last.id).await {
                log_warn!("failed to persist cursor for {}: {err:#}", self.key);
                return SyncOutcome::ChunkFailed { applied };
            }
            applied += chunk.len();
        }

        match changes.last() {
            Some(last) => SyncOutcome::Completed {
                applied,
                cursor: last.id.clone(),
            },
            None => SyncOutcome::UpToDate,
        }
    }
}
