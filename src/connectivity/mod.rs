mod probe;

pub use probe::probe_loop;

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Live "is the archive server reachable" flag.
///
/// Cheap to clone; every clone shares the same underlying state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(reachable: bool) -> Self {
        let (state, _) = watch::channel(reachable);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_reachable(&self) -> bool {
        *self.state.borrow()
    }

    /// Returns `true` when the value actually changed.
    pub fn set_reachable(&self, reachable: bool) -> bool {
        self.state.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Park until the network is reachable. Returns `false` if `cancel` fired
    /// first.
    pub async fn wait_until_reachable(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.subscribe();
        tokio::select! {
            result = rx.wait_for(|reachable| *reachable) => result.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
