use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::monitor::Monitor;

struct Entry<T> {
    subscribers: usize,
    tx: watch::Sender<T>,
    cancel: CancellationToken,
}

/// Ref-counted table of live publishers, one per key.
///
/// The first subscriber for a key starts its publisher; the last monitor to
/// drop cancels it and removes the entry.
pub(crate) struct Registry<K, T> {
    entries: Mutex<HashMap<K, Entry<T>>>,
    parent: CancellationToken,
}

impl<K, T> Registry<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + Sync + 'static,
{
    pub(crate) fn new(parent: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            parent,
        })
    }

    pub(crate) fn subscribe<F>(self: &Arc<Self>, key: K, initial: T, start: F) -> Monitor<T>
    where
        F: FnOnce(watch::Sender<T>, CancellationToken),
    {
        let rx = {
            let mut entries = self.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.subscribers += 1;
                    entry.tx.subscribe()
                }
                None => {
                    let (tx, rx) = watch::channel(initial);
                    let cancel = self.parent.child_token();
                    start(tx.clone(), cancel.clone());
                    entries.insert(
                        key.clone(),
                        Entry {
                            subscribers: 1,
                            tx,
                            cancel,
                        },
                    );
                    rx
                }
            }
        };

        let registry = Arc::downgrade(self);
        Monitor::new(rx, move || release(registry, key))
    }

    pub(crate) fn active(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<T>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn release<K, T>(registry: Weak<Registry<K, T>>, key: K)
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + Sync + 'static,
{
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let mut entries = registry.lock();
    let Some(entry) = entries.get_mut(&key) else {
        return;
    };
    entry.subscribers = entry.subscribers.saturating_sub(1);
    if entry.subscribers == 0 {
        if let Some(entry) = entries.remove(&key) {
            entry.cancel.cancel();
        }
    }
}
