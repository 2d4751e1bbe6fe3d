use tokio::sync::watch;

/// A live view onto a value plus the subscription that keeps it live.
///
/// Dropping the monitor releases the subscription; the publisher tears its
/// work down once the last monitor for a key is gone.
pub struct Monitor<T> {
    rx: watch::Receiver<T>,
    release: ReleaseGuard,
}

struct ReleaseGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

impl<T> Monitor<T> {
    pub fn new(rx: watch::Receiver<T>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            release: ReleaseGuard(Some(Box::new(release))),
        }
    }

    /// Monitor with nothing to release.
    pub fn detached(rx: watch::Receiver<T>) -> Self {
        Self {
            rx,
            release: ReleaseGuard(None),
        }
    }

    /// Run `extra` after the existing release when this monitor drops.
    pub fn and_on_release(mut self, extra: impl FnOnce() + Send + 'static) -> Self {
        let previous = self.release.0.take();
        self.release = ReleaseGuard(Some(Box::new(move || {
            if let Some(previous) = previous {
                previous();
            }
            extra();
        })));
        self
    }

    pub fn receiver(&mut self) -> &mut watch::Receiver<T> {
        &mut self.rx
    }

    /// An extra receiver on the same value. It does not keep the
    /// subscription alive.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }
}

impl<T: Clone> Monitor<T> {
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait for the next value. `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}
