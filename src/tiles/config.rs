use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCacheConfig {
    /// Maximum number of pages merged into the output.
    pub limiter: usize,
    /// Quiet period before a merged update is published.
    pub debounce: Duration,
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self {
            limiter: 4,
            debounce: Duration::from_millis(150),
        }
    }
}
