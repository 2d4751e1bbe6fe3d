pub mod backoff;
pub mod fetcher;

pub use backoff::{exponential_backoff, BackoffConfig};
pub use fetcher::{BackoffFetcher, FetchKey, Fetched};
