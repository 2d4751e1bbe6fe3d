//! Remote archive capability.
//!
//! Everything above this module talks to the server through [`ArchiveApi`];
//! [`HttpArchiveApi`] is the production transport.

mod http;

pub use http::HttpArchiveApi;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ChangeListItem, ContentKind, Item, ItemDraft, Query};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("session is no longer valid")]
    Unauthorized,
    #[error("server rejected request ({status} {code}): {message}")]
    Status {
        status: u16,
        code: String,
        message: String,
    },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether retrying the same request can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => *status >= 500 || *status == 429,
            ApiError::Unauthorized | ApiError::Decode(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status: 404, .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait ArchiveApi: Send + Sync + 'static {
    async fn fetch_page(&self, query: &Query) -> Result<Vec<Item>, ApiError>;

    async fn fetch_item(&self, kind: ContentKind, id: &str) -> Result<Item, ApiError>;

    /// Full records for a batch of ids, in request order.
    async fn fetch_items(&self, kind: ContentKind, ids: &[String]) -> Result<Vec<Item>, ApiError> {
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            items.push(self.fetch_item(kind, id).await?);
        }
        Ok(items)
    }

    /// Create (`id == None`) or replace an item; returns the server-side id.
    async fn upsert_item(
        &self,
        kind: ContentKind,
        id: Option<&str>,
        draft: &ItemDraft,
    ) -> Result<String, ApiError>;

    /// Change-log entries strictly after `after`, ascending.
    async fn fetch_change_list(
        &self,
        collection: &str,
        after: Option<&str>,
    ) -> Result<Vec<ChangeListItem>, ApiError>;

    async fn ping(&self) -> Result<(), ApiError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let status = |status| ApiError::Status {
            status,
            code: "x".into(),
            message: String::new(),
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(422).is_transient());
        assert!(!ApiError::Unauthorized.is_transient());
        assert!(ApiError::Transport("connection refused".into()).is_transient());
    }
}
