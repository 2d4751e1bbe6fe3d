//! Archive entries and the page/feed values built from them.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use super::ContentKind;

/// Identity of an item across the whole archive.
pub type ItemKey = (ContentKind, String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub kind: ContentKind,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Kind-specific content (article body, talk video link, ...).
    #[serde(default)]
    pub body: serde_json::Value,
    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn key(&self) -> ItemKey {
        (self.kind, self.id.clone())
    }

    pub fn published_year(&self) -> i32 {
        self.published_at.year()
    }

    pub fn published_month(&self) -> u32 {
        self.published_at.month()
    }
}

/// Payload for a user-initiated create or update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemDraft {
    pub title: String,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
    pub body: serde_json::Value,
    pub published_at: Option<DateTime<Utc>>,
}

/// Materialized content for one query.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Page {
    #[default]
    Loading,
    Loaded(Vec<Item>),
}

impl Page {
    pub fn is_loading(&self) -> bool {
        matches!(self, Page::Loading)
    }

    pub fn items(&self) -> &[Item] {
        match self {
            Page::Loading => &[],
            Page::Loaded(items) => items,
        }
    }
}

/// One row of the merged list handed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Loading,
    Loaded(Item),
}

impl FeedItem {
    pub fn item(&self) -> Option<&Item> {
        match self {
            FeedItem::Loading => None,
            FeedItem::Loaded(item) => Some(item),
        }
    }
}
