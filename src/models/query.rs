//! Paging descriptors for archive content.
//!
//! A [`Query`] names exactly one page of one content kind under one set of
//! filters. Queries are plain values: equal queries always resolve to the same
//! page, which is what lets the window manager and tile cache key on them.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_LIMIT: u32 = 6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum ContentKind {
    Articles,
    Projects,
    Talks,
}

impl ContentKind {
    pub const ALL: [ContentKind; 3] = [
        ContentKind::Articles,
        ContentKind::Projects,
        ContentKind::Talks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Articles => "articles",
            ContentKind::Projects => "projects",
            ContentKind::Talks => "talks",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "articles" => Ok(ContentKind::Articles),
            "projects" => Ok(ContentKind::Projects),
            "talks" => Ok(ContentKind::Talks),
            other => Err(anyhow!("unknown content kind '{other}'")),
        }
    }

    /// Key under which the change-list cursor for this kind is persisted.
    pub fn collection_key(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag and category descriptors a page is filtered by.
///
/// Within one set an item matches if it carries any of the descriptors; both
/// sets must match when both are non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ContentFilter {
    pub tags: BTreeSet<String>,
    pub categories: BTreeSet<String>,
}

impl ContentFilter {
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.insert(category.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TemporalFilter {
    pub year: i32,
    /// 1-based month; `None` selects the whole year.
    pub month: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub kind: ContentKind,
    pub offset: u32,
    pub limit: u32,
    pub content_filter: ContentFilter,
    pub temporal_filter: Option<TemporalFilter>,
}

impl Query {
    pub fn new(kind: ContentKind) -> Self {
        Self {
            kind,
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
            content_filter: ContentFilter::default(),
            temporal_filter: None,
        }
    }

    pub fn with_offset(&self, offset: u32) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_filter(mut self, filter: ContentFilter) -> Self {
        self.content_filter = filter;
        self
    }

    pub fn with_temporal_filter(mut self, filter: TemporalFilter) -> Self {
        self.temporal_filter = Some(filter);
        self
    }

    /// The query `pages` pages away from this one, or `None` when that page
    /// would start before the first item.
    pub fn shifted(&self, pages: i64) -> Option<Self> {
        let offset = i64::from(self.offset) + pages * i64::from(self.limit);
        u32::try_from(offset).ok().map(|offset| self.with_offset(offset))
    }

    /// Absolute offset distance between two queries.
    pub fn distance(&self, other: &Query) -> u32 {
        self.offset.abs_diff(other.offset)
    }

    /// Pivot sort: ascending offset.
    pub fn pivot_cmp(a: &Query, b: &Query) -> Ordering {
        a.offset.cmp(&b.offset)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}+{}]", self.kind, self.offset, self.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifted_drops_negative_offsets() {
        let query = Query::new(ContentKind::Articles);
        assert_eq!(query.shifted(-1), None);
        assert_eq!(query.shifted(2).map(|q| q.offset), Some(12));

        let later = query.with_offset(12);
        assert_eq!(later.shifted(-2).map(|q| q.offset), Some(0));
    }

    #[test]
    fn equality_covers_every_field() {
        let base = Query::new(ContentKind::Talks);
        let filtered = base
            .clone()
            .with_filter(ContentFilter::default().with_tag("rust"));
        assert_ne!(base, filtered);
        assert_ne!(base, base.clone().with_limit(12));
        assert_eq!(base, Query::new(ContentKind::Talks));
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in ContentKind::ALL {
            assert_eq!(ContentKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(ContentKind::parse("podcasts").is_err());
    }
}
