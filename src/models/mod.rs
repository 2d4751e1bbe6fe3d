pub mod change_list;
pub mod item;
pub mod query;

pub use change_list::ChangeListItem;
pub use item::{FeedItem, Item, ItemDraft, ItemKey, Page};
pub use query::{ContentFilter, ContentKind, Query, TemporalFilter, DEFAULT_PAGE_LIMIT};
