use serde::{Deserialize, Serialize};

/// One entry of a server-side change log.
///
/// `id` orders the log and is what the sync cursor stores; `model_id` names
/// the record that changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeListItem {
    pub id: String,
    pub model_id: String,
    #[serde(default)]
    pub deleted: bool,
}

impl ChangeListItem {
    pub fn upsert(id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model_id: model_id.into(),
            deleted: false,
        }
    }

    pub fn deletion(id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model_id: model_id.into(),
            deleted: true,
        }
    }
}
