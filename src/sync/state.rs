use std::fmt;

/// Where one collection's sync currently is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Fetching {
        cursor: Option<String>,
    },
    Applying {
        chunk: usize,
        last_id: String,
    },
}

/// How a sync run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every change was applied; `cursor` is now durable.
    Completed { applied: usize, cursor: String },
    /// The server had nothing after the stored cursor.
    UpToDate,
    /// The change list could not be read. Nothing was written.
    FetchFailed,
    /// A chunk failed; only the `applied` changes before it are committed.
    ChunkFailed { applied: usize },
    /// Superseded by a newer run or shut down.
    Cancelled,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Completed { applied, cursor } => {
                write!(f, "applied {applied} changes, cursor at {cursor}")
            }
            SyncOutcome::UpToDate => write!(f, "up to date"),
            SyncOutcome::FetchFailed => write!(f, "change list unavailable"),
            SyncOutcome::ChunkFailed { applied } => {
                write!(f, "stopped after {applied} changes")
            }
            SyncOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}
