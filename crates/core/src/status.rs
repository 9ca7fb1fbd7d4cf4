use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub fn now_unix_ms() -> u64 {
    static LAST_UNIX_MS: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let prev = LAST_UNIX_MS.fetch_max(now, Ordering::Relaxed);
    now.max(prev)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMetrics {
    /// Files found in the collection. Directories are not counted.
    pub objects: u64,
    /// Files whose records reached the output stream.
    pub successes: u64,
    /// Sum of the sizes of successfully streamed files.
    pub bytes: u64,
}

/// Completion record handed off once a collection's stream closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStatus {
    pub folders: u64,
    pub metrics: CollectionMetrics,
    pub folder: String,
    pub finished_at: u64,
}

impl CollectionStatus {
    pub fn completed(folder: impl Into<String>, metrics: CollectionMetrics) -> Self {
        Self {
            folders: 1,
            metrics,
            folder: folder.into(),
            finished_at: now_unix_ms(),
        }
    }
}

pub trait StatusSink: Send + Sync {
    fn on_status(&self, status: CollectionStatus);
}
