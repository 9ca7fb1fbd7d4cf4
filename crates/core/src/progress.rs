use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionProgress {
    pub folder: String,
    pub items_total: u64,
    pub items_done: u64,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: CollectionProgress);
}
