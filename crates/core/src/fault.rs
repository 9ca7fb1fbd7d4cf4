use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::{error, info};

use crate::Error;
use crate::error::SkipReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultLabel {
    /// The run cannot be confirmed as a new backup point.
    ForceNoBackupCreation,
    Unlabeled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredFault {
    pub item_id: Option<String>,
    pub label: FaultLabel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    pub reason: SkipReason,
    pub drive_id: String,
    pub item_id: String,
    pub item_name: String,
}

#[derive(Debug, Default)]
struct FaultState {
    failure: Option<String>,
    recovered: Vec<RecoveredFault>,
    skipped: Vec<SkippedItem>,
}

/// Run-wide collector of per-item faults and skips.
#[derive(Debug)]
pub struct FaultBus {
    fail_fast: bool,
    state: Mutex<FaultState>,
}

impl FaultBus {
    pub fn new(fail_fast: bool) -> Self {
        Self {
            fail_fast,
            state: Mutex::new(FaultState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail(&self, err: &Error) {
        let mut state = self.lock();
        if state.failure.is_none() {
            error!(event = "fault.failure", error = %err, "fault.failure");
            state.failure = Some(err.to_string());
        }
    }

    pub fn add_recoverable(&self, err: &Error, label: FaultLabel) {
        self.record(None, err, label);
    }

    pub fn add_item_recoverable(&self, item_id: &str, err: &Error, label: FaultLabel) {
        self.record(Some(item_id.to_string()), err, label);
    }

    fn record(&self, item_id: Option<String>, err: &Error, label: FaultLabel) {
        error!(
            event = "fault.recoverable",
            item_id = item_id.as_deref().unwrap_or(""),
            error = %err,
            "fault.recoverable"
        );
        let mut state = self.lock();
        let message = err.to_string();
        if self.fail_fast && state.failure.is_none() {
            state.failure = Some(message.clone());
        }
        state.recovered.push(RecoveredFault {
            item_id,
            label,
            message,
        });
    }

    pub fn add_skip(&self, skip: SkippedItem) {
        info!(
            event = "fault.skip",
            skipped_reason = %skip.reason,
            drive_id = %skip.drive_id,
            item_id = %skip.item_id,
            "fault.skip"
        );
        self.lock().skipped.push(skip);
    }

    pub fn failure(&self) -> bool {
        self.lock().failure.is_some()
    }

    pub fn failure_message(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    pub fn recovered(&self) -> Vec<RecoveredFault> {
        self.lock().recovered.clone()
    }

    pub fn skipped(&self) -> Vec<SkippedItem> {
        self.lock().skipped.clone()
    }

    /// Item-scoped faults keyed by item id, plus every fault not tied to
    /// a single item.
    pub fn items_and_recovered(&self) -> (BTreeMap<String, RecoveredFault>, Vec<RecoveredFault>) {
        let state = self.lock();
        let mut items = BTreeMap::new();
        let mut other = Vec::new();
        for fault in &state.recovered {
            match &fault.item_id {
                Some(id) => {
                    items.insert(id.clone(), fault.clone());
                }
                None => other.push(fault.clone()),
            }
        }
        (items, other)
    }

    pub fn forces_no_backup_creation(&self) -> bool {
        let state = self.lock();
        state.failure.is_some()
            || state
                .recovered
                .iter()
                .any(|f| f.label == FaultLabel::ForceNoBackupCreation)
    }
}

impl Default for FaultBus {
    fn default() -> Self {
        Self::new(false)
    }
}
