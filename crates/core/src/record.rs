use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::Error;
use crate::api::BoxFuture;
use crate::handler::ItemInfo;

/// Content fetch registered for a data record; runs at most once.
pub type ContentFetch = Box<dyn FnOnce() -> BoxFuture<'static, crate::Result<Vec<u8>>> + Send>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("reading item {item_id}: {source}")]
pub struct ReadError {
    pub item_id: String,
    #[source]
    pub source: Arc<Error>,
}

#[derive(Debug, Clone)]
struct Fetched {
    bytes: Vec<u8>,
    deleted: bool,
}

type Outcome = std::result::Result<Fetched, Arc<Error>>;

struct Deferred {
    pending: Mutex<Option<Pending>>,
    outcome: watch::Receiver<Option<Outcome>>,
}

struct Pending {
    fetch: ContentFetch,
    done: watch::Sender<Option<Outcome>>,
}

enum Payload {
    Ready(Vec<u8>),
    Deferred(Deferred),
}

/// One entry of a collection's output stream.
///
/// Data records defer their download until the first [`BackupItem::read`];
/// metadata records carry their bytes from the start.
pub struct BackupItem {
    id: String,
    mod_time: DateTime<Utc>,
    info: Option<ItemInfo>,
    payload: Payload,
}

impl fmt::Debug for BackupItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupItem")
            .field("id", &self.id)
            .field("mod_time", &self.mod_time)
            .field("deferred", &matches!(self.payload, Payload::Deferred(_)))
            .finish_non_exhaustive()
    }
}

impl BackupItem {
    pub fn lazy(
        id: impl Into<String>,
        mod_time: DateTime<Utc>,
        info: ItemInfo,
        fetch: ContentFetch,
    ) -> Self {
        let (done, outcome) = watch::channel(None);
        Self {
            id: id.into(),
            mod_time,
            info: Some(info),
            payload: Payload::Deferred(Deferred {
                pending: Mutex::new(Some(Pending { fetch, done })),
                outcome,
            }),
        }
    }

    pub fn prefetched(id: impl Into<String>, mod_time: DateTime<Utc>, bytes: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            mod_time,
            info: None,
            payload: Payload::Ready(bytes),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        self.mod_time
    }

    pub fn info(&self) -> Option<&ItemInfo> {
        self.info.as_ref()
    }

    /// Item bytes. The first call on a data record triggers the download;
    /// every later or concurrent call observes the same outcome.
    ///
    /// Items skipped during the download read as empty and report
    /// [`BackupItem::is_deleted`].
    pub async fn read(&self) -> std::result::Result<Vec<u8>, ReadError> {
        let deferred = match &self.payload {
            Payload::Ready(bytes) => return Ok(bytes.clone()),
            Payload::Deferred(deferred) => deferred,
        };

        let pending = deferred
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(Pending { fetch, done }) = pending {
            // Detached so a reader that gives up doesn't abort the download.
            let item_id = self.id.clone();
            tokio::spawn(async move {
                let outcome = settle(&item_id, fetch().await);
                done.send_replace(Some(outcome));
            });
        }

        let mut rx = deferred.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };

        match outcome {
            Some(Ok(fetched)) => Ok(fetched.bytes),
            Some(Err(source)) => Err(ReadError {
                item_id: self.id.clone(),
                source,
            }),
            // The fetch task panicked before settling.
            None => Err(ReadError {
                item_id: self.id.clone(),
                source: Arc::new(Error::Cancelled),
            }),
        }
    }

    /// True once a read found the item gone or excluded from the backup.
    pub fn is_deleted(&self) -> bool {
        match &self.payload {
            Payload::Ready(_) => false,
            Payload::Deferred(deferred) => {
                matches!(
                    &*deferred.outcome.borrow(),
                    Some(Ok(Fetched { deleted: true, .. }))
                )
            }
        }
    }

    pub fn is_fetched(&self) -> bool {
        match &self.payload {
            Payload::Ready(_) => true,
            Payload::Deferred(deferred) => deferred.outcome.borrow().is_some(),
        }
    }
}

fn settle(item_id: &str, fetched: crate::Result<Vec<u8>>) -> Outcome {
    match fetched {
        Ok(bytes) => Ok(Fetched {
            bytes,
            deleted: false,
        }),
        Err(err) if err.is_skippable() => {
            debug!(
                event = "record.skipped",
                item_id = %item_id,
                error = %err,
                "record.skipped"
            );
            Ok(Fetched {
                bytes: Vec::new(),
                deleted: true,
            })
        }
        Err(err) => Err(Arc::new(err)),
    }
}
