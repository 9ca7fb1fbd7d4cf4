use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::download::download_content;
use crate::error::SkipReason;
use crate::fault::{FaultBus, FaultLabel, SkippedItem};
use crate::handler::BackupHandler;
use crate::item::{DATA_FILE_SUFFIX, DIR_META_FILE_SUFFIX, ItemDescriptor, META_FILE_SUFFIX};
use crate::limiter::ConcurrencyLimiter;
use crate::path::{CollectionState, FolderPath, LocationPath, location_of, state_of};
use crate::progress::{CollectionProgress, ProgressSink};
use crate::record::{BackupItem, ContentFetch};
use crate::status::{CollectionMetrics, CollectionStatus, StatusSink};
use crate::url_cache::ItemPropertyer;
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct CollectionConfig {
    pub drive_id: String,
    pub drive_name: String,
    pub full_path: Option<FolderPath>,
    pub prev_path: Option<FolderPath>,
    /// The folder is a package (e.g. a OneNote notebook) or lives inside one.
    pub is_package_or_child_for_package: bool,
    pub do_not_merge_items: bool,
}

#[derive(Default)]
pub struct StreamOptions {
    pub cancel: Option<CancellationToken>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

/// The items discovered in one drive folder for one backup run.
pub struct Collection {
    handler: BackupHandler,
    limiter: ConcurrencyLimiter,
    status: Arc<dyn StatusSink>,
    url_cache: Option<Arc<dyn ItemPropertyer>>,
    drive_id: String,
    drive_name: String,
    full_path: Option<FolderPath>,
    prev_path: Option<FolderPath>,
    location: Option<LocationPath>,
    prev_location: Option<LocationPath>,
    state: CollectionState,
    is_package_or_child_for_package: bool,
    do_not_merge_items: bool,
    items: HashMap<String, ItemDescriptor>,
    started: AtomicBool,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("drive_id", &self.drive_id)
            .field("full_path", &self.full_path)
            .field("prev_path", &self.prev_path)
            .field("state", &self.state)
            .field("items", &self.items.len())
            .finish_non_exhaustive()
    }
}

impl Collection {
    pub fn new(
        handler: BackupHandler,
        config: CollectionConfig,
        limiter: ConcurrencyLimiter,
        status: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        let location = location_of(config.full_path.as_ref())
            .map_err(|e| e.context("getting location"))?;
        let prev_location = location_of(config.prev_path.as_ref())
            .map_err(|e| e.context("getting previous location"))?;

        Ok(Self {
            handler,
            limiter,
            status,
            url_cache: None,
            drive_id: config.drive_id,
            drive_name: config.drive_name,
            state: state_of(config.prev_path.as_ref(), config.full_path.as_ref()),
            full_path: config.full_path,
            prev_path: config.prev_path,
            location,
            prev_location,
            is_package_or_child_for_package: config.is_package_or_child_for_package,
            do_not_merge_items: config.do_not_merge_items,
            items: HashMap::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn with_url_cache(mut self, cache: Arc<dyn ItemPropertyer>) -> Self {
        self.url_cache = Some(cache);
        self
    }

    /// Returns true when the id was not already held.
    pub fn add(&mut self, item: ItemDescriptor) -> bool {
        self.items.insert(item.id.clone(), item).is_none()
    }

    pub fn remove(&mut self, item_id: &str) -> bool {
        self.items.remove(item_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, item_id: &str) -> Option<&ItemDescriptor> {
        self.items.get(item_id)
    }

    pub fn set_full_path(&mut self, path: Option<FolderPath>) {
        self.location = location_of(path.as_ref()).ok().flatten();
        self.full_path = path;
        self.state = state_of(self.prev_path.as_ref(), self.full_path.as_ref());
    }

    pub fn full_path(&self) -> Option<&FolderPath> {
        self.full_path.as_ref()
    }

    pub fn previous_path(&self) -> Option<&FolderPath> {
        self.prev_path.as_ref()
    }

    pub fn location_path(&self) -> Option<&LocationPath> {
        self.location.as_ref()
    }

    pub fn previous_location_path(&self) -> Option<&LocationPath> {
        self.prev_location.as_ref()
    }

    pub fn state(&self) -> CollectionState {
        self.state
    }

    pub fn do_not_merge_items(&self) -> bool {
        self.do_not_merge_items
    }

    pub fn is_package_or_child_for_package(&self) -> bool {
        self.is_package_or_child_for_package
    }

    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }

    pub fn drive_name(&self) -> &str {
        &self.drive_name
    }

    /// Starts streaming the collection's records. The channel closes once
    /// every dispatched item has been handled, right after the status
    /// record is handed to the status sink.
    ///
    /// Per-item failures are reported to `errs`, never through the stream.
    pub fn items(
        &self,
        errs: Arc<FaultBus>,
        options: StreamOptions,
    ) -> Result<mpsc::Receiver<BackupItem>> {
        if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::StreamAlreadyStarted);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| Error::InvalidConfig {
            message: format!("item stream needs a tokio runtime: {e}"),
        })?;

        let service = self.handler.service();
        let parallelism = self.limiter.parallelism(service);
        let (tx, rx) = mpsc::channel(parallelism.collection_buffer);

        let job = Arc::new(StreamJob {
            handler: self.handler.clone(),
            url_cache: self.url_cache.clone(),
            drive_id: self.drive_id.clone(),
            drive_name: self.drive_name.clone(),
            full_path: self.full_path.clone(),
            is_package: self.is_package_or_child_for_package,
            semaphore: self.limiter.item_semaphore(service),
            status: self.status.clone(),
            progress: options.progress,
            errs,
        });
        let items = self.items.values().cloned().collect();
        runtime.spawn(job.run(items, tx, options.cancel));
        Ok(rx)
    }
}

#[derive(Debug, Default)]
struct StreamStats {
    items_found: AtomicU64,
    dirs_found: AtomicU64,
    items_read: AtomicU64,
    dirs_read: AtomicU64,
    byte_count: AtomicU64,
    done: AtomicU64,
}

struct StreamJob {
    handler: BackupHandler,
    url_cache: Option<Arc<dyn ItemPropertyer>>,
    drive_id: String,
    drive_name: String,
    full_path: Option<FolderPath>,
    is_package: bool,
    semaphore: Arc<Semaphore>,
    status: Arc<dyn StatusSink>,
    progress: Option<Arc<dyn ProgressSink>>,
    errs: Arc<FaultBus>,
}

impl StreamJob {
    async fn run(
        self: Arc<Self>,
        items: Vec<ItemDescriptor>,
        tx: mpsc::Sender<BackupItem>,
        cancel: Option<CancellationToken>,
    ) {
        let stats = Arc::new(StreamStats::default());

        let location = match self.parent_location() {
            Ok(location) => location,
            Err(err) => {
                info!(
                    event = "collection.path_unresolved",
                    drive_id = %self.drive_id,
                    error = %err,
                    "collection.path_unresolved"
                );
                self.report(&stats);
                drop(tx);
                return;
            }
        };

        let display_path = self.handler.format_display_path(&location);
        let items_total = items.len() as u64;
        debug!(
            event = "collection.stream.start",
            drive_id = %self.drive_id,
            items = items_total,
            is_package = self.is_package,
            "collection.stream.start"
        );

        let mut workers = JoinSet::new();
        for item in items {
            if self.should_halt(cancel.as_ref()) {
                break;
            }

            let permit = match &cancel {
                Some(cancel) => tokio::select! {
                    permit = self.semaphore.clone().acquire_owned() => permit,
                    _ = cancel.cancelled() => break,
                },
                None => self.semaphore.clone().acquire_owned().await,
            };
            let Ok(permit) = permit else {
                break;
            };
            if self.should_halt(cancel.as_ref()) {
                break;
            }

            let job = self.clone();
            let tx = tx.clone();
            let stats = stats.clone();
            let location = location.clone();
            let display_path = display_path.clone();
            workers.spawn(async move {
                job.stream_item(item, permit, &location, &tx, &stats).await;

                let items_done = stats.done.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(progress) = &job.progress {
                    progress.on_progress(CollectionProgress {
                        folder: display_path,
                        items_total,
                        items_done,
                    });
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(
                    event = "collection.worker.failed",
                    drive_id = %self.drive_id,
                    error = %err,
                    "collection.worker.failed"
                );
            }
        }

        // Consumers that saw the stream close can rely on the status.
        self.report(&stats);
        drop(tx);
    }

    fn should_halt(&self, cancel: Option<&CancellationToken>) -> bool {
        if self.errs.failure() {
            debug!(
                event = "collection.stream.halt",
                drive_id = %self.drive_id,
                reason = "failure",
                "collection.stream.halt"
            );
            return true;
        }
        if cancel.is_some_and(|c| c.is_cancelled()) {
            debug!(
                event = "collection.stream.halt",
                drive_id = %self.drive_id,
                reason = "cancelled",
                "collection.stream.halt"
            );
            return true;
        }
        false
    }

    fn parent_location(&self) -> Result<LocationPath> {
        let path = self.full_path.as_ref().ok_or_else(|| Error::InvalidPath {
            path: String::new(),
            message: "collection has no current path".to_string(),
        })?;
        Ok(path.to_drive_path()?.location())
    }

    async fn stream_item(
        self: &Arc<Self>,
        mut item: ItemDescriptor,
        permit: OwnedSemaphorePermit,
        location: &LocationPath,
        tx: &mpsc::Sender<BackupItem>,
        stats: &StreamStats,
    ) {
        item.parent.get_or_insert_with(Default::default).drive_name =
            Some(self.drive_name.clone());

        let is_file = item.is_file();
        if is_file {
            stats.items_found.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.dirs_found.fetch_add(1, Ordering::Relaxed);
        }

        let meta = match self.handler.get_item_metadata(&self.drive_id, &item).await {
            Ok(meta) => meta,
            Err(err) => {
                if err.is_not_found() || err.is_deleted_in_flight() {
                    info!(
                        event = "collection.item.gone",
                        item_id = %item.id,
                        error = %err,
                        "collection.item.gone"
                    );
                } else {
                    self.errs.add_item_recoverable(
                        &item.id,
                        &err.context("getting item metadata"),
                        FaultLabel::ForceNoBackupCreation,
                    );
                }
                return;
            }
        };
        // The pool is shared across collections; waiting on this
        // collection's consumer must not hold a slot.
        drop(permit);

        let info = self.handler.item_info(&item, &self.drive_name, Some(location));
        let size = u64::try_from(item.size).unwrap_or(0);

        if is_file {
            let record = BackupItem::lazy(
                format!("{}{DATA_FILE_SUFFIX}", item.id),
                info.modified.unwrap_or_else(Utc::now),
                info,
                self.content_fetch(item.clone()),
            );
            if tx.send(record).await.is_err() {
                debug!(
                    event = "collection.receiver_dropped",
                    item_id = %item.id,
                    "collection.receiver_dropped"
                );
                return;
            }
        }

        let meta_id = if is_file {
            format!("{}{META_FILE_SUFFIX}", item.id)
        } else {
            DIR_META_FILE_SUFFIX.to_string()
        };
        // Permission changes don't bump the item's mod time.
        if tx
            .send(BackupItem::prefetched(meta_id, Utc::now(), meta))
            .await
            .is_err()
        {
            return;
        }

        if is_file {
            stats.items_read.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.dirs_read.fetch_add(1, Ordering::Relaxed);
        }
        stats.byte_count.fetch_add(size, Ordering::Relaxed);
    }

    fn content_fetch(self: &Arc<Self>, item: ItemDescriptor) -> ContentFetch {
        let job = Arc::clone(self);
        Box::new(move || Box::pin(async move { job.fetch_content(&item).await }))
    }

    async fn fetch_content(&self, item: &ItemDescriptor) -> Result<Vec<u8>> {
        let err = match download_content(
            self.handler.api(),
            self.url_cache.as_deref(),
            &self.drive_id,
            item,
        )
        .await
        {
            Ok(bytes) => return Ok(bytes),
            Err(err) => err,
        };

        if err.is_malware() || item.malware {
            self.skip(item, SkipReason::Malware);
            return Err(err
                .skipped(SkipReason::Malware)
                .context("downloading item content"));
        }

        if err.is_not_found() || err.is_deleted_in_flight() {
            info!(
                event = "collection.item.gone",
                item_id = %item.id,
                error = %err,
                "collection.item.gone"
            );
            return Err(err.skipped(SkipReason::DeletedInFlight).context("deleted"));
        }

        // Large OneNote notebooks can't be downloaded.
        if err.is_service_unavailable() && (self.is_package || item.is_one_note()) {
            self.skip(item, SkipReason::InaccessiblePackage);
            return Err(err
                .skipped(SkipReason::InaccessiblePackage)
                .context("downloading package content"));
        }

        let err = err.context("downloading item content");
        self.errs
            .add_item_recoverable(&item.id, &err, FaultLabel::ForceNoBackupCreation);
        Err(err.context("fetching item content"))
    }

    fn skip(&self, item: &ItemDescriptor, reason: SkipReason) {
        self.errs.add_skip(SkippedItem {
            reason,
            drive_id: self.drive_id.clone(),
            item_id: item.id.clone(),
            item_name: item.name.clone(),
        });
    }

    fn report(&self, stats: &StreamStats) {
        let metrics = CollectionMetrics {
            objects: stats.items_found.load(Ordering::Relaxed),
            successes: stats.items_read.load(Ordering::Relaxed),
            bytes: stats.byte_count.load(Ordering::Relaxed),
        };
        let folder = self
            .full_path
            .as_ref()
            .map(|p| p.folder().to_string())
            .unwrap_or_default();

        debug!(
            event = "collection.stream.finish",
            drive_id = %self.drive_id,
            objects = metrics.objects,
            successes = metrics.successes,
            bytes = metrics.bytes,
            dirs_found = stats.dirs_found.load(Ordering::Relaxed),
            dirs_read = stats.dirs_read.load(Ordering::Relaxed),
            "collection.stream.finish"
        );
        self.status
            .on_status(CollectionStatus::completed(folder, metrics));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::handler::{ProtectedResource, UserDriveVariant};
    use crate::memory::InMemoryDrive;

    #[derive(Default)]
    struct Statuses(Mutex<Vec<CollectionStatus>>);

    impl StatusSink for Statuses {
        fn on_status(&self, status: CollectionStatus) {
            self.0.lock().unwrap().push(status);
        }
    }

    fn handler() -> BackupHandler {
        BackupHandler::new(
            Arc::new(InMemoryDrive::new()),
            UserDriveVariant {
                user: ProtectedResource {
                    id: "u1".into(),
                    name: "user".into(),
                },
            },
        )
    }

    fn collection(full: Option<&str>, prev: Option<&str>) -> Result<Collection> {
        Collection::new(
            handler(),
            CollectionConfig {
                drive_id: "d1".into(),
                drive_name: "OneDrive".into(),
                full_path: full.map(FolderPath::parse),
                prev_path: prev.map(FolderPath::parse),
                ..CollectionConfig::default()
            },
            ConcurrencyLimiter::default(),
            Arc::new(Statuses::default()),
        )
    }

    #[test]
    fn add_and_remove_follow_last_write() {
        let mut c = collection(Some("drives/d1/root:/a"), None).unwrap();
        assert!(c.is_empty());
        assert!(c.add(ItemDescriptor::file("1", "a", 1)));
        assert!(!c.add(ItemDescriptor::file("1", "b", 2)));
        assert!(c.add(ItemDescriptor::folder("2", "dir")));
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("1").unwrap().name, "b");

        assert!(c.remove("2"));
        assert!(!c.remove("2"));
        assert!(c.remove("1"));
        assert!(c.is_empty());
    }

    #[test]
    fn state_is_derived_from_paths() {
        let c = collection(Some("drives/d1/root:/a"), None).unwrap();
        assert_eq!(c.state(), CollectionState::New);
        assert_eq!(c.location_path().unwrap().to_string(), "root:/a");
        assert!(c.previous_location_path().is_none());

        let mut c = collection(Some("drives/d1/root:/a"), Some("drives/d1/root:/a")).unwrap();
        assert_eq!(c.state(), CollectionState::NotMoved);

        c.set_full_path(Some(FolderPath::parse("drives/d1/root:/b")));
        assert_eq!(c.state(), CollectionState::Moved);
        assert_eq!(c.location_path().unwrap().to_string(), "root:/b");

        c.set_full_path(None);
        assert_eq!(c.state(), CollectionState::Deleted);
        assert!(c.location_path().is_none());
    }

    #[test]
    fn malformed_paths_fail_construction() {
        let err = collection(Some("sites/s1/root:/a"), None).unwrap_err();
        assert!(err.to_string().starts_with("getting location"));
        let err = collection(Some("drives/d1/root:/a"), Some("drives")).unwrap_err();
        assert!(err.to_string().starts_with("getting previous location"));
    }

    #[tokio::test]
    async fn streaming_starts_once() {
        let c = collection(Some("drives/d1/root:/a"), None).unwrap();
        let errs = Arc::new(FaultBus::default());
        let mut rx = c.items(errs.clone(), StreamOptions::default()).unwrap();
        assert!(matches!(
            c.items(errs, StreamOptions::default()),
            Err(Error::StreamAlreadyStarted)
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_before_start_is_an_error() {
        let c = collection(Some("drives/d1/root:/a"), None).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = c
            .items(
                Arc::new(FaultBus::default()),
                StreamOptions {
                    cancel: Some(cancel),
                    progress: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
