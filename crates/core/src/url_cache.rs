use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{BoxFuture, DeltaEnumerator};
use crate::config::UrlCacheSettings;
use crate::item::ItemDescriptor;
use crate::{Error, Result};

pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemProps {
    pub download_url: String,
    pub is_deleted: bool,
}

/// Source of fresh download urls for items whose embedded url expired.
pub trait ItemPropertyer: Send + Sync {
    fn get_item_properties<'a>(&'a self, item_id: &'a str) -> BoxFuture<'a, Result<ItemProps>>;
}

#[derive(Debug, Default)]
struct CacheState {
    id_to_props: HashMap<String, ItemProps>,
    last_refresh: Option<Instant>,
    /// Completed refresh attempts, successful or not.
    refresh_count: usize,
    last_error: Option<String>,
}

/// Per-drive id → download url map, rebuilt from a delta enumeration
/// whenever it is empty or older than the refresh interval.
pub struct UrlCache {
    drive_id: String,
    prev_delta: String,
    refresh_interval: Duration,
    enumerator: Arc<dyn DeltaEnumerator>,
    refresh_lock: Mutex<()>,
    state: RwLock<CacheState>,
}

impl std::fmt::Debug for UrlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlCache")
            .field("drive_id", &self.drive_id)
            .field("prev_delta", &self.prev_delta)
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

impl UrlCache {
    pub fn new(
        drive_id: impl Into<String>,
        prev_delta: impl Into<String>,
        refresh_interval: Duration,
        enumerator: Option<Arc<dyn DeltaEnumerator>>,
    ) -> Result<Self> {
        let drive_id = drive_id.into();
        if drive_id.is_empty() {
            return Err(Error::InvalidConfig {
                message: "url cache: drive id must not be empty".to_string(),
            });
        }
        if refresh_interval < MIN_REFRESH_INTERVAL {
            return Err(Error::InvalidConfig {
                message: format!(
                    "url cache: refresh interval must be >= {}s",
                    MIN_REFRESH_INTERVAL.as_secs()
                ),
            });
        }
        let Some(enumerator) = enumerator else {
            return Err(Error::InvalidConfig {
                message: "url cache: item enumerator is required".to_string(),
            });
        };

        Ok(Self {
            drive_id,
            prev_delta: prev_delta.into(),
            refresh_interval,
            enumerator,
            refresh_lock: Mutex::new(()),
            state: RwLock::new(CacheState::default()),
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }

    pub fn prev_delta(&self) -> &str {
        &self.prev_delta
    }

    pub fn refresh_count(&self) -> usize {
        self.read_state().refresh_count
    }

    pub fn last_refresh_time(&self) -> Option<Instant> {
        self.read_state().last_refresh
    }

    pub fn len(&self) -> usize {
        self.read_state().id_to_props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn needs_refresh(&self) -> bool {
        let state = self.read_state();
        if state.id_to_props.is_empty() {
            return true;
        }
        match state.last_refresh {
            Some(at) => at.elapsed() > self.refresh_interval,
            None => true,
        }
    }

    pub async fn get_item_properties(&self, item_id: &str) -> Result<ItemProps> {
        if item_id.is_empty() {
            return Err(Error::NotCached {
                item_id: String::new(),
            });
        }

        if self.needs_refresh()
            && let Err(err) = self.refresh().await
        {
            if self.is_empty() {
                return Err(err);
            }
            warn!(
                event = "url_cache.stale_read",
                drive_id = %self.drive_id,
                error = %err,
                "url_cache.stale_read"
            );
        }

        self.read_cache(item_id)
    }

    fn read_cache(&self, item_id: &str) -> Result<ItemProps> {
        self.read_state()
            .id_to_props
            .get(item_id)
            .cloned()
            .ok_or_else(|| Error::NotCached {
                item_id: item_id.to_string(),
            })
    }

    /// Callers that queue up behind an in-flight refresh take its outcome
    /// instead of starting another one.
    async fn refresh(&self) -> Result<()> {
        let seen = self.refresh_count();
        let _guard = self.refresh_lock.lock().await;

        {
            let state = self.read_state();
            if state.refresh_count != seen {
                return match &state.last_error {
                    Some(message) => Err(Error::CacheRefresh {
                        message: message.clone(),
                    }),
                    None => Ok(()),
                };
            }
        }
        if !self.needs_refresh() {
            return Ok(());
        }

        info!(
            event = "url_cache.refresh.start",
            drive_id = %self.drive_id,
            "url_cache.refresh.start"
        );
        let started = Instant::now();
        let outcome = self.delta_query().await;

        let mut state = self.write_state();
        state.refresh_count += 1;
        match outcome {
            Ok(props) => {
                state.id_to_props = props;
                state.last_refresh = Some(Instant::now());
                state.last_error = None;
                info!(
                    event = "url_cache.refresh.finish",
                    drive_id = %self.drive_id,
                    entries = state.id_to_props.len(),
                    refresh_count = state.refresh_count,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "url_cache.refresh.finish"
                );
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                warn!(
                    event = "url_cache.refresh.failed",
                    drive_id = %self.drive_id,
                    refresh_count = state.refresh_count,
                    error = %message,
                    "url_cache.refresh.failed"
                );
                state.last_error = Some(message.clone());
                Err(Error::CacheRefresh { message })
            }
        }
    }

    async fn delta_query(&self) -> Result<HashMap<String, ItemProps>> {
        let mut pager = self
            .enumerator
            .enumerate_items_delta(&self.drive_id, &self.prev_delta);
        let mut props = HashMap::new();

        while let Some(page) = pager.next_page().await {
            if page.reset {
                debug!(
                    event = "url_cache.delta_reset",
                    drive_id = %self.drive_id,
                    discarded = props.len(),
                    "url_cache.delta_reset"
                );
                props.clear();
            }
            apply_page(&mut props, page.items);
        }

        pager.results().await?;
        Ok(props)
    }
}

/// Later entries for an id always replace earlier ones, live or deleted.
fn apply_page(props: &mut HashMap<String, ItemProps>, items: Vec<ItemDescriptor>) {
    for item in items {
        if item.deleted {
            props.insert(
                item.id,
                ItemProps {
                    download_url: String::new(),
                    is_deleted: true,
                },
            );
            continue;
        }
        if item.folder || item.package || !item.is_file() {
            continue;
        }
        match item.download_url {
            Some(url) => {
                props.insert(
                    item.id,
                    ItemProps {
                        download_url: url,
                        is_deleted: false,
                    },
                );
            }
            None => debug!(
                event = "url_cache.missing_url",
                item_id = %item.id,
                "url_cache.missing_url"
            ),
        }
    }
}

impl ItemPropertyer for UrlCache {
    fn get_item_properties<'a>(&'a self, item_id: &'a str) -> BoxFuture<'a, Result<ItemProps>> {
        Box::pin(UrlCache::get_item_properties(self, item_id))
    }
}

/// Attaches a cache only to drives small enough that a refresh finishes
/// well within the lifetime of the urls it hands out.
pub fn url_cache_for_drive(
    drive_id: &str,
    prev_delta: &str,
    num_drive_items: usize,
    settings: &UrlCacheSettings,
    enumerator: Arc<dyn DeltaEnumerator>,
) -> Result<Option<Arc<UrlCache>>> {
    if num_drive_items >= settings.max_drive_items {
        info!(
            event = "url_cache.skipped",
            drive_id,
            num_drive_items,
            "url_cache.skipped"
        );
        return Ok(None);
    }

    info!(
        event = "url_cache.attach",
        drive_id,
        num_drive_items,
        "url_cache.attach"
    );
    let cache = UrlCache::new(
        drive_id,
        prev_delta,
        settings.refresh_interval(),
        Some(enumerator),
    )?;
    Ok(Some(Arc::new(cache)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DeltaPage;
    use crate::memory::InMemoryDrive;

    const HOUR: Duration = Duration::from_secs(3600);

    fn file(id: &str, url: &str) -> ItemDescriptor {
        ItemDescriptor::file(id, format!("file{id}"), 1).with_download_url(url)
    }

    fn tombstone(id: &str) -> ItemDescriptor {
        ItemDescriptor {
            deleted: true,
            ..ItemDescriptor::file(id, format!("file{id}"), 1)
        }
    }

    fn page(items: Vec<ItemDescriptor>) -> DeltaPage {
        DeltaPage {
            items,
            reset: false,
        }
    }

    fn cache_over(drive: &Arc<InMemoryDrive>) -> UrlCache {
        UrlCache::new("drive1", "", HOUR, Some(drive.clone() as Arc<dyn DeltaEnumerator>))
            .unwrap()
    }

    #[test]
    fn construction_is_validated() {
        let drive: Arc<dyn DeltaEnumerator> = Arc::new(InMemoryDrive::new());
        assert!(UrlCache::new("", "", HOUR, Some(drive.clone())).is_err());
        assert!(UrlCache::new("d", "", Duration::from_millis(100), Some(drive.clone())).is_err());
        assert!(UrlCache::new("d", "", HOUR, None).is_err());
        assert!(UrlCache::new("d", "", MIN_REFRESH_INTERVAL, Some(drive)).is_ok());
    }

    #[tokio::test]
    async fn pages_are_merged_with_last_occurrence_winning() {
        let drive = Arc::new(InMemoryDrive::new());
        drive
            .set_delta_pages(
                vec![
                    page(vec![
                        file("1", "https://dummy1.com"),
                        file("2", "https://dummy2.com"),
                        file("3", "https://dummy3.com"),
                    ]),
                    page(vec![
                        file("1", "https://test1.com"),
                        tombstone("2"),
                        file("4", "https://dummy4.com"),
                        file("5", "https://dummy5.com"),
                    ]),
                ],
                "delta",
            );
        let cache = cache_over(&drive);

        let props = cache.get_item_properties("1").await.unwrap();
        assert_eq!(props.download_url, "https://test1.com");
        let props = cache.get_item_properties("2").await.unwrap();
        assert!(props.is_deleted);
        assert!(props.download_url.is_empty());

        assert_eq!(cache.len(), 5);
        assert_eq!(cache.refresh_count(), 1);
        assert!(cache.last_refresh_time().is_some());
        assert_eq!(drive.enumerations(), 1);
    }

    #[tokio::test]
    async fn tombstone_followed_by_live_entry_is_live() {
        let drive = Arc::new(InMemoryDrive::new());
        drive
            .set_delta_pages(
                vec![page(vec![tombstone("1"), file("1", "https://again.com")])],
                "delta",
            );
        let cache = cache_over(&drive);

        let props = cache.get_item_properties("1").await.unwrap();
        assert_eq!(
            props,
            ItemProps {
                download_url: "https://again.com".into(),
                is_deleted: false,
            }
        );
    }

    #[tokio::test]
    async fn reset_discards_entries_from_the_current_cycle() {
        let drive = Arc::new(InMemoryDrive::new());
        drive
            .set_delta_pages(
                vec![
                    page(vec![
                        file("-1", "https://dummy-1.com"),
                        file("1", "https://dummy1.com"),
                        file("2", "https://dummy2.com"),
                        file("3", "https://dummy3.com"),
                    ]),
                    DeltaPage {
                        items: vec![],
                        reset: true,
                    },
                    page(vec![
                        file("0", "https://dummy0.com"),
                        file("1", "https://dummy1.com"),
                        file("2", "https://dummy2.com"),
                        file("3", "https://dummy3.com"),
                    ]),
                    page(vec![
                        file("4", "https://dummy4.com"),
                        file("5", "https://dummy5.com"),
                    ]),
                ],
                "delta",
            );
        let cache = cache_over(&drive);

        assert!(cache.get_item_properties("-1").await.is_err());
        assert_eq!(cache.len(), 6);
        assert_eq!(cache.refresh_count(), 1);
    }

    #[tokio::test]
    async fn reset_page_keeps_its_own_items() {
        let drive = Arc::new(InMemoryDrive::new());
        drive
            .set_delta_pages(
                vec![
                    page(vec![
                        file("A", "https://a.com"),
                        file("B", "https://b.com"),
                        file("C", "https://c.com"),
                    ]),
                    DeltaPage {
                        items: vec![
                            file("A", "https://a.com"),
                            file("B", "https://b.com"),
                            file("C", "https://c.com"),
                            file("D", "https://d.com"),
                        ],
                        reset: true,
                    },
                ],
                "delta",
            );
        let cache = cache_over(&drive);

        for id in ["A", "B", "C", "D"] {
            assert!(cache.get_item_properties(id).await.is_ok(), "missing {id}");
        }
        assert_eq!(cache.len(), 4);
    }

    #[tokio::test]
    async fn folders_are_never_cached() {
        let drive = Arc::new(InMemoryDrive::new());
        drive
            .set_delta_pages(
                vec![page(vec![
                    file("1", "https://dummy1.com"),
                    ItemDescriptor::folder("2", "folder2"),
                ])],
                "delta",
            );
        let cache = cache_over(&drive);

        let err = cache.get_item_properties("2").await.unwrap_err();
        assert!(matches!(err, Error::NotCached { .. }));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.refresh_count(), 1);
    }

    #[tokio::test]
    async fn delta_error_leaves_refresh_time_untouched() {
        let drive = Arc::new(InMemoryDrive::new());
        drive.set_delta_pages(vec![page(vec![])], "delta");
        drive.fail_delta("delta query error");
        let cache = cache_over(&drive);

        let err = cache.get_item_properties("1").await.unwrap_err();
        assert!(matches!(err, Error::CacheRefresh { .. }));
        assert!(cache.last_refresh_time().is_none());
        assert_ne!(cache.refresh_count(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_survive_a_failed_refresh() {
        let drive = Arc::new(InMemoryDrive::new());
        drive
            .set_delta_pages(vec![page(vec![file("1", "https://dummy1.com")])], "delta");
        let cache = cache_over(&drive);
        cache.get_item_properties("1").await.unwrap();
        let refreshed_at = cache.last_refresh_time();

        drive.fail_delta("throttled");
        tokio::time::advance(HOUR + Duration::from_secs(1)).await;

        let props = cache.get_item_properties("1").await.unwrap();
        assert_eq!(props.download_url, "https://dummy1.com");
        assert_eq!(cache.refresh_count(), 2);
        assert_eq!(cache.last_refresh_time(), refreshed_at);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_within_ttl_do_not_enumerate() {
        let drive = Arc::new(InMemoryDrive::new());
        drive
            .set_delta_pages(vec![page(vec![file("1", "https://dummy1.com")])], "delta");
        let cache = Arc::new(cache_over(&drive));

        cache.get_item_properties("1").await.unwrap();
        tokio::time::advance(Duration::from_secs(1800)).await;
        cache.get_item_properties("1").await.unwrap();
        assert!(!cache.needs_refresh());
        assert_eq!(drive.enumerations(), 1);

        tokio::time::advance(Duration::from_secs(1801)).await;
        assert!(cache.needs_refresh());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get_item_properties("1").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(cache.refresh_count(), 2);
        assert_eq!(drive.enumerations(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_reads_share_one_refresh() {
        for concurrent in [1usize, 2, 32] {
            let drive = Arc::new(InMemoryDrive::new());
            drive
                .set_delta_pages(
                    vec![page(vec![
                        file("1", "https://dummy1.com"),
                        file("2", "https://dummy2.com"),
                    ])],
                    "delta",
                );
            drive.set_delta_delay(Duration::from_millis(20));
            let cache = Arc::new(cache_over(&drive));

            let mut handles = Vec::new();
            for i in 0..concurrent {
                let cache = cache.clone();
                let id = if i % 2 == 0 { "1" } else { "2" };
                handles.push(tokio::spawn(async move {
                    cache.get_item_properties(id).await
                }));
            }
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            assert_eq!(cache.refresh_count(), 1, "{concurrent} callers");
            assert_eq!(drive.enumerations(), 1, "{concurrent} callers");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_a_failed_refresh() {
        let drive = Arc::new(InMemoryDrive::new());
        drive.fail_delta("delta query error");
        drive.set_delta_delay(Duration::from_millis(50));
        let cache = Arc::new(cache_over(&drive));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get_item_properties("1").await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }
        assert_eq!(cache.refresh_count(), 1);
        assert_eq!(drive.enumerations(), 1);
        assert!(cache.last_refresh_time().is_none());
    }

    #[test]
    fn large_drives_get_no_cache() {
        let drive: Arc<dyn DeltaEnumerator> = Arc::new(InMemoryDrive::new());
        let settings = UrlCacheSettings {
            refresh_interval_secs: 3600,
            max_drive_items: 10,
        };
        let small = url_cache_for_drive("d1", "tok", 9, &settings, drive.clone()).unwrap();
        assert_eq!(small.unwrap().prev_delta(), "tok");
        assert!(
            url_cache_for_drive("d1", "tok", 10, &settings, drive)
                .unwrap()
                .is_none()
        );
    }
}
