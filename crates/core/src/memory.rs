use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::api::{BoxFuture, DeltaEnumerator, DeltaPage, DeltaPager, DeltaUpdate, DriveApi};
use crate::error::ApiErrorKind;
use crate::item::ItemDescriptor;
use crate::{Error, Result};

/// Failure injected into an [`InMemoryDrive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Api(ApiErrorKind),
    DeletedInFlight,
}

impl InjectedFailure {
    fn to_error(self, what: &str) -> Error {
        match self {
            Self::Api(kind) => Error::api(kind, format!("injected failure: {what}")),
            Self::DeletedInFlight => Error::DeletedInFlight,
        }
    }
}

impl From<ApiErrorKind> for InjectedFailure {
    fn from(kind: ApiErrorKind) -> Self {
        Self::Api(kind)
    }
}

#[derive(Debug, Default)]
struct DriveState {
    items: HashMap<String, ItemDescriptor>,
    content: HashMap<String, Vec<u8>>,
    metadata: HashMap<String, Vec<u8>>,
    download_failures: HashMap<String, InjectedFailure>,
    metadata_failures: HashMap<String, InjectedFailure>,
    item_failures: HashMap<String, InjectedFailure>,
    delta_pages: Vec<DeltaPage>,
    delta_token: String,
    delta_error: Option<String>,
    delta_delay: Duration,
    metadata_delay: Duration,
}

/// Drive service double holding items, url-addressed content and a
/// scripted delta enumeration, with call counters for assertions.
#[derive(Debug, Default)]
pub struct InMemoryDrive {
    downloads: AtomicUsize,
    item_fetches: AtomicUsize,
    metadata_fetches: AtomicUsize,
    enumerations: AtomicUsize,
    concurrent_metadata: AtomicUsize,
    max_concurrent_metadata: AtomicUsize,
    inner: Mutex<DriveState>,
}

impl InMemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DriveState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live descriptor returned by `get_item`.
    pub fn put_item(&self, item: ItemDescriptor) {
        self.lock().items.insert(item.id.clone(), item);
    }

    pub fn put_content(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.lock().content.insert(url.into(), bytes.into());
    }

    pub fn put_metadata(&self, item_id: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.lock().metadata.insert(item_id.into(), bytes.into());
    }

    pub fn fail_download(&self, url: impl Into<String>, failure: impl Into<InjectedFailure>) {
        self.lock()
            .download_failures
            .insert(url.into(), failure.into());
    }

    pub fn fail_metadata(&self, item_id: impl Into<String>, failure: impl Into<InjectedFailure>) {
        self.lock()
            .metadata_failures
            .insert(item_id.into(), failure.into());
    }

    pub fn fail_get_item(&self, item_id: impl Into<String>, failure: impl Into<InjectedFailure>) {
        self.lock()
            .item_failures
            .insert(item_id.into(), failure.into());
    }

    pub fn set_delta_pages(&self, pages: Vec<DeltaPage>, token: impl Into<String>) {
        let mut state = self.lock();
        state.delta_pages = pages;
        state.delta_token = token.into();
    }

    /// Every later enumeration ends with this error after its pages.
    pub fn fail_delta(&self, message: impl Into<String>) {
        self.lock().delta_error = Some(message.into());
    }

    pub fn clear_delta_failure(&self) {
        self.lock().delta_error = None;
    }

    pub fn set_delta_delay(&self, delay: Duration) {
        self.lock().delta_delay = delay;
    }

    pub fn set_metadata_delay(&self, delay: Duration) {
        self.lock().metadata_delay = delay;
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn item_fetches(&self) -> usize {
        self.item_fetches.load(Ordering::Relaxed)
    }

    pub fn metadata_fetches(&self) -> usize {
        self.metadata_fetches.load(Ordering::Relaxed)
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::Relaxed)
    }

    pub fn max_concurrent_metadata(&self) -> usize {
        self.max_concurrent_metadata.load(Ordering::Relaxed)
    }

    fn track_metadata_start(&self) {
        let current = self.concurrent_metadata.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_concurrent_metadata
            .fetch_max(current, Ordering::Relaxed);
    }
}

impl DriveApi for InMemoryDrive {
    fn get_item<'a>(
        &'a self,
        _drive_id: &'a str,
        item_id: &'a str,
    ) -> BoxFuture<'a, Result<ItemDescriptor>> {
        Box::pin(async move {
            self.item_fetches.fetch_add(1, Ordering::Relaxed);
            let state = self.lock();
            if let Some(failure) = state.item_failures.get(item_id) {
                return Err(failure.to_error(item_id));
            }
            state.items.get(item_id).cloned().ok_or_else(|| {
                Error::api(ApiErrorKind::NotFound, format!("item not found: {item_id}"))
            })
        })
    }

    fn download<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.downloads.fetch_add(1, Ordering::Relaxed);
            let state = self.lock();
            if let Some(failure) = state.download_failures.get(url) {
                return Err(failure.to_error(url));
            }
            state.content.get(url).cloned().ok_or_else(|| {
                Error::api(ApiErrorKind::NotFound, format!("no content at {url}"))
            })
        })
    }

    fn get_item_metadata<'a>(
        &'a self,
        _drive_id: &'a str,
        item: &'a ItemDescriptor,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.metadata_fetches.fetch_add(1, Ordering::Relaxed);
            self.track_metadata_start();
            let delay = self.lock().metadata_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let out = {
                let state = self.lock();
                match state.metadata_failures.get(&item.id) {
                    Some(failure) => Err(failure.to_error(&item.id)),
                    None => Ok(state
                        .metadata
                        .get(&item.id)
                        .cloned()
                        .unwrap_or_else(|| format!("{{\"id\":\"{}\"}}", item.id).into_bytes())),
                }
            };
            self.concurrent_metadata.fetch_sub(1, Ordering::Relaxed);
            out
        })
    }
}

impl DeltaEnumerator for InMemoryDrive {
    fn enumerate_items_delta(&self, _drive_id: &str, _prev_delta: &str) -> Box<dyn DeltaPager> {
        self.enumerations.fetch_add(1, Ordering::Relaxed);
        let state = self.lock();
        Box::new(MemoryDeltaPager {
            pages: state.delta_pages.iter().cloned().collect(),
            token: state.delta_token.clone(),
            error: state.delta_error.clone(),
            delay: state.delta_delay,
            reset_seen: false,
        })
    }
}

struct MemoryDeltaPager {
    pages: VecDeque<DeltaPage>,
    token: String,
    error: Option<String>,
    delay: Duration,
    reset_seen: bool,
}

impl DeltaPager for MemoryDeltaPager {
    fn next_page(&mut self) -> BoxFuture<'_, Option<DeltaPage>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let page = self.pages.pop_front()?;
            self.reset_seen |= page.reset;
            Some(page)
        })
    }

    fn results(&mut self) -> BoxFuture<'_, Result<DeltaUpdate>> {
        Box::pin(async move {
            match &self.error {
                Some(message) => Err(Error::api(ApiErrorKind::Generic, message.clone())),
                None => Ok(DeltaUpdate {
                    token: self.token.clone(),
                    reset: self.reset_seen,
                }),
            }
        })
    }
}
