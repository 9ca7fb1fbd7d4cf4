pub mod api;
mod collection;
pub mod config;
mod download;
mod error;
pub mod fault;
pub mod handler;
pub mod http;
mod item;
mod limiter;
mod memory;
pub mod path;
pub mod progress;
mod record;
pub mod run_log;
pub mod status;
mod url_cache;

pub const APP_NAME: &str = "DriveBackup";

pub use api::{BoxFuture, DeltaEnumerator, DeltaPage, DeltaPager, DeltaUpdate, DriveApi};
pub use collection::{Collection, CollectionConfig, StreamOptions};
pub use config::{BackupSettings, UrlCacheSettings};
pub use download::{download_content, download_item, read_item_contents};
pub use error::{ApiErrorKind, Error, Result, SkipReason};
pub use fault::{FaultBus, FaultLabel, RecoveredFault, SkippedItem};
pub use handler::{
    BackupHandler, GroupVariant, HandlerVariant, ItemInfo, LibraryVariant, ProtectedResource,
    UserDriveVariant,
};
pub use http::{HttpContentClient, HttpContentConfig};
pub use item::{
    DATA_FILE_SUFFIX, DIR_META_FILE_SUFFIX, FileFacet, ItemDescriptor, META_FILE_SUFFIX,
    ONE_NOTE_MIME_TYPE, ParentReference,
};
pub use limiter::{ConcurrencyLimiter, Parallelism, ServiceClass};
pub use memory::{InMemoryDrive, InjectedFailure};
pub use path::{CollectionState, DrivePath, FolderPath, LocationPath};
pub use record::{BackupItem, ContentFetch, ReadError};
pub use status::{CollectionMetrics, CollectionStatus, StatusSink};
pub use url_cache::{ItemPropertyer, ItemProps, MIN_REFRESH_INTERVAL, UrlCache, url_cache_for_drive};
