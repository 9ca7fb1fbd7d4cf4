use tracing::{debug, info};

use crate::api::DriveApi;
use crate::item::ItemDescriptor;
use crate::url_cache::ItemPropertyer;
use crate::{Error, Result};

/// Downloads an item's bytes from the url embedded in its descriptor.
pub async fn download_item(api: &dyn DriveApi, item: &ItemDescriptor) -> Result<Vec<u8>> {
    let url = item
        .download_url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::MissingDownloadUrl {
            item_id: item.id.clone(),
        })?;
    api.download(url).await
}

/// Downloads an item through a url taken from the cache.
///
/// A tombstoned entry yields [`Error::DeletedInFlight`] rather than a miss.
pub async fn read_item_contents(
    api: &dyn DriveApi,
    cache: Option<&dyn ItemPropertyer>,
    item_id: &str,
) -> Result<Vec<u8>> {
    let Some(cache) = cache else {
        return Err(Error::NotCached {
            item_id: item_id.to_string(),
        });
    };

    let props = cache.get_item_properties(item_id).await?;
    if props.is_deleted {
        return Err(Error::DeletedInFlight);
    }

    let out = api.download(&props.download_url).await;
    if let Err(err) = &out
        && err.is_unauthorized_or_bad_token()
    {
        debug!(
            event = "download.stale_cache_entry",
            item_id,
            error = %err,
            "download.stale_cache_entry"
        );
    }
    out
}

/// Fetches item content, recovering from an expired embedded url first
/// through the url cache and then through a live refetch of the item.
pub async fn download_content(
    api: &dyn DriveApi,
    cache: Option<&dyn ItemPropertyer>,
    drive_id: &str,
    item: &ItemDescriptor,
) -> Result<Vec<u8>> {
    let err = match download_item(api, item).await {
        Ok(bytes) => return Ok(bytes),
        Err(err) => err,
    };
    if !err.is_unauthorized_or_bad_token() {
        return Err(err);
    }
    debug!(
        event = "download.url_expired",
        item_id = %item.id,
        error = %err,
        "download.url_expired"
    );

    match read_item_contents(api, cache, &item.id).await {
        Ok(bytes) => {
            debug!(
                event = "download.url_cache_hit",
                item_id = %item.id,
                "download.url_cache_hit"
            );
            return Ok(bytes);
        }
        // Tombstones and stale entries fall through to a live refetch too.
        Err(err) => info!(
            event = "download.url_cache_miss",
            item_id = %item.id,
            error = %err,
            "download.url_cache_miss"
        ),
    }

    let fresh = api
        .get_item(drive_id, &item.id)
        .await
        .map_err(|e| e.context("retrieving expired item"))?;

    download_item(api, &fresh)
        .await
        .map_err(|e| e.context("content download retry"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::api::{DeltaEnumerator, DeltaPage};
    use crate::error::ApiErrorKind;
    use crate::memory::{InMemoryDrive, InjectedFailure};
    use crate::url_cache::UrlCache;

    const OLD_URL: &str = "https://content/old";
    const CACHED_URL: &str = "https://content/cached";
    const LIVE_URL: &str = "https://content/live";

    fn item() -> ItemDescriptor {
        ItemDescriptor::file("item1", "report.docx", 5).with_download_url(OLD_URL)
    }

    fn drive_with_cache(entry: ItemDescriptor) -> (Arc<InMemoryDrive>, UrlCache) {
        let drive = Arc::new(InMemoryDrive::new());
        drive.set_delta_pages(
            vec![DeltaPage {
                items: vec![entry],
                reset: false,
            }],
            "delta",
        );
        let cache = UrlCache::new(
            "drive1",
            "",
            Duration::from_secs(3600),
            Some(drive.clone() as Arc<dyn DeltaEnumerator>),
        )
        .unwrap();
        (drive, cache)
    }

    #[tokio::test]
    async fn direct_download_wins_first() {
        let drive = InMemoryDrive::new();
        drive.put_content(OLD_URL, b"hello".to_vec());

        let bytes = download_content(&drive, None, "drive1", &item()).await.unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(drive.item_fetches(), 0);
    }

    #[tokio::test]
    async fn non_auth_failure_is_returned_immediately() {
        let (drive, cache) = drive_with_cache(item().with_download_url(CACHED_URL));
        drive.fail_download(OLD_URL, ApiErrorKind::RateLimited);

        let err = download_content(drive.as_ref(), Some(&cache), "drive1", &item())
            .await
            .unwrap_err();
        assert_eq!(err.api_kind(), Some(ApiErrorKind::RateLimited));
        assert_eq!(drive.enumerations(), 0);
        assert_eq!(drive.item_fetches(), 0);
    }

    #[tokio::test]
    async fn missing_url_is_an_error() {
        let drive = InMemoryDrive::new();
        let bare = ItemDescriptor::file("item1", "a.txt", 1);
        let err = download_content(&drive, None, "drive1", &bare)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingDownloadUrl { .. }));
        assert_eq!(drive.downloads(), 0);
    }

    #[tokio::test]
    async fn cache_hit_skips_live_refetch() {
        let (drive, cache) = drive_with_cache(item().with_download_url(CACHED_URL));
        drive.fail_download(OLD_URL, ApiErrorKind::Unauthorized);
        drive.put_content(CACHED_URL, b"cached".to_vec());

        let bytes = download_content(drive.as_ref(), Some(&cache), "drive1", &item())
            .await
            .unwrap();
        assert_eq!(bytes, b"cached");
        assert_eq!(drive.item_fetches(), 0);
        assert_eq!(drive.downloads(), 2);
    }

    #[tokio::test]
    async fn cache_miss_refetches_item() {
        let (drive, cache) =
            drive_with_cache(ItemDescriptor::file("other", "b", 1).with_download_url(CACHED_URL));
        drive.fail_download(OLD_URL, ApiErrorKind::Unauthorized);
        drive.put_item(item().with_download_url(LIVE_URL));
        drive.put_content(LIVE_URL, b"live".to_vec());

        let bytes = download_content(drive.as_ref(), Some(&cache), "drive1", &item())
            .await
            .unwrap();
        assert_eq!(bytes, b"live");
        assert_eq!(drive.item_fetches(), 1);
    }

    #[tokio::test]
    async fn stale_cache_url_refetches_item() {
        let (drive, cache) = drive_with_cache(item().with_download_url(CACHED_URL));
        drive.fail_download(OLD_URL, ApiErrorKind::Unauthorized);
        drive.fail_download(CACHED_URL, ApiErrorKind::Unauthorized);
        drive.put_item(item().with_download_url(LIVE_URL));
        drive.put_content(LIVE_URL, b"live".to_vec());

        let bytes = download_content(drive.as_ref(), Some(&cache), "drive1", &item())
            .await
            .unwrap();
        assert_eq!(bytes, b"live");
        assert_eq!(drive.item_fetches(), 1);
    }

    #[tokio::test]
    async fn tombstone_reads_as_deleted() {
        let (drive, cache) = drive_with_cache(ItemDescriptor {
            deleted: true,
            ..item()
        });

        let err = read_item_contents(drive.as_ref(), Some(&cache), "item1")
            .await
            .unwrap_err();
        assert!(err.is_deleted_in_flight());

        drive.fail_download(OLD_URL, ApiErrorKind::Unauthorized);
        let err = download_content(drive.as_ref(), Some(&cache), "drive1", &item())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("retrieving expired item"));
        assert_eq!(drive.item_fetches(), 1);
    }

    #[tokio::test]
    async fn final_failure_is_wrapped() {
        let drive = InMemoryDrive::new();
        drive.fail_download(OLD_URL, ApiErrorKind::Unauthorized);
        drive.put_item(item().with_download_url(LIVE_URL));
        drive.fail_download(LIVE_URL, InjectedFailure::Api(ApiErrorKind::Malware));

        let err = download_content(&drive, None, "drive1", &item())
            .await
            .unwrap_err();
        assert!(err.is_malware());
        assert!(err.to_string().starts_with("content download retry"));
    }
}
