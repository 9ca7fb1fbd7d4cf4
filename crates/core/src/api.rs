use std::future::Future;
use std::pin::Pin;

use crate::Result;
use crate::item::ItemDescriptor;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Item and content access against the remote drive service.
pub trait DriveApi: Send + Sync {
    fn get_item<'a>(
        &'a self,
        drive_id: &'a str,
        item_id: &'a str,
    ) -> BoxFuture<'a, Result<ItemDescriptor>>;

    fn download<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Raw serialized metadata (permissions, sharing) for an item.
    fn get_item_metadata<'a>(
        &'a self,
        drive_id: &'a str,
        item: &'a ItemDescriptor,
    ) -> BoxFuture<'a, Result<Vec<u8>>>;
}

#[derive(Debug, Clone, Default)]
pub struct DeltaPage {
    pub items: Vec<ItemDescriptor>,
    /// The service could not produce an incremental diff; everything
    /// seen so far in this enumeration must be discarded.
    pub reset: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaUpdate {
    pub token: String,
    pub reset: bool,
}

pub trait DeltaPager: Send {
    /// Next page of changes, or `None` once enumeration is done.
    fn next_page(&mut self) -> BoxFuture<'_, Option<DeltaPage>>;

    /// Final delta token, or the error that ended enumeration early.
    fn results(&mut self) -> BoxFuture<'_, Result<DeltaUpdate>>;
}

pub trait DeltaEnumerator: Send + Sync {
    fn enumerate_items_delta(&self, drive_id: &str, prev_delta: &str) -> Box<dyn DeltaPager>;
}
