//! Product watch persistence interface.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Availability, Fingerprint, ProductWatch, RecipientId, WatchKey};

/// Key/document store of [`ProductWatch`] records keyed by [`WatchKey`].
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// All watches, in no particular order.
    async fn list_all(&self) -> Result<Vec<ProductWatch>>;

    async fn get(&self, key: &WatchKey) -> Result<Option<ProductWatch>>;

    /// Create the watch if missing and add the subscriber.
    /// Returns `false` if the recipient was already subscribed.
    async fn upsert_subscriber(
        &self,
        url: &str,
        location_code: &str,
        recipient: RecipientId,
    ) -> Result<bool>;

    /// Returns `false` if the recipient was not subscribed.
    async fn remove_subscriber(&self, key: &WatchKey, recipient: RecipientId) -> Result<bool>;

    async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<ProductWatch>>;

    async fn find_by_subscriber(&self, recipient: RecipientId) -> Result<Vec<ProductWatch>>;

    async fn record_availability(&self, key: &WatchKey, availability: Availability) -> Result<()>;

    /// Delete the watch when nobody is subscribed. Returns `true` if deleted.
    async fn delete_if_no_subscribers(&self, key: &WatchKey) -> Result<bool>;
}
