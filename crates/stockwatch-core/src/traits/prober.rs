use async_trait::async_trait;

use crate::error::ProbeError;

/// Reports whether a product page shows the item as purchasable
/// for the given delivery location.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str, location_code: &str) -> Result<bool, ProbeError>;
}
