//! In-memory and JSON-file product stores.
//! The JSON file is human-readable and rewritten only when a watch changes,
//! never on a plain read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stockwatch_core::error::{Result, StockWatchError};
use stockwatch_core::traits::ProductStore;
use stockwatch_core::types::{Availability, Fingerprint, ProductWatch, RecipientId, WatchKey};
use tokio::sync::Mutex;

/// Watch map plus the mutations shared by the file-less and file-backed stores.
#[derive(Default, Clone)]
struct Watches(BTreeMap<WatchKey, ProductWatch>);

impl Watches {
    fn list(&self) -> Vec<ProductWatch> {
        self.0.values().cloned().collect()
    }

    fn upsert(&mut self, url: &str, location_code: &str, recipient: RecipientId) -> bool {
        let key = WatchKey::new(url, location_code);
        self.0
            .entry(key)
            .or_insert_with(|| ProductWatch::new(url, location_code))
            .subscribers
            .insert(recipient)
    }

    fn remove(&mut self, key: &WatchKey, recipient: RecipientId) -> bool {
        self.0
            .get_mut(key)
            .is_some_and(|w| w.subscribers.remove(&recipient))
    }

    fn by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<ProductWatch> {
        self.0.values().find(|w| &w.fingerprint == fingerprint).cloned()
    }

    fn by_subscriber(&self, recipient: RecipientId) -> Vec<ProductWatch> {
        self.0
            .values()
            .filter(|w| w.subscribers.contains(&recipient))
            .cloned()
            .collect()
    }

    fn record(&mut self, key: &WatchKey, availability: Availability) -> Result<bool> {
        let watch = self
            .0
            .get_mut(key)
            .ok_or_else(|| StockWatchError::Store(format!("unknown product {key}")))?;
        let changed = watch.last_availability != availability;
        watch.last_availability = availability;
        Ok(changed)
    }

    fn delete_orphan(&mut self, key: &WatchKey) -> bool {
        if self.0.get(key).is_some_and(ProductWatch::is_orphaned) {
            self.0.remove(key);
            true
        } else {
            false
        }
    }
}

/// Volatile store for tests and `backend = "memory"`.
#[derive(Default)]
pub struct MemoryStore {
    watches: Mutex<Watches>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProductStore for MemoryStore {
    async fn list_all(&self) -> Result<Vec<ProductWatch>> {
        Ok(self.watches.lock().await.list())
    }

    async fn get(&self, key: &WatchKey) -> Result<Option<ProductWatch>> {
        Ok(self.watches.lock().await.0.get(key).cloned())
    }

    async fn upsert_subscriber(
        &self,
        url: &str,
        location_code: &str,
        recipient: RecipientId,
    ) -> Result<bool> {
        Ok(self.watches.lock().await.upsert(url, location_code, recipient))
    }

    async fn remove_subscriber(&self, key: &WatchKey, recipient: RecipientId) -> Result<bool> {
        Ok(self.watches.lock().await.remove(key, recipient))
    }

    async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<ProductWatch>> {
        Ok(self.watches.lock().await.by_fingerprint(fingerprint))
    }

    async fn find_by_subscriber(&self, recipient: RecipientId) -> Result<Vec<ProductWatch>> {
        Ok(self.watches.lock().await.by_subscriber(recipient))
    }

    async fn record_availability(&self, key: &WatchKey, availability: Availability) -> Result<()> {
        self.watches.lock().await.record(key, availability).map(|_| ())
    }

    async fn delete_if_no_subscribers(&self, key: &WatchKey) -> Result<bool> {
        Ok(self.watches.lock().await.delete_orphan(key))
    }
}

/// Store persisted as `products.json` in a directory.
pub struct JsonFileStore {
    file: PathBuf,
    watches: Mutex<Watches>,
}

impl JsonFileStore {
    const FILE_NAME: &'static str = "products.json";

    /// Open the store in `dir`, loading any existing file.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join(Self::FILE_NAME);
        let watches = Self::load(&file)?;
        tracing::debug!("📂 Loaded {} products from {}", watches.0.len(), file.display());
        Ok(Self {
            file,
            watches: Mutex::new(watches),
        })
    }

    fn load(file: &Path) -> Result<Watches> {
        if !file.exists() {
            return Ok(Watches::default());
        }
        let json = std::fs::read_to_string(file)?;
        let list: Vec<ProductWatch> = serde_json::from_str(&json)?;
        Ok(Watches(
            list.into_iter().map(|w| (w.key.clone(), w)).collect(),
        ))
    }

    fn save(&self, watches: &Watches) -> Result<()> {
        let list: Vec<&ProductWatch> = watches.0.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        let tmp = self.file.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.file)?;
        tracing::debug!("💾 Saved {} products to {}", list.len(), self.file.display());
        Ok(())
    }

    /// Apply `change` to a copy of the watches and keep the copy only once it
    /// is on disk. The closure reports whether anything changed.
    async fn update<T>(
        &self,
        change: impl FnOnce(&mut Watches) -> Result<(T, bool)>,
    ) -> Result<T> {
        let mut watches = self.watches.lock().await;
        let mut next = watches.clone();
        let (value, changed) = change(&mut next)?;
        if changed {
            self.save(&next)?;
            *watches = next;
        }
        Ok(value)
    }
}

#[async_trait]
impl ProductStore for JsonFileStore {
    async fn list_all(&self) -> Result<Vec<ProductWatch>> {
        Ok(self.watches.lock().await.list())
    }

    async fn get(&self, key: &WatchKey) -> Result<Option<ProductWatch>> {
        Ok(self.watches.lock().await.0.get(key).cloned())
    }

    async fn upsert_subscriber(
        &self,
        url: &str,
        location_code: &str,
        recipient: RecipientId,
    ) -> Result<bool> {
        self.update(|w| {
            let added = w.upsert(url, location_code, recipient);
            Ok((added, added))
        })
        .await
    }

    async fn remove_subscriber(&self, key: &WatchKey, recipient: RecipientId) -> Result<bool> {
        self.update(|w| {
            let removed = w.remove(key, recipient);
            Ok((removed, removed))
        })
        .await
    }

    async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<ProductWatch>> {
        Ok(self.watches.lock().await.by_fingerprint(fingerprint))
    }

    async fn find_by_subscriber(&self, recipient: RecipientId) -> Result<Vec<ProductWatch>> {
        Ok(self.watches.lock().await.by_subscriber(recipient))
    }

    async fn record_availability(&self, key: &WatchKey, availability: Availability) -> Result<()> {
        self.update(|w| Ok(((), w.record(key, availability)?))).await
    }

    async fn delete_if_no_subscribers(&self, key: &WatchKey) -> Result<bool> {
        self.update(|w| {
            let deleted = w.delete_orphan(key);
            Ok((deleted, deleted))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("stockwatch-store-{name}-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        dir
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new();
        assert!(store.upsert_subscriber("u1", "396191", RecipientId(1)).await.unwrap());
        assert!(!store.upsert_subscriber("u1", "396191", RecipientId(1)).await.unwrap());
        assert!(store.upsert_subscriber("u1", "396191", RecipientId(2)).await.unwrap());

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].subscribers.len(), 2);
        assert_eq!(all[0].last_availability, Availability::Unknown);
    }

    #[tokio::test]
    async fn test_same_url_different_location_are_distinct() {
        let store = MemoryStore::new();
        store.upsert_subscriber("u1", "396191", RecipientId(1)).await.unwrap();
        store.upsert_subscriber("u1", "110001", RecipientId(1)).await.unwrap();
        assert_eq!(store.find_by_subscriber(RecipientId(1)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_then_delete_orphan() {
        let store = MemoryStore::new();
        let key = WatchKey::new("u1", "396191");
        store.upsert_subscriber("u1", "396191", RecipientId(1)).await.unwrap();
        store.upsert_subscriber("u1", "396191", RecipientId(2)).await.unwrap();

        assert!(store.remove_subscriber(&key, RecipientId(1)).await.unwrap());
        assert!(!store.remove_subscriber(&key, RecipientId(1)).await.unwrap());
        assert!(!store.delete_if_no_subscribers(&key).await.unwrap());

        store.remove_subscriber(&key, RecipientId(2)).await.unwrap();
        assert!(store.delete_if_no_subscribers(&key).await.unwrap());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_fingerprint() {
        let store = MemoryStore::new();
        store.upsert_subscriber("u1", "396191", RecipientId(1)).await.unwrap();
        let fp = WatchKey::new("u1", "396191").fingerprint();
        let found = store.find_by_fingerprint(&fp).await.unwrap().unwrap();
        assert_eq!(found.url, "u1");
        let missing = WatchKey::new("u2", "396191").fingerprint();
        assert!(store.find_by_fingerprint(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_unknown_key_fails() {
        let store = MemoryStore::new();
        let err = store
            .record_availability(&WatchKey::new("nope", "1"), Availability::Available)
            .await
            .unwrap_err();
        assert!(matches!(err, StockWatchError::Store(_)));
    }

    #[tokio::test]
    async fn test_json_store_survives_reopen() {
        let dir = temp_dir("reopen");
        let key = WatchKey::new("https://shop.example/p/x", "396191");
        {
            let store = JsonFileStore::open(&dir).unwrap();
            store
                .upsert_subscriber("https://shop.example/p/x", "396191", RecipientId(42))
                .await
                .unwrap();
            store.record_availability(&key, Availability::Unavailable).await.unwrap();
        }

        let store = JsonFileStore::open(&dir).unwrap();
        let watch = store.get(&key).await.unwrap().unwrap();
        assert_eq!(watch.last_availability, Availability::Unavailable);
        assert!(watch.subscribers.contains(&RecipientId(42)));
        assert_eq!(watch.fingerprint, key.fingerprint());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_json_store_delete_persists() {
        let dir = temp_dir("delete");
        let key = WatchKey::new("u1", "396191");
        {
            let store = JsonFileStore::open(&dir).unwrap();
            store.upsert_subscriber("u1", "396191", RecipientId(1)).await.unwrap();
            store.remove_subscriber(&key, RecipientId(1)).await.unwrap();
            assert!(store.delete_if_no_subscribers(&key).await.unwrap());
        }
        let store = JsonFileStore::open(&dir).unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_json_store_failed_save_leaves_state_unchanged() {
        let dir = temp_dir("failed-save");
        let store = JsonFileStore::open(&dir).unwrap();
        // A directory where the temp file goes makes every write fail.
        let blocker = dir.join("products.json.tmp");
        std::fs::create_dir_all(&blocker).unwrap();

        assert!(store.upsert_subscriber("u1", "396191", RecipientId(1)).await.is_err());
        assert!(store.upsert_subscriber("u1", "396191", RecipientId(1)).await.is_err());
        assert!(store.list_all().await.unwrap().is_empty());

        std::fs::remove_dir_all(&blocker).unwrap();
        assert!(store.upsert_subscriber("u1", "396191", RecipientId(1)).await.unwrap());
        drop(store);

        let reopened = JsonFileStore::open(&dir).unwrap();
        assert_eq!(reopened.list_all().await.unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = temp_dir("corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("products.json"), "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&dir),
            Err(StockWatchError::Serialization(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
