//! SQLite-backed product store — survives restarts, one file per deployment.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use stockwatch_core::error::{Result, StockWatchError};
use stockwatch_core::traits::ProductStore;
use stockwatch_core::types::{Availability, Fingerprint, ProductWatch, RecipientId, WatchKey};

fn db_err(context: &str) -> impl FnOnce(rusqlite::Error) -> StockWatchError + '_ {
    move |e| StockWatchError::Store(format!("{context}: {e}"))
}

/// Columns selected for every product row.
const PRODUCT_COLUMNS: &str = "key, url, location_code, last_availability, created_at, fingerprint";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS products (
                key TEXT PRIMARY KEY,            -- url|location_code
                url TEXT NOT NULL,
                location_code TEXT NOT NULL,
                last_availability TEXT NOT NULL DEFAULT 'unknown',
                created_at TEXT NOT NULL,
                fingerprint TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_products_fingerprint ON products(fingerprint);

            CREATE TABLE IF NOT EXISTS subscribers (
                key TEXT NOT NULL,
                recipient INTEGER NOT NULL,
                PRIMARY KEY (key, recipient),
                FOREIGN KEY (key) REFERENCES products(key) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_subscribers_recipient ON subscribers(recipient);
         ",
            )
            .map_err(db_err("Migration"))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StockWatchError::Store("connection lock poisoned".into()))
    }

    fn row_to_watch(row: &rusqlite::Row) -> rusqlite::Result<ProductWatch> {
        let created: String = row.get(4)?;
        let availability: String = row.get(3)?;
        Ok(ProductWatch {
            key: WatchKey(row.get(0)?),
            url: row.get(1)?,
            location_code: row.get(2)?,
            last_availability: Availability::parse(&availability),
            subscribers: BTreeSet::new(),
            created_at: DateTime::parse_from_rfc3339(&created)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            fingerprint: Fingerprint(row.get(5)?),
        })
    }

    fn subscribers_of(conn: &Connection, key: &WatchKey) -> Result<BTreeSet<RecipientId>> {
        let mut stmt = conn
            .prepare("SELECT recipient FROM subscribers WHERE key = ?1")
            .map_err(db_err("Query subscribers"))?;
        let rows = stmt
            .query_map(params![key.as_str()], |row| row.get::<_, i64>(0))
            .map_err(db_err("Query subscribers"))?;
        rows.map(|r| r.map(RecipientId).map_err(db_err("Read subscriber")))
            .collect()
    }

    fn load_one(conn: &Connection, sql: &str, arg: &str) -> Result<Option<ProductWatch>> {
        let watch = conn
            .query_row(sql, params![arg], Self::row_to_watch)
            .optional()
            .map_err(db_err("Load product"))?;
        match watch {
            Some(mut watch) => {
                watch.subscribers = Self::subscribers_of(conn, &watch.key)?;
                Ok(Some(watch))
            }
            None => Ok(None),
        }
    }

    fn load_many(
        conn: &Connection,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<ProductWatch>> {
        let mut stmt = conn.prepare(sql).map_err(db_err("Query products"))?;
        let watches: Vec<ProductWatch> = stmt
            .query_map(args, Self::row_to_watch)
            .map_err(db_err("Query products"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err("Read product"))?;

        let mut subs: HashMap<String, BTreeSet<RecipientId>> = HashMap::new();
        let mut stmt = conn
            .prepare("SELECT key, recipient FROM subscribers")
            .map_err(db_err("Query subscribers"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err("Query subscribers"))?;
        for row in rows {
            let (key, recipient) = row.map_err(db_err("Read subscriber"))?;
            subs.entry(key).or_default().insert(RecipientId(recipient));
        }

        Ok(watches
            .into_iter()
            .map(|mut w| {
                w.subscribers = subs.remove(w.key.as_str()).unwrap_or_default();
                w
            })
            .collect())
    }
}

#[async_trait]
impl ProductStore for SqliteStore {
    async fn list_all(&self) -> Result<Vec<ProductWatch>> {
        let conn = self.conn()?;
        Self::load_many(&conn, &format!("SELECT {PRODUCT_COLUMNS} FROM products"), params![])
    }

    async fn get(&self, key: &WatchKey) -> Result<Option<ProductWatch>> {
        let conn = self.conn()?;
        Self::load_one(
            &conn,
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE key = ?1"),
            key.as_str(),
        )
    }

    async fn upsert_subscriber(
        &self,
        url: &str,
        location_code: &str,
        recipient: RecipientId,
    ) -> Result<bool> {
        let watch = ProductWatch::new(url, location_code);
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        tx.execute(
            "INSERT OR IGNORE INTO products (key, url, location_code, last_availability, created_at, fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                watch.key.as_str(),
                watch.url,
                watch.location_code,
                watch.last_availability.as_str(),
                watch.created_at.to_rfc3339(),
                watch.fingerprint.as_str(),
            ],
        )
        .map_err(db_err("Insert product"))?;
        let added = tx
            .execute(
                "INSERT OR IGNORE INTO subscribers (key, recipient) VALUES (?1, ?2)",
                params![watch.key.as_str(), recipient.0],
            )
            .map_err(db_err("Insert subscriber"))?;
        tx.commit().map_err(db_err("Commit"))?;
        Ok(added > 0)
    }

    async fn remove_subscriber(&self, key: &WatchKey, recipient: RecipientId) -> Result<bool> {
        let removed = self
            .conn()?
            .execute(
                "DELETE FROM subscribers WHERE key = ?1 AND recipient = ?2",
                params![key.as_str(), recipient.0],
            )
            .map_err(db_err("Delete subscriber"))?;
        Ok(removed > 0)
    }

    async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<ProductWatch>> {
        let conn = self.conn()?;
        Self::load_one(
            &conn,
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE fingerprint = ?1 LIMIT 1"),
            fingerprint.as_str(),
        )
    }

    async fn find_by_subscriber(&self, recipient: RecipientId) -> Result<Vec<ProductWatch>> {
        let conn = self.conn()?;
        Self::load_many(
            &conn,
            &format!(
                "SELECT {PRODUCT_COLUMNS} FROM products
                 WHERE key IN (SELECT key FROM subscribers WHERE recipient = ?1)"
            ),
            params![recipient.0],
        )
    }

    async fn record_availability(&self, key: &WatchKey, availability: Availability) -> Result<()> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE products SET last_availability = ?1 WHERE key = ?2",
                params![availability.as_str(), key.as_str()],
            )
            .map_err(db_err("Update product"))?;
        if updated == 0 {
            return Err(StockWatchError::Store(format!("unknown product {key}")));
        }
        Ok(())
    }

    async fn delete_if_no_subscribers(&self, key: &WatchKey) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute(
                "DELETE FROM products WHERE key = ?1
                 AND NOT EXISTS (SELECT 1 FROM subscribers WHERE key = ?1)",
                params![key.as_str()],
            )
            .map_err(db_err("Delete product"))?;
        Ok(deleted > 0)
    }
}
