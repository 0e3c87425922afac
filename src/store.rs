//! Persistent SQLite record store for jokes, scraper mappings and run metadata.
//!
//! The store exclusively owns the persisted rows; the classifier and
//! resolver never touch SQL directly, all mutation goes through the named
//! operations here.

use rusqlite::{Connection, OptionalExtension, params};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Errors from opening or querying the record store.
#[derive(Debug)]
pub enum StoreError {
    /// The store path does not exist or is not a readable file.
    Unreadable(PathBuf),
    /// Underlying SQLite failure.
    Sqlite(rusqlite::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable(path) => {
                write!(f, "store path '{}' does not exist or is not readable", path.display())
            }
            Self::Sqlite(source) => write!(f, "store query failed: {}", source),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unreadable(_) => None,
            Self::Sqlite(source) => Some(source),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Sqlite(source)
    }
}

/// A joke row. `used` counts deliveries and drives selection order.
#[derive(Debug, Clone)]
pub struct JokeRecord {
    pub id: i64,
    pub joke: String,
    pub used: i64,
}

/// SQLite-backed record store.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open an existing store. The schema is provisioned out of band; a
    /// missing path is a fatal startup condition for the caller to enforce.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(StoreError::Unreadable(path.to_path_buf()));
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Least-used joke, ties broken at random. `None` when the table is empty.
    pub fn least_used_joke(&self) -> Result<Option<JokeRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, joke, used FROM jokes ORDER BY used ASC, RANDOM() LIMIT 1",
            [],
            |row| {
                Ok(JokeRecord {
                    id: row.get(0)?,
                    joke: row.get(1)?,
                    used: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Increment the delivery counter of one joke.
    pub fn bump_joke_usage(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE jokes SET used = used + 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Scraper ids attached to a crawl site name.
    pub fn scraper_ids_for_site(&self, name: &str) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM external_crawl_sites WHERE name = ?1")?;
        let ids = stmt
            .query_map(params![name], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Scraper ids whose settings row points at a store id. The id is bound
    /// as text; column affinity converts it for the integer column.
    pub fn scraper_ids_for_store(&self, store_id: &str) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM external_crawl_settings WHERE store_id = ?1")?;
        let ids = stmt
            .query_map(params![store_id], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Timestamp of the previous run, if any. Absence signals a first run.
    pub fn last_run(&self) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT val FROM info WHERE name = 'lastrun' LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Upsert the singleton `lastrun` row with a new timestamp.
    pub fn record_run(&self, timestamp: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE info SET val = ?1 WHERE name = 'lastrun'",
            params![timestamp],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO info (name, val) VALUES ('lastrun', ?1)",
                params![timestamp],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl Store {
    /// In-memory store with the production schema.
    pub(crate) fn in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("in-memory database");
        conn.execute_batch(
            r#"
            CREATE TABLE jokes (
                id INTEGER PRIMARY KEY,
                joke TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE external_crawl_sites (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
            CREATE TABLE external_crawl_settings (id INTEGER PRIMARY KEY, store_id INTEGER NOT NULL);
            CREATE TABLE info (name TEXT NOT NULL, val TEXT NOT NULL);
            "#,
        )
        .expect("schema");
        Self { conn: Mutex::new(conn) }
    }

    pub(crate) fn seed(&self, sql: &str) {
        self.conn.lock().unwrap().execute_batch(sql).expect("seed");
    }

    pub(crate) fn joke_used_count(&self, id: i64) -> i64 {
        self.conn
            .lock()
            .unwrap()
            .query_row("SELECT used FROM jokes WHERE id = ?1", params![id], |row| row.get(0))
            .expect("joke row")
    }

    pub(crate) fn lastrun_row_count(&self) -> i64 {
        self.conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM info WHERE name = 'lastrun'", [], |row| row.get(0))
            .expect("info count")
    }
}
