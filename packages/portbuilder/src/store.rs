//! Embedded transactional store for build attempts, the latest-success
//! index, and content fingerprints.
//!
//! Backed by SQLite (via `rusqlite`, bundled) for the same reasons the
//! corpus reaches for it elsewhere: the working set is small, a single
//! file is easy to ship, and transactions give us crash-safe point writes
//! without standing up a server. An `fslock` exclusive lock on a sibling
//! `.lock` file prevents two processes from opening the same store
//! concurrently, mirroring the lock discipline used for the on-disk cache
//! elsewhere in this codebase.

use std::{path::Path, str::FromStr, sync::Arc};

use color_eyre::{Result, eyre::Context};
use derive_more::Debug;
use jiff::Timestamp;
use rusqlite::{Connection, OptionalExtension, params};
use strum::{Display, EnumString};
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    error::StoreError,
    fs::{Locked as FsLocked, LockFile},
    path::AbsFilePath,
};

/// Status of a single build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum BuildStatus {
    Running,
    Success,
    Failed,
}

/// A single recorded build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub uuid: Uuid,
    pub origin: String,
    pub version: String,
    pub status: BuildStatus,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

/// Embedded KV store with three logical namespaces: `builds`, `packages`,
/// and `crc_index`.
#[derive(Debug)]
pub struct BuildStore {
    #[debug("<connection>")]
    conn: Arc<Mutex<Connection>>,
    lock: Option<LockFile<FsLocked>>,
}

impl BuildStore {
    /// Open (creating if absent) the store at `path`, taking an exclusive
    /// lock on a sibling `<path>.lock` file so a second process cannot
    /// open the same store concurrently.
    #[instrument(name = "BuildStore::open")]
    pub async fn open(path: &AbsFilePath) -> Result<Self> {
        let lock_path = {
            let mut p = path.as_std_path().as_os_str().to_owned();
            p.push(".lock");
            AbsFilePath::try_from(Path::new(&p))?
        };
        if let Some(parent) = path.as_std_path().parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create store directory: {parent:?}"))?;
        }

        let lock = LockFile::open(lock_path)
            .await
            .context("open store lock file")?
            .lock()
            .await
            .context("acquire exclusive store lock")?;

        let path = path.clone();
        let conn = spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(path.as_std_path())
                .with_context(|| format!("open build store at {path:?}"))?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await
        .context("join task")??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            lock: Some(lock),
        })
    }

    /// Open an in-memory store for testing. Takes no file lock.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            lock: None,
        })
    }

    /// Release the store's exclusive lock. Idempotent.
    #[instrument(skip(self))]
    pub async fn close(&mut self) -> Result<()> {
        if let Some(lock) = self.lock.take() {
            lock.unlock().await.context("release store lock")?;
        }
        Ok(())
    }

    /// Insert or replace a build record.
    #[instrument(skip(self, rec))]
    pub async fn save_record(&self, rec: &BuildRecord) -> Result<()> {
        if rec.uuid.is_nil() {
            return Err(StoreError::Validation("build record uuid must not be nil".to_string()).into());
        }
        if rec.origin.is_empty() {
            return Err(StoreError::Validation("build record origin must not be empty".to_string()).into());
        }

        let conn = Arc::clone(&self.conn);
        let rec = rec.clone();
        spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                r#"
                INSERT OR REPLACE INTO builds
                (uuid, origin, version, status, start_time, end_time)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    rec.uuid.to_string(),
                    rec.origin,
                    rec.version,
                    rec.status.to_string(),
                    rec.start_time.to_string(),
                    rec.end_time.to_string(),
                ],
            )
            .map(|_| ())
            .map_err(|e| StoreError::Database(e.to_string()))
        })
        .await
        .context("join task")?
        .map_err(Into::into)
    }

    /// Fetch a build record by uuid.
    #[instrument(skip(self))]
    pub async fn get_record(&self, uuid: Uuid) -> Result<BuildRecord> {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || -> Result<BuildRecord> {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT uuid, origin, version, status, start_time, end_time FROM builds WHERE uuid = ?1",
                params![uuid.to_string()],
                row_to_record,
            )
            .optional()
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("build record {uuid}")).into())
        })
        .await
        .context("join task")?
    }

    /// Load a record, update its status and end time, and store it back.
    #[instrument(skip(self))]
    pub async fn update_record_status(
        &self,
        uuid: Uuid,
        status: BuildStatus,
        end_time: Timestamp,
    ) -> Result<()> {
        if uuid.is_nil() {
            return Err(StoreError::Validation("build record uuid must not be nil".to_string()).into());
        }

        let mut rec = self.get_record(uuid).await?;
        rec.status = status;
        rec.end_time = end_time;
        self.save_record(&rec).await
    }

    /// Point `<origin>@<version>` at the given build's uuid. An empty
    /// `version` is a legal key (means "version unspecified").
    #[instrument(skip(self))]
    pub async fn update_package_index(
        &self,
        origin: &str,
        version: &str,
        uuid: Uuid,
    ) -> Result<()> {
        if uuid.is_nil() {
            return Err(StoreError::Validation("package index uuid must not be nil".to_string()).into());
        }
        if origin.is_empty() {
            return Err(StoreError::Validation("package index origin must not be empty".to_string()).into());
        }

        let conn = Arc::clone(&self.conn);
        let key = package_key(origin, version);
        let origin = origin.to_string();
        spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO packages (key, origin, uuid) VALUES (?1, ?2, ?3)",
                params![key, origin, uuid.to_string()],
            )
            .map(|_| ())
            .map_err(|e| StoreError::Database(e.to_string()))
        })
        .await
        .context("join task")?
        .map_err(Into::into)
    }

    /// Resolve `<origin>@<version>` (or, with an empty version, the most
    /// recently written entry for that origin) to its build record.
    #[instrument(skip(self))]
    pub async fn latest_for(&self, origin: &str, version: &str) -> Result<BuildRecord> {
        let conn = Arc::clone(&self.conn);
        let origin = origin.to_string();
        let version = version.to_string();
        let uuid = spawn_blocking(move || -> Result<String> {
            let conn = conn.blocking_lock();
            if version.is_empty() {
                conn.query_row(
                    "SELECT uuid FROM packages WHERE origin = ?1 ORDER BY rowid DESC LIMIT 1",
                    params![origin],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(|e| StoreError::Database(e.to_string()))?
                .ok_or_else(|| StoreError::NotFound(format!("package index for {origin}")).into())
            } else {
                let key = package_key(&origin, &version);
                conn.query_row(
                    "SELECT uuid FROM packages WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(|e| StoreError::Database(e.to_string()))?
                .ok_or_else(|| StoreError::NotFound(format!("package index for {key}")).into())
            }
        })
        .await
        .context("join task")??;

        let uuid = Uuid::parse_str(&uuid)
            .map_err(|e| StoreError::Record(format!("corrupt uuid {uuid:?}: {e}")))?;
        self.get_record(uuid).await
    }

    /// Fetch the stored fingerprint for a port origin.
    #[instrument(skip(self))]
    pub async fn get_fingerprint(&self, origin: &str) -> Result<u32> {
        let conn = Arc::clone(&self.conn);
        let origin = origin.to_string();
        spawn_blocking(move || -> Result<u32> {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT crc FROM crc_index WHERE origin = ?1",
                params![origin],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|v| v as u32)
            .ok_or_else(|| StoreError::NotFound(format!("fingerprint for {origin}")).into())
        })
        .await
        .context("join task")?
    }

    /// Store the fingerprint for a port origin.
    #[instrument(skip(self))]
    pub async fn update_fingerprint(&self, origin: &str, crc: u32) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let origin = origin.to_string();
        spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO crc_index (origin, crc) VALUES (?1, ?2)",
                params![origin, crc as i64],
            )
            .map(|_| ())
            .map_err(|e| StoreError::Database(e.to_string()))
        })
        .await
        .context("join task")?
        .map_err(Into::into)
    }

    /// All recorded attempts for a single origin, most recent first.
    #[instrument(skip(self))]
    pub async fn records_for_origin(&self, origin: &str) -> Result<Vec<BuildRecord>> {
        let conn = Arc::clone(&self.conn);
        let origin = origin.to_string();
        spawn_blocking(move || -> Result<Vec<BuildRecord>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(
                    "SELECT uuid, origin, version, status, start_time, end_time \
                     FROM builds WHERE origin = ?1 ORDER BY rowid DESC",
                )
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![origin], row_to_record)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| StoreError::Database(e.to_string()).into())
        })
        .await
        .context("join task")?
    }

    /// The `limit` most recent recorded attempts across every origin, for
    /// a read-only status overview with no port named.
    #[instrument(skip(self))]
    pub async fn recent_records(&self, limit: usize) -> Result<Vec<BuildRecord>> {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || -> Result<Vec<BuildRecord>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(
                    "SELECT uuid, origin, version, status, start_time, end_time \
                     FROM builds ORDER BY rowid DESC LIMIT ?1",
                )
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_record)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| StoreError::Database(e.to_string()).into())
        })
        .await
        .context("join task")?
    }

    /// Whether `origin` needs to be rebuilt: true if there is no stored
    /// fingerprint, or it differs from `current_crc`. Never errors on a
    /// missing fingerprint (absence means "needs build").
    #[instrument(skip(self))]
    pub async fn needs_build(&self, origin: &str, current_crc: u32) -> Result<bool> {
        match self.get_fingerprint(origin).await {
            Ok(stored) => Ok(stored != current_crc),
            Err(err) => match err.downcast_ref::<StoreError>() {
                Some(StoreError::NotFound(_)) => Ok(true),
                _ => Err(err),
            },
        }
    }
}

fn package_key(origin: &str, version: &str) -> String {
    if version.is_empty() {
        origin.to_string()
    } else {
        format!("{origin}@{version}")
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<BuildRecord> {
    let uuid: String = row.get(0)?;
    let origin: String = row.get(1)?;
    let version: String = row.get(2)?;
    let status: String = row.get(3)?;
    let start_time: String = row.get(4)?;
    let end_time: String = row.get(5)?;

    Ok(BuildRecord {
        uuid: Uuid::parse_str(&uuid).unwrap_or_else(|_| Uuid::nil()),
        origin,
        version,
        status: BuildStatus::from_str(&status).unwrap_or(BuildStatus::Failed),
        start_time: start_time.parse().unwrap_or(Timestamp::UNIX_EPOCH),
        end_time: end_time.parse().unwrap_or(Timestamp::UNIX_EPOCH),
    })
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            uuid TEXT PRIMARY KEY,
            origin TEXT NOT NULL,
            version TEXT NOT NULL,
            status TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_builds_origin ON builds(origin);

        CREATE TABLE IF NOT EXISTS packages (
            key TEXT PRIMARY KEY,
            origin TEXT NOT NULL,
            uuid TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_packages_origin ON packages(origin);

        CREATE TABLE IF NOT EXISTS crc_index (
            origin TEXT PRIMARY KEY,
            crc INTEGER NOT NULL
        );
        "#,
    )
    .context("initialize build store schema")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(origin: &str) -> BuildRecord {
        BuildRecord {
            uuid: Uuid::new_v4(),
            origin: origin.to_string(),
            version: "1.0".to_string(),
            status: BuildStatus::Running,
            start_time: Timestamp::UNIX_EPOCH,
            end_time: Timestamp::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn round_trips_a_record() {
        let store = BuildStore::in_memory().unwrap();
        let rec = record("games/foo");
        store.save_record(&rec).await.unwrap();
        let got = store.get_record(rec.uuid).await.unwrap();
        assert_eq!(got, rec);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let store = BuildStore::in_memory().unwrap();
        let err = store.get_record(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn transitions_running_to_success() {
        let store = BuildStore::in_memory().unwrap();
        let rec = record("games/foo");
        store.save_record(&rec).await.unwrap();

        store
            .update_record_status(rec.uuid, BuildStatus::Success, Timestamp::UNIX_EPOCH)
            .await
            .unwrap();

        let got = store.get_record(rec.uuid).await.unwrap();
        assert_eq!(got.status, BuildStatus::Success);
    }

    #[tokio::test]
    async fn package_index_round_trips() {
        let store = BuildStore::in_memory().unwrap();
        let rec = record("games/foo");
        store.save_record(&rec).await.unwrap();
        store
            .update_package_index("games/foo", "1.0", rec.uuid)
            .await
            .unwrap();

        let got = store.latest_for("games/foo", "1.0").await.unwrap();
        assert_eq!(got.uuid, rec.uuid);
    }

    #[tokio::test]
    async fn latest_for_empty_version_takes_most_recent() {
        let store = BuildStore::in_memory().unwrap();
        let first = record("games/foo");
        store.save_record(&first).await.unwrap();
        store
            .update_package_index("games/foo", "1.0", first.uuid)
            .await
            .unwrap();

        let second = record("games/foo");
        store.save_record(&second).await.unwrap();
        store
            .update_package_index("games/foo", "2.0", second.uuid)
            .await
            .unwrap();

        let got = store.latest_for("games/foo", "").await.unwrap();
        assert_eq!(got.uuid, second.uuid);
    }

    #[tokio::test]
    async fn fingerprint_round_trips() {
        let store = BuildStore::in_memory().unwrap();
        store.update_fingerprint("games/foo", 0xDEAD_BEEF).await.unwrap();
        let got = store.get_fingerprint("games/foo").await.unwrap();
        assert_eq!(got, 0xDEAD_BEEF);
    }

    #[tokio::test]
    async fn needs_build_true_when_absent() {
        let store = BuildStore::in_memory().unwrap();
        assert!(store.needs_build("games/foo", 1).await.unwrap());
    }

    #[tokio::test]
    async fn needs_build_false_when_matching() {
        let store = BuildStore::in_memory().unwrap();
        store.update_fingerprint("games/foo", 42).await.unwrap();
        assert!(!store.needs_build("games/foo", 42).await.unwrap());
        assert!(store.needs_build("games/foo", 43).await.unwrap());
    }

    #[tokio::test]
    async fn records_for_origin_is_most_recent_first() {
        let store = BuildStore::in_memory().unwrap();
        let first = record("games/foo");
        store.save_record(&first).await.unwrap();
        let second = record("games/foo");
        store.save_record(&second).await.unwrap();
        store.save_record(&record("games/bar")).await.unwrap();

        let got = store.records_for_origin("games/foo").await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].uuid, second.uuid);
        assert_eq!(got[1].uuid, first.uuid);
    }

    #[tokio::test]
    async fn save_record_rejects_nil_uuid() {
        let store = BuildStore::in_memory().unwrap();
        let mut rec = record("games/foo");
        rec.uuid = Uuid::nil();
        let err = store.save_record(&rec).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn update_package_index_rejects_nil_uuid() {
        let store = BuildStore::in_memory().unwrap();
        let err = store
            .update_package_index("games/foo", "1.0", Uuid::nil())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn recent_records_spans_origins_and_respects_limit() {
        let store = BuildStore::in_memory().unwrap();
        store.save_record(&record("games/foo")).await.unwrap();
        store.save_record(&record("games/bar")).await.unwrap();
        let last = record("games/baz");
        store.save_record(&last).await.unwrap();

        let got = store.recent_records(2).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].uuid, last.uuid);
    }
}
