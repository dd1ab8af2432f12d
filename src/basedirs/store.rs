//! Basedirs store (spec §4.H): the same kind of ordered key-value container
//! as `store::dguta`, holding per-(age, id, basedir) usage and subdir
//! breakdowns plus a per-(gid, mount) history series.
use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::DgutaError;

const SEALED_KEY: &str = "sealed";
const UPDATED_AT_KEY: &str = "updated_at";

fn sqlite_err(e: rusqlite::Error) -> DgutaError {
    DgutaError::Other(e.into())
}

fn pool_err(e: r2d2::Error) -> DgutaError {
    DgutaError::Other(anyhow::anyhow!(e))
}

/// Which id axis a usage/subdir row is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Group,
    User,
}

/// `(id, basedir, UsageSize, QuotaSize, UsageInodes, QuotaInodes, Mtime,
/// Age, DateNoSpace, DateNoFiles)` — spec §3's `Usage`, minus `Owner`/`Name`
/// which the reader fills in from the name caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub id: u32,
    pub basedir: String,
    pub usage_size: u64,
    pub quota_size: u64,
    pub usage_inodes: u64,
    pub quota_inodes: u64,
    pub mtime: i64,
    pub age: u8,
    /// Unix seconds at which the series is projected to exhaust quota, or
    /// `None` for the "never" sentinel.
    pub date_no_space: Option<i64>,
    pub date_no_files: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subdir {
    pub name: String,
    pub count: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub date: i64,
    pub usage_size: u64,
    pub quota_size: u64,
    pub usage_inodes: u64,
    pub quota_inodes: u64,
}

fn usage_key(kind: Kind, age: u8, id: u32, basedir: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(6 + basedir.len());
    key.push(kind_tag(kind));
    key.push(age);
    key.extend_from_slice(&id.to_be_bytes());
    key.extend_from_slice(basedir.as_bytes());
    key
}

fn kind_tag(kind: Kind) -> u8 {
    match kind {
        Kind::Group => 0,
        Kind::User => 1,
    }
}

fn history_key(gid: u32, mount_path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + mount_path.len());
    key.extend_from_slice(&gid.to_be_bytes());
    key.extend_from_slice(mount_path.as_bytes());
    key
}

/// Writer for one basedirs dataset, mirroring `DgutaWriter`'s batch/close
/// contract (spec §4.H, §7's "sealed on clean close" rule).
pub struct BaseDirsWriter {
    conn: Connection,
    updated_at: i64,
}

impl BaseDirsWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, DgutaError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(DgutaError::DbExists(path.to_path_buf()));
        }
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.execute_batch(
            "CREATE TABLE usage (key BLOB PRIMARY KEY, value BLOB NOT NULL);
             CREATE TABLE subdirs (key BLOB PRIMARY KEY, value BLOB NOT NULL);
             CREATE TABLE history (key BLOB PRIMARY KEY, value BLOB NOT NULL);
             CREATE TABLE meta (key TEXT PRIMARY KEY, value BLOB NOT NULL);",
        )
        .map_err(sqlite_err)?;
        Ok(Self { conn, updated_at: 0 })
    }

    /// Seed this writer's history table from a predecessor dataset's
    /// history, so a per-snapshot backend can still honour the
    /// strictly-increasing-Date append rule across snapshots (spec §4.H).
    pub fn seed_history_from(&mut self, predecessor: &BaseDirsReader) -> Result<(), DgutaError> {
        let tx = self.conn.transaction().map_err(sqlite_err)?;
        {
            let mut stmt = predecessor
                .pool
                .get()
                .map_err(pool_err)?
                .prepare("SELECT key, value FROM history")
                .map_err(sqlite_err)?
                .query_map([], |r| Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?)))
                .map_err(sqlite_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sqlite_err)?;
            for (key, value) in stmt.drain(..) {
                tx.execute(
                    "INSERT INTO history (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )
                .map_err(sqlite_err)?;
            }
        }
        tx.commit().map_err(sqlite_err)?;
        Ok(())
    }

    pub fn set_updated_at(&mut self, ts: i64) {
        self.updated_at = ts;
    }

    pub fn put_usage(&mut self, kind: Kind, usage: &Usage) -> Result<(), DgutaError> {
        let key = usage_key(kind, usage.age, usage.id, &usage.basedir);
        let value = serde_json::to_vec(usage).map_err(|e| DgutaError::Other(e.into()))?;
        self.conn
            .execute(
                "INSERT INTO usage (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    pub fn put_subdirs(&mut self, kind: Kind, age: u8, id: u32, basedir: &str, subdirs: &[Subdir]) -> Result<(), DgutaError> {
        let key = usage_key(kind, age, id, basedir);
        let value = serde_json::to_vec(subdirs).map_err(|e| DgutaError::Other(e.into()))?;
        self.conn
            .execute(
                "INSERT INTO subdirs (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    /// Append `point` iff the existing series is empty or `point.date` is
    /// strictly after the last stored date; otherwise a no-op (spec §4.H).
    pub fn upsert_history(&mut self, gid: u32, mount_path: &str, point: HistoryPoint) -> Result<(), DgutaError> {
        let key = history_key(gid, mount_path);
        let existing: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT value FROM history WHERE key = ?1", params![key], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?;
        let mut series: Vec<HistoryPoint> = match existing {
            Some(v) => serde_json::from_slice(&v).map_err(|e| DgutaError::Other(e.into()))?,
            None => Vec::new(),
        };
        let accept = series.last().map(|last| point.date > last.date).unwrap_or(true);
        if !accept {
            return Ok(());
        }
        series.push(point);
        let value = serde_json::to_vec(&series).map_err(|e| DgutaError::Other(e.into()))?;
        self.conn
            .execute(
                "INSERT INTO history (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }

    pub fn close(self) -> Result<(), DgutaError> {
        self.conn
            .execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)",
                params![UPDATED_AT_KEY, self.updated_at.to_le_bytes()],
            )
            .map_err(sqlite_err)?;
        self.conn
            .execute("INSERT INTO meta (key, value) VALUES (?1, X'01')", params![SEALED_KEY])
            .map_err(sqlite_err)?;
        Ok(())
    }

    /// Reopen an existing (already-sealed) dataset for in-place maintenance
    /// edits (spec §6's `CleanInvalidHistory`). Does not recreate the
    /// schema and is not meant to be `close()`d again.
    pub fn open_for_maintenance(path: impl AsRef<Path>) -> Result<Self, DgutaError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DgutaError::DbNotExists(path.to_path_buf()));
        }
        let conn = Connection::open(path).map_err(sqlite_err)?;
        Ok(Self { conn, updated_at: 0 })
    }

    pub fn delete_history(&mut self, gid: u32, mount_path: &str) -> Result<(), DgutaError> {
        let key = history_key(gid, mount_path);
        self.conn
            .execute("DELETE FROM history WHERE key = ?1", params![key])
            .map_err(sqlite_err)?;
        Ok(())
    }
}

/// Read-only handle onto a sealed basedirs dataset.
pub struct BaseDirsReader {
    pool: Pool<SqliteConnectionManager>,
    updated_at: i64,
}

impl BaseDirsReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DgutaError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DgutaError::DbNotExists(path.to_path_buf()));
        }
        let manager = SqliteConnectionManager::file(path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_init(|c| c.execute_batch("PRAGMA mmap_size = 268435456; PRAGMA query_only = ON;"));
        let pool = Pool::builder().max_size(8).build(manager).map_err(pool_err)?;
        let conn = pool.get().map_err(pool_err)?;

        let sealed: Option<Vec<u8>> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![SEALED_KEY], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?;
        if sealed.is_none() {
            return Err(DgutaError::StoreIntegrity(format!(
                "{} was not closed cleanly",
                path.display()
            )));
        }
        let updated_at_bytes: Vec<u8> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![UPDATED_AT_KEY], |r| r.get(0))
            .map_err(sqlite_err)?;
        let updated_at = i64::from_le_bytes(
            updated_at_bytes
                .try_into()
                .map_err(|_| DgutaError::StoreIntegrity("malformed updated_at meta row".to_string()))?,
        );
        drop(conn);
        Ok(Self { pool, updated_at })
    }

    pub fn modtime(&self) -> i64 {
        self.updated_at
    }

    fn usage_for(&self, kind: Kind, age: u8) -> Result<Vec<Usage>, DgutaError> {
        let conn = self.pool.get().map_err(pool_err)?;
        let prefix = vec![kind_tag(kind), age];
        let mut stmt = conn
            .prepare("SELECT key, value FROM usage WHERE key >= ?1 ORDER BY key")
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map(params![prefix.clone()], |r| Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?)))
            .map_err(sqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (key, value) = row.map_err(sqlite_err)?;
            if key.len() < 2 || key[0] != prefix[0] || key[1] != prefix[1] {
                continue;
            }
            let usage: Usage = serde_json::from_slice(&value).map_err(|e| DgutaError::Other(e.into()))?;
            out.push(usage);
        }
        Ok(out)
    }

    pub fn group_usage(&self, age: u8) -> Result<Vec<Usage>, DgutaError> {
        self.usage_for(Kind::Group, age)
    }

    pub fn user_usage(&self, age: u8) -> Result<Vec<Usage>, DgutaError> {
        self.usage_for(Kind::User, age)
    }

    fn subdirs_for(&self, kind: Kind, id: u32, basedir: &str, age: u8) -> Result<Vec<Subdir>, DgutaError> {
        let key = usage_key(kind, age, id, basedir);
        let conn = self.pool.get().map_err(pool_err)?;
        let value: Option<Vec<u8>> = conn
            .query_row("SELECT value FROM subdirs WHERE key = ?1", params![key], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?;
        match value {
            Some(v) => serde_json::from_slice(&v).map_err(|e| DgutaError::Other(e.into())),
            None => Ok(Vec::new()),
        }
    }

    pub fn group_subdirs(&self, gid: u32, basedir: &str, age: u8) -> Result<Vec<Subdir>, DgutaError> {
        self.subdirs_for(Kind::Group, gid, basedir, age)
    }

    pub fn user_subdirs(&self, uid: u32, basedir: &str, age: u8) -> Result<Vec<Subdir>, DgutaError> {
        self.subdirs_for(Kind::User, uid, basedir, age)
    }

    /// Row counts across the three maps, for `BaseDirsInfo` (spec §6).
    pub fn scan_counts(&self) -> Result<(u64, u64, u64), DgutaError> {
        let conn = self.pool.get().map_err(pool_err)?;
        let usage: u64 = conn.query_row("SELECT COUNT(*) FROM usage", [], |r| r.get(0)).map_err(sqlite_err)?;
        let subdirs: u64 = conn.query_row("SELECT COUNT(*) FROM subdirs", [], |r| r.get(0)).map_err(sqlite_err)?;
        let history: u64 = conn.query_row("SELECT COUNT(*) FROM history", [], |r| r.get(0)).map_err(sqlite_err)?;
        Ok((usage, subdirs, history))
    }

    fn decode_history_key(key: &[u8]) -> Option<(u32, String)> {
        if key.len() < 4 {
            return None;
        }
        let gid = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
        let mount_path = String::from_utf8_lossy(&key[4..]).into_owned();
        Some((gid, mount_path))
    }

    /// Every `(gid, mountPath)` key present in the history map.
    pub fn all_history_keys(&self) -> Result<Vec<(u32, String)>, DgutaError> {
        let conn = self.pool.get().map_err(pool_err)?;
        let mut stmt = conn.prepare("SELECT key FROM history").map_err(sqlite_err)?;
        let rows = stmt
            .query_map([], |r| r.get::<_, Vec<u8>>(0))
            .map_err(sqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            let key = row.map_err(sqlite_err)?;
            if let Some(pair) = Self::decode_history_key(&key) {
                out.push(pair);
            }
        }
        Ok(out)
    }

    /// History keys whose `mountPath` does not start with `prefix` (spec
    /// §6's `FindInvalidHistory`).
    pub fn history_keys_not_matching(&self, prefix: &str) -> Result<Vec<(u32, String)>, DgutaError> {
        Ok(self
            .all_history_keys()?
            .into_iter()
            .filter(|(_, mount_path)| !mount_path.starts_with(prefix))
            .collect())
    }

    /// Resolved `mountPath` is the caller's responsibility (spec §4.I's
    /// mountpoint resolver sits above this store, not inside it).
    pub fn history(&self, gid: u32, mount_path: &str) -> Result<Vec<HistoryPoint>, DgutaError> {
        let key = history_key(gid, mount_path);
        let conn = self.pool.get().map_err(pool_err)?;
        let value: Option<Vec<u8>> = conn
            .query_row("SELECT value FROM history WHERE key = ?1", params![key], |r| r.get(0))
            .optional()
            .map_err(sqlite_err)?;
        match value {
            Some(v) => serde_json::from_slice(&v).map_err(|e| DgutaError::Other(e.into())),
            None => Ok(Vec::new()),
        }
    }
}
