//! DGUTA store (spec §4.E): the GUTA map and Children map keyspaces,
//! backed by a sqlite file opened through an `r2d2` pool so many readers
//! can share one mmap-populated handle.
use std::path::{Path, PathBuf};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::codec::{children_key, decode_children, decode_gutas, encode_children, encode_gutas, guta_key, Guta};
use crate::error::DgutaError;
use crate::summariser::DgutaSink;

const SEALED_KEY: &str = "sealed";
const MOUNT_PATH_KEY: &str = "mount_path";
const UPDATED_AT_KEY: &str = "updated_at";

fn sqlite_err(e: rusqlite::Error) -> DgutaError {
    DgutaError::Other(e.into())
}

fn pool_err(e: r2d2::Error) -> DgutaError {
    DgutaError::Other(anyhow::anyhow!(e))
}

/// Writer for one dataset. `add` buffers `RecordDGUTA`s and flushes a
/// single transaction per batch; `close` must be called for the dataset
/// to be adoptable by a reader (spec §7: an unsealed dataset is refused).
#[derive(Debug)]
pub struct DgutaWriter {
    conn: Connection,
    mount_path: Option<String>,
    updated_at: i64,
    batch_size: usize,
    pending: Vec<(String, Vec<Guta>, Vec<String>)>,
}

impl DgutaWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, DgutaError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(DgutaError::DbExists(path.to_path_buf()));
        }
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.execute_batch(
            "CREATE TABLE guta_map (key BLOB PRIMARY KEY, value BLOB NOT NULL);
             CREATE TABLE children_map (key BLOB PRIMARY KEY, value BLOB NOT NULL);
             CREATE TABLE meta (key TEXT PRIMARY KEY, value BLOB NOT NULL);",
        )
        .map_err(sqlite_err)?;
        Ok(Self {
            conn,
            mount_path: None,
            updated_at: 0,
            batch_size: 10_000,
            pending: Vec::new(),
        })
    }

    pub fn set_mount_path(&mut self, mount_path: &str) {
        self.mount_path = Some(mount_path.to_string());
    }

    pub fn set_updated_at(&mut self, ts: i64) {
        self.updated_at = ts;
    }

    pub fn set_batch_size(&mut self, n: usize) {
        self.batch_size = n.max(1);
    }

    fn flush(&mut self) -> Result<(), DgutaError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction().map_err(sqlite_err)?;
        for (dir, gutas, children) in self.pending.drain(..) {
            if !gutas.is_empty() {
                let key = guta_key(&dir);
                let value = encode_gutas(&gutas);
                tx.execute(
                    "INSERT INTO guta_map (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )
                .map_err(sqlite_err)?;
            }
            if !children.is_empty() {
                let key = children_key(&dir);
                let value = encode_children(&children);
                tx.execute(
                    "INSERT INTO children_map (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )
                .map_err(sqlite_err)?;
            }
        }
        tx.commit().map_err(sqlite_err)?;
        Ok(())
    }

    /// Flush the last partial batch and write the sentinel row that marks
    /// the dataset as cleanly sealed. A dataset whose writer never reaches
    /// `close` must be discarded by the caller, not adopted.
    pub fn close(mut self) -> Result<(), DgutaError> {
        let mount_path = self.mount_path.clone().ok_or_else(|| {
            DgutaError::BadPath("set_mount_path is required before close".to_string())
        })?;
        self.flush()?;
        self.conn
            .execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)",
                params![MOUNT_PATH_KEY, mount_path.as_bytes()],
            )
            .map_err(sqlite_err)?;
        self.conn
            .execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)",
                params![UPDATED_AT_KEY, self.updated_at.to_le_bytes()],
            )
            .map_err(sqlite_err)?;
        self.conn
            .execute(
                "INSERT INTO meta (key, value) VALUES (?1, X'01')",
                params![SEALED_KEY],
            )
            .map_err(sqlite_err)?;
        Ok(())
    }
}

impl DgutaSink for DgutaWriter {
    fn emit(&mut self, dir: &str, gutas: &[Guta], children: &[String]) -> Result<(), DgutaError> {
        self.pending
            .push((dir.to_string(), gutas.to_vec(), children.to_vec()));
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }
}

/// Read-only, mmap-populated handle onto a sealed dataset.
#[derive(Debug)]
pub struct DgutaReader {
    pool: Pool<SqliteConnectionManager>,
    mount_path: String,
    updated_at: i64,
}

impl DgutaReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DgutaError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DgutaError::DbNotExists(path.to_path_buf()));
        }
        let path_buf: PathBuf = path.to_path_buf();
        let manager = SqliteConnectionManager::file(&path_buf)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_init(|c| c.execute_batch("PRAGMA mmap_size = 268435456; PRAGMA query_only = ON;"));
        let pool = Pool::builder().max_size(8).build(manager).map_err(pool_err)?;
        let conn = pool.get().map_err(pool_err)?;

        let sealed: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![SEALED_KEY],
                |r| r.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        if sealed.is_none() {
            return Err(DgutaError::StoreIntegrity(format!(
                "{} was not closed cleanly",
                path.display()
            )));
        }

        let mount_path_bytes: Vec<u8> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![MOUNT_PATH_KEY],
                |r| r.get(0),
            )
            .map_err(sqlite_err)?;
        let mount_path = String::from_utf8_lossy(&mount_path_bytes).into_owned();

        let updated_at_bytes: Vec<u8> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![UPDATED_AT_KEY],
                |r| r.get(0),
            )
            .map_err(sqlite_err)?;
        let updated_at = i64::from_le_bytes(updated_at_bytes.try_into().map_err(|_| {
            DgutaError::StoreIntegrity("malformed updated_at meta row".to_string())
        })?);

        drop(conn);
        Ok(Self {
            pool,
            mount_path,
            updated_at,
        })
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    pub fn modtime(&self) -> i64 {
        self.updated_at
    }

    /// `(NumDirs, NumGUTAs)` across the whole GUTA map, for `DGUTAInfo`
    /// (spec §6).
    pub fn scan_guta_map(&self) -> Result<(u64, u64), DgutaError> {
        let conn = self.pool.get().map_err(pool_err)?;
        let mut stmt = conn.prepare("SELECT value FROM guta_map").map_err(sqlite_err)?;
        let rows = stmt.query_map([], |r| r.get::<_, Vec<u8>>(0)).map_err(sqlite_err)?;
        let mut num_dirs = 0u64;
        let mut num_gutas = 0u64;
        for row in rows {
            let value = row.map_err(sqlite_err)?;
            num_dirs += 1;
            num_gutas += decode_gutas(&value)?.len() as u64;
        }
        Ok((num_dirs, num_gutas))
    }

    /// `(NumParents, NumChildren)` across the whole Children map, for
    /// `DGUTAInfo` (spec §6).
    pub fn scan_children_map(&self) -> Result<(u64, u64), DgutaError> {
        let conn = self.pool.get().map_err(pool_err)?;
        let mut stmt = conn.prepare("SELECT value FROM children_map").map_err(sqlite_err)?;
        let rows = stmt.query_map([], |r| r.get::<_, Vec<u8>>(0)).map_err(sqlite_err)?;
        let mut num_parents = 0u64;
        let mut num_children = 0u64;
        for row in rows {
            let value = row.map_err(sqlite_err)?;
            num_parents += 1;
            num_children += decode_children(&value)?.len() as u64;
        }
        Ok((num_parents, num_children))
    }

    pub fn get_dguta(&self, dir: &str) -> Result<(String, Vec<Guta>), DgutaError> {
        let dir = normalize_trailing_slash(dir);
        let key = guta_key(&dir);
        let conn = self.pool.get().map_err(pool_err)?;
        let value: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM guta_map WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        match value {
            Some(v) => Ok((dir, decode_gutas(&v)?)),
            None => Err(DgutaError::DirNotFound(dir)),
        }
    }

    pub fn get_children(&self, dir: &str) -> Result<Vec<String>, DgutaError> {
        let dir = normalize_trailing_slash(dir);
        let key = children_key(&dir);
        let conn = self.pool.get().map_err(pool_err)?;
        let value: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM children_map WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        match value {
            Some(v) => {
                let mut names = decode_children(&v)?;
                names.sort();
                names.dedup();
                Ok(names.into_iter().map(|n| format!("{dir}{n}/")).collect())
            }
            None => Ok(Vec::new()),
        }
    }
}

fn normalize_trailing_slash(dir: &str) -> String {
    if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{dir}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_guta() -> Guta {
        Guta {
            gid: 1,
            uid: 101,
            ft: crate::age::file_type::BAM,
            age: 0,
            count: 1,
            size: 5,
            atime: 80,
            mtime: 80,
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("dataset.db");

        let mut writer = DgutaWriter::create(&db_path).unwrap();
        writer.set_mount_path("/mnt/a/");
        writer.set_updated_at(1_000);
        writer
            .emit("/a/b/", &[sample_guta()], &["c".to_string()])
            .unwrap();
        writer.close().unwrap();

        let reader = DgutaReader::open(&db_path).unwrap();
        assert_eq!(reader.mount_path(), "/mnt/a/");
        assert_eq!(reader.modtime(), 1_000);

        let (dir_name, gutas) = reader.get_dguta("/a/b").unwrap();
        assert_eq!(dir_name, "/a/b/");
        assert_eq!(gutas, vec![sample_guta()]);

        let children = reader.get_children("/a/b").unwrap();
        assert_eq!(children, vec!["/a/b/c/".to_string()]);
    }

    #[test]
    fn missing_directory_is_dir_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("dataset.db");
        let mut writer = DgutaWriter::create(&db_path).unwrap();
        writer.set_mount_path("/mnt/a/");
        writer.close().unwrap();

        let reader = DgutaReader::open(&db_path).unwrap();
        let err = reader.get_dguta("/missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn missing_children_returns_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("dataset.db");
        let mut writer = DgutaWriter::create(&db_path).unwrap();
        writer.set_mount_path("/mnt/a/");
        writer.close().unwrap();

        let reader = DgutaReader::open(&db_path).unwrap();
        assert_eq!(reader.get_children("/a").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn creating_over_existing_path_is_db_exists() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("dataset.db");
        DgutaWriter::create(&db_path).unwrap().close().unwrap();
        let err = DgutaWriter::create(&db_path).unwrap_err();
        assert!(matches!(err, DgutaError::DbExists(_)));
    }

    #[test]
    fn opening_missing_path_is_db_not_exists() {
        let dir = tempfile::tempdir().unwrap();
        let err = DgutaReader::open(dir.path().join("nope.db")).unwrap_err();
        assert!(matches!(err, DgutaError::DbNotExists(_)));
    }

    #[test]
    fn batched_writes_flush_across_batch_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("dataset.db");
        let mut writer = DgutaWriter::create(&db_path).unwrap();
        writer.set_mount_path("/mnt/a/");
        writer.set_batch_size(2);
        writer.emit("/a/", &[sample_guta()], &[]).unwrap();
        writer.emit("/a/b/", &[sample_guta()], &[]).unwrap();
        writer.emit("/a/c/", &[sample_guta()], &[]).unwrap();
        writer.close().unwrap();

        let reader = DgutaReader::open(&db_path).unwrap();
        assert!(reader.get_dguta("/a").is_ok());
        assert!(reader.get_dguta("/a/b").is_ok());
        assert!(reader.get_dguta("/a/c").is_ok());
    }
}
