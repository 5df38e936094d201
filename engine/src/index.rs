//! Persistent hash index.
//!
//! One SQLite file per target directory maps a canonical target path to the
//! size, modification time and content hash last seen for it. It is purely a
//! cache: losing writes only costs a re-hash, so commits are batched.

use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::checksums::{ChecksumAlgorithm, ChecksumValue};
use crate::error::EngineError;

/// File name of the index inside the target directory.
pub const INDEX_FILE_NAME: &str = ".backsort_index.sqlite";

/// Writes buffered before a commit.
const FLUSH_EVERY: usize = 200;

/// True for the index file and the journal/WAL siblings SQLite creates next to it.
pub fn is_index_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with(INDEX_FILE_NAME))
        .unwrap_or(false)
}

/// One cached entry.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: f64,
    pub hash: ChecksumValue,
}

impl IndexRecord {
    /// The cached hash is reusable when size and mtime still match.
    pub fn matches(&self, size: u64, mtime: f64) -> bool {
        self.size == size && self.mtime == mtime
    }
}

pub struct HashIndex {
    conn: Connection,
    read_only: bool,
    in_tx: bool,
    pending: usize,
}

impl HashIndex {
    /// Open (creating if needed) the index at `path`.
    ///
    /// A corrupt file is removed together with its siblings and recreated
    /// once; any other failure is returned as `IndexUnavailable`.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        match Self::open_rw(path) {
            Ok(index) => Ok(index),
            Err(e) if is_corruption(&e) => {
                warn!("Hash index at {} is corrupt, rebuilding: {}", path.display(), e);
                remove_index_files(path);
                Self::open_rw(path).map_err(|source| EngineError::IndexUnavailable {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Err(source) => Err(EngineError::IndexUnavailable {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Open without ever writing: an existing index is opened read-only, a
    /// missing one is replaced by an empty in-memory cache. Used by dry runs.
    pub fn open_read_only(path: &Path) -> Result<Self, EngineError> {
        let opened = if path.exists() {
            Connection::open_with_flags(
                immutable_uri(path),
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
            )
            .and_then(|conn| {
                // Probe the schema; an unusable file falls back to an empty cache.
                conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get::<_, i64>(0))
                    .map(|_| conn)
            })
            .or_else(|e| {
                debug!("Read-only index unusable ({}), using empty cache", e);
                Self::memory_connection()
            })
        } else {
            Self::memory_connection()
        };

        let conn = opened.map_err(|source| EngineError::IndexUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(HashIndex {
            conn,
            read_only: true,
            in_tx: false,
            pending: 0,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Self::memory_connection()?;
        Ok(HashIndex {
            conn,
            read_only: false,
            in_tx: false,
            pending: 0,
        })
    }

    fn memory_connection() -> rusqlite::Result<Connection> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(conn)
    }

    fn open_rw(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )?;
        create_schema(&conn)?;
        debug!("Hash index opened at {}", path.display());
        Ok(HashIndex {
            conn,
            read_only: false,
            in_tx: false,
            pending: 0,
        })
    }

    /// Point lookup.
    pub fn get(&self, path: &Path) -> Result<Option<IndexRecord>, EngineError> {
        let key = path.to_string_lossy();
        let row = self
            .conn
            .query_row(
                "SELECT size, mtime, algo, hash FROM files WHERE path = ?1",
                params![key.as_ref()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.and_then(|(size, mtime, algo, hash)| {
            let algorithm = ChecksumAlgorithm::from_name(&algo)?;
            Some(IndexRecord {
                path: path.to_path_buf(),
                size: size as u64,
                mtime,
                hash: ChecksumValue::new(algorithm, hash),
            })
        }))
    }

    /// Insert or replace the record for `path`. Commits every `FLUSH_EVERY` writes.
    pub fn put(&mut self, path: &Path, size: u64, mtime: f64, hash: &ChecksumValue) -> Result<(), EngineError> {
        if self.read_only {
            return Ok(());
        }
        self.begin()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO files (path, size, mtime, algo, hash) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                path.to_string_lossy().as_ref(),
                size as i64,
                mtime,
                hash.algorithm().as_str(),
                hash.hex()
            ],
        )?;
        self.pending += 1;
        if self.pending >= FLUSH_EVERY {
            self.flush()?;
        }
        Ok(())
    }

    /// Drop the record for `path`, if any.
    pub fn remove(&mut self, path: &Path) -> Result<(), EngineError> {
        if self.read_only {
            return Ok(());
        }
        self.begin()?;
        self.conn.execute(
            "DELETE FROM files WHERE path = ?1",
            params![path.to_string_lossy().as_ref()],
        )?;
        self.pending += 1;
        Ok(())
    }

    /// Delete every record whose path is not in `existing`. Returns the number removed.
    pub fn reconcile(&mut self, existing: &HashSet<PathBuf>) -> Result<usize, EngineError> {
        if self.read_only {
            return Ok(0);
        }
        let keep: HashSet<String> = existing
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();

        let stale: Vec<String> = {
            let mut stmt = self.conn.prepare("SELECT path FROM files")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut stale = Vec::new();
            for row in rows {
                let path = row?;
                if !keep.contains(&path) {
                    stale.push(path);
                }
            }
            stale
        };

        if stale.is_empty() {
            return Ok(0);
        }

        self.begin()?;
        {
            let mut stmt = self.conn.prepare("DELETE FROM files WHERE path = ?1")?;
            for path in &stale {
                stmt.execute(params![path])?;
            }
        }
        self.flush()?;
        debug!("Reconciled hash index, removed {} stale records", stale.len());
        Ok(stale.len())
    }

    /// Number of records.
    pub fn len(&self) -> Result<usize, EngineError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, EngineError> {
        Ok(self.len()? == 0)
    }

    /// Commit buffered writes.
    pub fn flush(&mut self) -> Result<(), EngineError> {
        if self.in_tx {
            self.conn.execute_batch("COMMIT")?;
            self.in_tx = false;
        }
        self.pending = 0;
        Ok(())
    }

    /// Flush and close.
    pub fn close(mut self) -> Result<(), EngineError> {
        self.flush()
    }

    fn begin(&mut self) -> Result<(), EngineError> {
        if !self.in_tx {
            self.conn.execute_batch("BEGIN")?;
            self.in_tx = true;
        }
        Ok(())
    }
}

impl Drop for HashIndex {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush hash index on close: {}", e);
        }
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS files (
            path  TEXT PRIMARY KEY,
            size  INTEGER NOT NULL,
            mtime REAL NOT NULL,
            algo  TEXT NOT NULL,
            hash  TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_files_hash ON files(hash);",
    )
}

/// `file:` URI with `immutable=1`, so SQLite creates no WAL/SHM siblings.
fn immutable_uri(path: &Path) -> String {
    let mut raw = path.to_string_lossy().replace('\\', "/");
    if !raw.starts_with('/') {
        raw.insert(0, '/');
    }
    let escaped = raw.replace('%', "%25").replace('?', "%3f").replace('#', "%23");
    format!("file://{}?immutable=1", escaped)
}

fn is_corruption(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::NotADatabase || e.code == ErrorCode::DatabaseCorrupt
    )
}

fn remove_index_files(path: &Path) {
    let _ = fs::remove_file(path);
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut sibling = path.as_os_str().to_owned();
        sibling.push(suffix);
        let _ = fs::remove_file(PathBuf::from(sibling));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::checksum_bytes;

    fn sample_hash(data: &[u8]) -> ChecksumValue {
        checksum_bytes(data, ChecksumAlgorithm::Sha256)
    }

    #[test]
    fn test_put_get_survives_reopen() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join(INDEX_FILE_NAME);
        let file = temp_dir.path().join("a.txt");
        let hash = sample_hash(b"a");

        let mut index = HashIndex::open(&db_path).expect("Failed to open index");
        index.put(&file, 10, 1234.5, &hash).expect("Failed to put");
        index.close().expect("Failed to close");

        let index = HashIndex::open(&db_path).expect("Failed to reopen index");
        let record = index.get(&file).expect("Failed to get").expect("record missing");
        assert_eq!(record.size, 10);
        assert_eq!(record.mtime, 1234.5);
        assert_eq!(record.hash, hash);
        assert!(record.matches(10, 1234.5));
        assert!(!record.matches(11, 1234.5));
    }

    #[test]
    fn test_put_is_upsert() {
        let mut index = HashIndex::open_in_memory().expect("Failed to open index");
        let file = PathBuf::from("/t/a.txt");
        index.put(&file, 1, 1.0, &sample_hash(b"1")).expect("Failed to put");
        index.put(&file, 2, 2.0, &sample_hash(b"2")).expect("Failed to put");

        assert_eq!(index.len().expect("Failed to count"), 1);
        let record = index.get(&file).expect("Failed to get").expect("record missing");
        assert_eq!(record.size, 2);
    }

    #[test]
    fn test_reconcile_removes_missing_paths() {
        let mut index = HashIndex::open_in_memory().expect("Failed to open index");
        let keep = PathBuf::from("/t/keep.txt");
        let gone = PathBuf::from("/t/gone.txt");
        index.put(&keep, 1, 1.0, &sample_hash(b"k")).expect("Failed to put");
        index.put(&gone, 1, 1.0, &sample_hash(b"g")).expect("Failed to put");

        let existing: HashSet<PathBuf> = [keep.clone()].into_iter().collect();
        let removed = index.reconcile(&existing).expect("Failed to reconcile");

        assert_eq!(removed, 1);
        assert!(index.get(&keep).expect("Failed to get").is_some());
        assert!(index.get(&gone).expect("Failed to get").is_none());
    }

    #[test]
    fn test_batched_writes_commit_across_flush_boundary() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join(INDEX_FILE_NAME);
        let mut index = HashIndex::open(&db_path).expect("Failed to open index");
        for i in 0..(FLUSH_EVERY + 5) {
            let path = temp_dir.path().join(format!("f{}.bin", i));
            index.put(&path, i as u64, 0.0, &sample_hash(b"x")).expect("Failed to put");
        }
        drop(index);

        let index = HashIndex::open(&db_path).expect("Failed to reopen index");
        assert_eq!(index.len().expect("Failed to count"), FLUSH_EVERY + 5);
    }

    #[test]
    fn test_corrupt_index_is_rebuilt() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join(INDEX_FILE_NAME);
        fs::write(&db_path, vec![0x42u8; 8192]).expect("Failed to write garbage");

        let index = HashIndex::open(&db_path).expect("corrupt index should be rebuilt");
        assert!(index.is_empty().expect("Failed to count"));
    }

    #[test]
    fn test_read_only_never_creates_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join(INDEX_FILE_NAME);

        let mut index = HashIndex::open_read_only(&db_path).expect("Failed to open read-only");
        index
            .put(&temp_dir.path().join("a"), 1, 1.0, &sample_hash(b"a"))
            .expect("put on read-only is a no-op");
        drop(index);

        assert!(!db_path.exists());
    }

    #[test]
    fn test_is_index_file() {
        assert!(is_index_file(Path::new("/t/.backsort_index.sqlite")));
        assert!(is_index_file(Path::new("/t/.backsort_index.sqlite-wal")));
        assert!(!is_index_file(Path::new("/t/photo.jpg")));
    }
}
