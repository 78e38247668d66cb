//! In-memory fingerprint store with JSON and SQLite persistence.
//!
//! Records are appended once and never mutated. Loading merges into whatever
//! is already held; duplicates are skipped with a warning.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use rusqlite::{Connection, Transaction, params};
use serde::{Deserialize, Serialize};

use crate::error::{AlignError, Result};
use crate::hashing::Fingerprints;

/// One fingerprinted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub name: String,
    pub fingerprints: Fingerprints,
    pub content_hash: String,
}

/// On-disk formats, picked by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    Json,
    Sqlite,
}

impl StoreFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match ext.as_deref() {
            Some("json") => Ok(StoreFormat::Json),
            Some("db") | Some("sqlite") => Ok(StoreFormat::Sqlite),
            _ => Err(AlignError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    total_fingerprints: usize,
    file_names: Vec<String>,
    records: Vec<FingerprintRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct Store {
    records: Vec<FingerprintRecord>,
    by_name: HashMap<String, usize>,
    content_hashes: HashSet<String>,
    total_fingerprints: usize,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record unless its name or content hash is already present.
    pub fn append(&mut self, record: FingerprintRecord) -> Result<()> {
        if self.by_name.contains_key(&record.name)
            || self.content_hashes.contains(&record.content_hash)
        {
            return Err(AlignError::AlreadyFingerprinted { name: record.name });
        }
        self.total_fingerprints += record.fingerprints.hash_count();
        self.by_name.insert(record.name.clone(), self.records.len());
        self.content_hashes.insert(record.content_hash.clone());
        self.records.push(record);
        Ok(())
    }

    /// Drops a record by name, returning it.
    pub fn remove(&mut self, name: &str) -> Option<FingerprintRecord> {
        let index = self.by_name.remove(name)?;
        let record = self.records.remove(index);
        self.content_hashes.remove(&record.content_hash);
        self.total_fingerprints -= record.fingerprints.hash_count();
        for slot in self.by_name.values_mut() {
            if *slot > index {
                *slot -= 1;
            }
        }
        Some(record)
    }

    pub fn records(&self) -> &[FingerprintRecord] {
        &self.records
    }

    /// `(name, fingerprints)` pairs in insertion order, as the matcher wants them.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Fingerprints)> + '_ {
        self.records
            .iter()
            .map(|r| (r.name.as_str(), &r.fingerprints))
    }

    pub fn get(&self, name: &str) -> Option<&FingerprintRecord> {
        self.by_name.get(name).map(|&i| &self.records[i])
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn contains_hash(&self, content_hash: &str) -> bool {
        self.content_hashes.contains(content_hash)
    }

    pub fn file_names(&self) -> Vec<String> {
        self.records.iter().map(|r| r.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of every record's hash count.
    pub fn total_fingerprints(&self) -> usize {
        self.total_fingerprints
    }

    /// Merges records in, skipping duplicates. Returns how many were added.
    pub fn extend_records(
        &mut self,
        records: impl IntoIterator<Item = FingerprintRecord>,
    ) -> usize {
        let mut added = 0;
        for record in records {
            match self.append(record) {
                Ok(()) => added += 1,
                Err(e) => tracing::warn!("skipping stored record: {}", e),
            }
        }
        added
    }

    /// Writes the store to a sibling file first and renames it over `path`,
    /// so a failed save leaves the previous contents in place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let format = StoreFormat::from_path(path)?;
        let partial = partial_path(path);
        if partial.exists() {
            std::fs::remove_file(&partial)?;
        }
        let written = match format {
            StoreFormat::Json => self
                .to_json_bytes()
                .and_then(|bytes| std::fs::write(&partial, bytes).map_err(AlignError::from)),
            StoreFormat::Sqlite => self.write_sqlite(&partial),
        };
        if let Err(e) = written {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, path)?;
        tracing::info!(
            path = %path.display(),
            files = self.len(),
            fingerprints = self.total_fingerprints,
            "saved fingerprints"
        );
        Ok(())
    }

    /// Merges the records stored at `path` into this store.
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        let format = StoreFormat::from_path(path)?;
        let added = match format {
            StoreFormat::Json => {
                let bytes = std::fs::read(path)?;
                self.merge_json_bytes(&bytes)?
            }
            StoreFormat::Sqlite => self.load_sqlite(path)?,
        };
        tracing::info!(path = %path.display(), added, "loaded fingerprints");
        Ok(added)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        let file = StoreFile {
            total_fingerprints: self.total_fingerprints,
            file_names: self.file_names(),
            records: self.records.clone(),
        };
        Ok(serde_json::to_vec(&file)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        let mut store = Store::new();
        store.merge_json_bytes(bytes)?;
        Ok(store)
    }

    fn merge_json_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        let file: StoreFile = serde_json::from_slice(bytes)?;
        Ok(self.extend_records(file.records))
    }

    fn write_sqlite(&self, path: &Path) -> Result<()> {
        let mut conn = Connection::open(path)?;
        setup_schema(&conn)?;

        let tx = conn.transaction()?;
        for record in &self.records {
            insert_record(&tx, record)?;
        }
        tx.execute(
            "INSERT INTO metadata (key, value) VALUES ('total_fingerprints', ?1)",
            params![self.total_fingerprints as i64],
        )?;
        tx.execute(
            "INSERT INTO metadata (key, value) VALUES ('file_names', ?1)",
            params![serde_json::to_string(&self.file_names())?],
        )?;
        tx.commit()?;
        conn.close().map_err(|(_, e)| e)?;
        Ok(())
    }

    fn load_sqlite(&mut self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )
            .into());
        }
        let conn = Connection::open(path)?;

        let mut files_stmt =
            conn.prepare("SELECT file_id, name, content_hash FROM files ORDER BY file_id")?;
        let files = files_stmt
            .query_map([], |row| {
                Ok((
                    row.get::<usize, i64>(0)?,
                    row.get::<usize, String>(1)?,
                    row.get::<usize, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut hashes_stmt = conn.prepare_cached(
            "SELECT hash, frame FROM fingerprints WHERE file_id = ?1 ORDER BY rowid",
        )?;
        let mut records = Vec::with_capacity(files.len());
        for (file_id, name, content_hash) in files {
            let fingerprints = hashes_stmt
                .query_map(params![file_id], |row| {
                    Ok((row.get::<usize, i64>(0)? as u64, row.get::<usize, i64>(1)? as u32))
                })?
                .collect::<std::result::Result<Fingerprints, _>>()?;
            records.push(FingerprintRecord {
                name,
                fingerprints,
                content_hash,
            });
        }

        Ok(self.extend_records(records))
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn setup_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS files (
            file_id      INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL UNIQUE
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fingerprints (
            hash     INTEGER NOT NULL,
            frame    INTEGER NOT NULL,
            file_id  INTEGER NOT NULL,
            FOREIGN KEY (file_id) REFERENCES files (file_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_hash ON fingerprints (hash)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

fn insert_record(tx: &Transaction<'_>, record: &FingerprintRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO files (name, content_hash) VALUES (?1, ?2)",
        params![record.name, record.content_hash],
    )?;
    let file_id = tx.last_insert_rowid();

    let mut stmt =
        tx.prepare_cached("INSERT INTO fingerprints (hash, frame, file_id) VALUES (?1, ?2, ?3)")?;
    for (hash, frames) in record.fingerprints.iter() {
        for &frame in frames {
            stmt.execute(params![hash as i64, frame as i64, file_id])?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, hash: &str, entries: &[(u64, u32)]) -> FingerprintRecord {
        FingerprintRecord {
            name: name.to_string(),
            fingerprints: entries.iter().copied().collect(),
            content_hash: hash.to_string(),
        }
    }

    fn sample_store() -> Store {
        let mut store = Store::new();
        store
            .append(record("a.wav", "aaa", &[(1, 0), (1, 7), (u64::MAX, 3)]))
            .unwrap();
        store.append(record("b.wav", "bbb", &[(2, 4)])).unwrap();
        store
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut store = sample_store();
        let by_name = store.append(record("a.wav", "zzz", &[])).unwrap_err();
        assert!(matches!(by_name, AlignError::AlreadyFingerprinted { .. }));
        let by_hash = store.append(record("c.wav", "bbb", &[])).unwrap_err();
        assert!(matches!(by_hash, AlignError::AlreadyFingerprinted { .. }));
        assert_eq!(store.len(), 2);
        assert_eq!(store.total_fingerprints(), 4);
    }

    #[test]
    fn remove_keeps_index_consistent() {
        let mut store = sample_store();
        let removed = store.remove("a.wav").unwrap();
        assert_eq!(removed.name, "a.wav");
        assert!(!store.contains_hash("aaa"));
        assert_eq!(store.get("b.wav").unwrap().content_hash, "bbb");
        assert_eq!(store.total_fingerprints(), 1);
        assert!(store.remove("a.wav").is_none());
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prints.json");
        let store = sample_store();
        store.save(&path).unwrap();

        let mut loaded = Store::new();
        assert_eq!(loaded.load(&path).unwrap(), 2);
        assert_eq!(loaded.records(), store.records());
        assert_eq!(loaded.total_fingerprints(), store.total_fingerprints());
    }

    #[test]
    fn sqlite_round_trip_preserves_large_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prints.db");
        let store = sample_store();
        store.save(&path).unwrap();
        // saving twice overwrites rather than failing on unique names
        store.save(&path).unwrap();

        let mut loaded = Store::new();
        assert_eq!(loaded.load(&path).unwrap(), 2);
        assert_eq!(loaded.records(), store.records());
        assert_eq!(
            loaded.get("a.wav").unwrap().fingerprints.get(u64::MAX),
            Some(&[3][..])
        );
    }

    #[test]
    fn failed_save_keeps_the_previous_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prints.db");
        let store = sample_store();
        store.save(&path).unwrap();
        assert!(!partial_path(&path).exists());

        // a directory squatting on the scratch path makes the next save fail
        std::fs::create_dir(partial_path(&path)).unwrap();
        let mut bigger = sample_store();
        bigger.append(record("c.wav", "ccc", &[(5, 5)])).unwrap();
        assert!(bigger.save(&path).is_err());

        let mut loaded = Store::new();
        assert_eq!(loaded.load(&path).unwrap(), 2);
        assert_eq!(loaded.records(), store.records());

        std::fs::remove_dir(partial_path(&path)).unwrap();
        bigger.save(&path).unwrap();
        let mut loaded = Store::new();
        assert_eq!(loaded.load(&path).unwrap(), 3);
    }

    #[test]
    fn json_bytes_rebuild_an_equal_store() {
        let store = sample_store();
        let rebuilt = Store::from_json_bytes(&store.to_json_bytes().unwrap()).unwrap();
        assert_eq!(rebuilt.records(), store.records());
        assert_eq!(rebuilt.total_fingerprints(), store.total_fingerprints());
        assert!(rebuilt.contains_hash("bbb"));
        assert!(Store::from_json_bytes(b"{not json").is_err());
    }

    #[test]
    fn load_is_an_additive_union() {
        let blob = sample_store().to_json_bytes().unwrap();
        let mut store = Store::new();
        store.append(record("c.wav", "ccc", &[(9, 9)])).unwrap();
        store.append(record("a.wav", "aaa", &[(1, 0)])).unwrap();
        assert_eq!(store.merge_json_bytes(&blob).unwrap(), 1);
        assert_eq!(store.file_names(), vec!["c.wav", "a.wav", "b.wav"]);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let store = sample_store();
        let err = store.save(Path::new("prints.pickle")).unwrap_err();
        assert!(matches!(err, AlignError::UnsupportedFormat { .. }));
        let err = Store::new().load(Path::new("prints")).unwrap_err();
        assert!(matches!(err, AlignError::UnsupportedFormat { .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Store::new().load(&dir.path().join("absent.db")).unwrap_err();
        assert!(matches!(err, AlignError::Io(_)));
        let err = Store::new().load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, AlignError::Io(_)));
    }
}
