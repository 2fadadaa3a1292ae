//! Persistent `path -> (mtime, size)` store and its on-disk cache format
//! (spec §4.2, §6).

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::warn;

use crate::error::CacheError;

const MAGIC: &[u8; 4] = b"TKLC";
const VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub mtime_ns: i64,
    pub size: u64,
}

impl Stat {
    /// Stat a path directly from the filesystem.
    pub fn observe(path: &Path) -> io::Result<Stat> {
        let meta = std::fs::metadata(path)?;
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Ok(Stat {
            mtime_ns,
            size: meta.len(),
        })
    }
}

/// In-memory map from file path to last-observed stat, durable across runs.
#[derive(Debug, Clone, Default)]
pub struct FileStatStore {
    entries: HashMap<PathBuf, Stat>,
}

impl FileStatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<Stat> {
        self.entries.get(path).copied()
    }

    pub fn put(&mut self, path: PathBuf, stat: Stat) {
        self.entries.insert(path, stat);
    }

    pub fn forget(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &Stat)> {
        self.entries.iter()
    }

    /// Serialize the store to the framed binary format described in spec §6.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        for (path, stat) in &self.entries {
            let path_bytes = path_to_bytes(path);
            buf.extend_from_slice(&(path_bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(&path_bytes);
            buf.extend_from_slice(&stat.mtime_ns.to_le_bytes());
            buf.extend_from_slice(&stat.size.to_le_bytes());
        }
        buf
    }

    pub fn parse(bytes: &[u8]) -> Result<FileStatStore, CacheError> {
        if bytes.len() < 6 {
            return Err(CacheError::Truncated);
        }
        if &bytes[0..4] != MAGIC {
            return Err(CacheError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(CacheError::VersionMismatch { found: version });
        }
        let mut entries = HashMap::new();
        let mut cursor = 6usize;
        while cursor < bytes.len() {
            if cursor + 2 > bytes.len() {
                return Err(CacheError::Truncated);
            }
            let path_len = u16::from_le_bytes([bytes[cursor], bytes[cursor + 1]]) as usize;
            cursor += 2;
            if cursor + path_len + 8 + 8 > bytes.len() {
                return Err(CacheError::Truncated);
            }
            let path_bytes = &bytes[cursor..cursor + path_len];
            cursor += path_len;
            let path = bytes_to_path(path_bytes);
            let mtime_ns = i64::from_le_bytes(bytes[cursor..cursor + 8].try_into().unwrap());
            cursor += 8;
            let size = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into().unwrap());
            cursor += 8;
            entries.insert(path, Stat { mtime_ns, size });
        }
        Ok(FileStatStore { entries })
    }
}

#[cfg(unix)]
fn path_to_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_to_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().as_bytes().to_vec()
}

#[cfg(unix)]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Atomic load/store of the `FileStatStore` (spec §4.4 / "CachePersistor").
pub struct CachePersistor {
    cache_path: PathBuf,
}

impl CachePersistor {
    pub fn new(cache_path: PathBuf) -> Self {
        Self { cache_path }
    }

    /// Load the store, falling back to empty on any `CacheError`. Never
    /// fatal (spec §4.2, §7).
    pub fn load(&self) -> FileStatStore {
        match self.try_load() {
            Ok(store) => store,
            Err(CacheError::Io(e)) if e.kind() == io::ErrorKind::NotFound => FileStatStore::new(),
            Err(e) => {
                warn!(error = %e, cache = %self.cache_path.display(), "cache unreadable, starting with empty file-stat store");
                FileStatStore::new()
            }
        }
    }

    fn try_load(&self) -> Result<FileStatStore, CacheError> {
        let mut file = File::open(&self.cache_path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        FileStatStore::parse(&bytes)
    }

    /// Write-to-temp-then-rename for atomicity.
    pub fn store(&self, store: &FileStatStore) -> io::Result<()> {
        let dir = self
            .cache_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.cache_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "cache".to_string())
        ));
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&store.snapshot())?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.cache_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trips() {
        let mut store = FileStatStore::new();
        store.put(PathBuf::from("a.o"), Stat { mtime_ns: 1234, size: 99 });
        store.put(PathBuf::from("dir/b.o"), Stat { mtime_ns: 5, size: 0 });
        let bytes = store.snapshot();
        let loaded = FileStatStore::parse(&bytes).unwrap();
        assert_eq!(loaded.get(Path::new("a.o")), store.get(Path::new("a.o")));
        assert_eq!(loaded.len(), store.len());
    }

    #[test]
    fn bad_magic_is_cache_error() {
        let err = FileStatStore::parse(b"XXXX\x01\x00").unwrap_err();
        assert!(matches!(err, CacheError::BadMagic));
    }

    #[test]
    fn truncated_is_cache_error() {
        let err = FileStatStore::parse(b"TK").unwrap_err();
        assert!(matches!(err, CacheError::Truncated));
    }

    #[test]
    fn persistor_falls_back_to_empty_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let persistor = CachePersistor::new(dir.path().join("nonexistent-cache"));
        let store = persistor.load();
        assert!(store.is_empty());
    }

    #[test]
    fn persistor_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let persistor = CachePersistor::new(dir.path().join("cache"));
        let mut store = FileStatStore::new();
        store.put(PathBuf::from("out.txt"), Stat { mtime_ns: 42, size: 7 });
        persistor.store(&store).unwrap();
        let loaded = persistor.load();
        assert_eq!(loaded.get(Path::new("out.txt")), store.get(Path::new("out.txt")));
    }

    use proptest::prelude::*;

    prop_compose! {
        fn arb_stat()(mtime_ns in any::<i64>(), size in any::<u64>()) -> Stat {
            Stat { mtime_ns, size }
        }
    }

    prop_compose! {
        fn arb_entry()(
            name in "[a-zA-Z0-9_]{1,12}",
            nested in proptest::bool::ANY,
            stat in arb_stat(),
        ) -> (PathBuf, Stat) {
            let path = if nested { PathBuf::from("dir").join(name) } else { PathBuf::from(name) };
            (path, stat)
        }
    }

    proptest! {
        // Cache round-trip (spec §8): load(store(M)) == M for any FileStat map.
        #[test]
        fn cache_round_trip_is_lossless(entries in proptest::collection::vec(arb_entry(), 0..30)) {
            let mut expected: HashMap<PathBuf, Stat> = HashMap::new();
            let mut store = FileStatStore::new();
            for (path, stat) in entries {
                store.put(path.clone(), stat);
                expected.insert(path, stat);
            }
            let bytes = store.snapshot();
            let loaded = FileStatStore::parse(&bytes).unwrap();
            prop_assert_eq!(loaded.len(), expected.len());
            for (path, stat) in &expected {
                prop_assert_eq!(loaded.get(path), Some(*stat));
            }
        }
    }
}
