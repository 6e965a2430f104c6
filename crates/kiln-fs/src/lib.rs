//! Disk interface: `stat`/`read`/`write`/`mkdir -p`/`remove`, pluggable so
//! the scan and builder can run against an in-memory filesystem in tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Missing,
    Mtime(i64),
}

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("stat failed for {path}: {source}")]
    Stat {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("read failed for {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write failed for {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mkdir failed for {path}: {source}")]
    MakeDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("remove failed for {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveResult {
    Removed,
    DidNotExist,
}

/// Capability trait over the filesystem. Object-safe so the builder can hold
/// a `Box<dyn DiskInterface>` and swap in the in-memory fake for tests.
pub trait DiskInterface: Send {
    fn stat(&self, path: &Path) -> Result<Stat, DiskError>;
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, DiskError>;
    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), DiskError>;
    fn make_dir(&self, path: &Path) -> Result<(), DiskError>;
    /// Iteratively create `path` and all missing parents, tolerant of an
    /// already-existing directory at any level.
    fn make_dirs(&self, path: &Path) -> Result<(), DiskError>;
    fn remove_file(&self, path: &Path) -> Result<RemoveResult, DiskError>;
}

/// Real filesystem implementation, backed directly by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealDisk;

impl RealDisk {
    pub fn new() -> Self {
        Self
    }
}

fn mtime_of(meta: &std::fs::Metadata) -> i64 {
    use std::time::UNIX_EPOCH;
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl DiskInterface for RealDisk {
    fn stat(&self, path: &Path) -> Result<Stat, DiskError> {
        tracing::trace!(target: "fs", path = %path.display(), "stat");
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Stat::Mtime(mtime_of(&meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Stat::Missing),
            Err(e) => Err(DiskError::Stat {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, DiskError> {
        std::fs::read(path).map_err(|e| DiskError::Read {
            path: path.display().to_string(),
            source: e,
        })
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), DiskError> {
        std::fs::write(path, contents).map_err(|e| DiskError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    fn make_dir(&self, path: &Path) -> Result<(), DiskError> {
        match std::fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(DiskError::MakeDir {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    fn make_dirs(&self, path: &Path) -> Result<(), DiskError> {
        match std::fs::create_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(DiskError::MakeDir {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<RemoveResult, DiskError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(RemoveResult::Removed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RemoveResult::DidNotExist),
            Err(e) => Err(DiskError::Remove {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }
}

#[derive(Debug, Clone)]
enum Entry {
    File(Vec<u8>, i64),
    Dir,
}

/// In-memory filesystem used by scan/plan/builder unit tests. Time only
/// advances when `tick()` is called, so tests get deterministic mtimes
/// instead of racing the wall clock.
#[derive(Default)]
pub struct FakeDisk {
    inner: Mutex<FakeDiskState>,
}

#[derive(Default)]
struct FakeDiskState {
    entries: HashMap<PathBuf, Entry>,
    now: i64,
}

impl FakeDisk {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FakeDiskState {
                entries: HashMap::new(),
                now: 1,
            }),
        }
    }

    /// Advance the fake clock by one tick and return the new time. Every
    /// write made after a tick is stamped with the new clock value, which is
    /// what lets tests express "touch this file" as a single call.
    pub fn tick(&self) -> i64 {
        let mut st = self.inner.lock().unwrap();
        st.now += 1;
        st.now
    }

    pub fn now(&self) -> i64 {
        self.inner.lock().unwrap().now
    }

    /// Seed a file directly with an explicit mtime, bypassing the clock.
    pub fn seed_file(&self, path: &Path, contents: impl Into<Vec<u8>>, mtime: i64) {
        let mut st = self.inner.lock().unwrap();
        st.entries
            .insert(path.to_path_buf(), Entry::File(contents.into(), mtime));
    }

    pub fn touch(&self, path: &Path) {
        let mut st = self.inner.lock().unwrap();
        let now = st.now;
        match st.entries.get_mut(path) {
            Some(Entry::File(_, mtime)) => *mtime = now,
            _ => {
                st.entries.insert(path.to_path_buf(), Entry::File(Vec::new(), now));
            }
        }
    }
}

impl DiskInterface for FakeDisk {
    fn stat(&self, path: &Path) -> Result<Stat, DiskError> {
        let st = self.inner.lock().unwrap();
        match st.entries.get(path) {
            Some(Entry::File(_, mtime)) => Ok(Stat::Mtime(*mtime)),
            Some(Entry::Dir) => Ok(Stat::Mtime(0)),
            None => Ok(Stat::Missing),
        }
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, DiskError> {
        let st = self.inner.lock().unwrap();
        match st.entries.get(path) {
            Some(Entry::File(bytes, _)) => Ok(bytes.clone()),
            _ => Err(DiskError::Read {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            }),
        }
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), DiskError> {
        let mut st = self.inner.lock().unwrap();
        let now = st.now;
        st.entries
            .insert(path.to_path_buf(), Entry::File(contents.to_vec(), now));
        Ok(())
    }

    fn make_dir(&self, path: &Path) -> Result<(), DiskError> {
        let mut st = self.inner.lock().unwrap();
        st.entries.entry(path.to_path_buf()).or_insert(Entry::Dir);
        Ok(())
    }

    fn make_dirs(&self, path: &Path) -> Result<(), DiskError> {
        let mut st = self.inner.lock().unwrap();
        let mut acc = PathBuf::new();
        for comp in path.components() {
            acc.push(comp);
            st.entries.entry(acc.clone()).or_insert(Entry::Dir);
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<RemoveResult, DiskError> {
        let mut st = self.inner.lock().unwrap();
        match st.entries.remove(path) {
            Some(_) => Ok(RemoveResult::Removed),
            None => Ok(RemoveResult::DidNotExist),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_disk_reports_missing_by_default() {
        let disk = FakeDisk::new();
        assert_eq!(disk.stat(Path::new("a")).unwrap(), Stat::Missing);
    }

    #[test]
    fn fake_disk_write_then_stat() {
        let disk = FakeDisk::new();
        disk.write_file(Path::new("a"), b"hi").unwrap();
        assert_eq!(disk.stat(Path::new("a")).unwrap(), Stat::Mtime(1));
        disk.tick();
        disk.write_file(Path::new("b"), b"bye").unwrap();
        assert_eq!(disk.stat(Path::new("b")).unwrap(), Stat::Mtime(2));
    }

    #[test]
    fn fake_disk_touch_updates_mtime_without_changing_contents() {
        let disk = FakeDisk::new();
        disk.write_file(Path::new("a"), b"hi").unwrap();
        disk.tick();
        disk.touch(Path::new("a"));
        assert_eq!(disk.stat(Path::new("a")).unwrap(), Stat::Mtime(2));
        assert_eq!(disk.read_file(Path::new("a")).unwrap(), b"hi");
    }

    #[test]
    fn fake_disk_remove_reports_did_not_exist() {
        let disk = FakeDisk::new();
        assert_eq!(
            disk.remove_file(Path::new("nope")).unwrap(),
            RemoveResult::DidNotExist
        );
    }

    #[test]
    fn real_disk_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let disk = RealDisk::new();
        let file = dir.path().join("out.txt");
        disk.write_file(&file, b"hello").unwrap();
        assert!(matches!(disk.stat(&file).unwrap(), Stat::Mtime(_)));
        assert_eq!(disk.read_file(&file).unwrap(), b"hello");
        assert_eq!(disk.remove_file(&file).unwrap(), RemoveResult::Removed);
        assert_eq!(disk.stat(&file).unwrap(), Stat::Missing);
    }

    #[test]
    fn real_disk_make_dirs_is_eexist_tolerant() {
        let dir = tempfile::tempdir().unwrap();
        let disk = RealDisk::new();
        let nested = dir.path().join("a/b/c");
        disk.make_dirs(&nested).unwrap();
        disk.make_dirs(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
