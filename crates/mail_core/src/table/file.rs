//! Persistent file-backed table.
//!
//! The whole map is loaded at open and held in memory; every mutation
//! rewrites the backing file through a temporary file in the same directory
//! and renames it into place, so a worker killed mid-update never leaves a
//! partial record behind. Records are `key<TAB>value` lines sharing the
//! attribute codec's `%XX` escaping.
//!
//! Writable opens hold an exclusive advisory lock on a `<path>.lock`
//! sidecar for the handle's lifetime. The lock is acquired with a bounded
//! retry loop; a second writer gives up after the retry budget.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    thread,
    time::{Duration, SystemTime},
};

use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{AccessMode, Table, TableError, FLAG_FIXED, FLAG_FOLD_KEY, FLAG_LOCK, FLAG_SYNC_UPDATE};
use crate::attr::{escape, unescape};

const LOCK_ATTEMPTS: u32 = 5;
const LOCK_DELAY: Duration = Duration::from_millis(200);

pub struct FileTable {
    path: PathBuf,
    writable: bool,
    user_flags: u32,
    // Held for the handle lifetime; dropping releases the advisory lock.
    _lock: Option<File>,
    state: Mutex<FileState>,
}

struct FileState {
    entries: BTreeMap<String, String>,
    disk: Option<DiskState>,
}

/// Identity of the backing file as last read or written by this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DiskState {
    modified: SystemTime,
    len: u64,
}

impl FileTable {
    pub fn open(name: &str, mode: AccessMode, user_flags: u32) -> Result<Self, TableError> {
        let path = PathBuf::from(name);
        let writable = mode == AccessMode::ReadWriteCreate;
        let lock = writable.then(|| acquire_lock(&path)).transpose()?;

        let file = if writable {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
        } else {
            File::open(&path)
        }
        .map_err(|source| TableError::Open {
            path: path.clone(),
            source,
        })?;

        let entries = load_records(&path, file)?;
        let disk = disk_state(&path).ok();
        debug!(path = %path.display(), records = entries.len(), "loaded table file");
        Ok(Self {
            path,
            writable,
            user_flags,
            _lock: lock,
            state: Mutex::new(FileState { entries, disk }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fold<'a>(&self, key: &'a str) -> Cow<'a, str> {
        if self.user_flags & FLAG_FOLD_KEY != 0 {
            Cow::Owned(key.to_lowercase())
        } else {
            Cow::Borrowed(key)
        }
    }

    fn persist(&self, state: &mut FileState) -> Result<(), TableError> {
        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut out = io::BufWriter::new(tmp.as_file_mut());
            for (key, value) in &state.entries {
                writeln!(out, "{}\t{}", escape(key), escape(value))?;
            }
            out.flush()?;
        }
        if self.flags() & FLAG_SYNC_UPDATE != 0 {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(&self.path).map_err(|err| TableError::Io(err.error))?;
        state.disk = disk_state(&self.path).ok();
        Ok(())
    }
}

impl Table for FileTable {
    fn lookup(&self, key: &str) -> Result<Option<String>, TableError> {
        Ok(self.state().entries.get(self.fold(key).as_ref()).cloned())
    }

    fn update(&self, key: &str, value: &str) -> Result<(), TableError> {
        if !self.writable {
            return Err(TableError::ReadOnly {
                path: self.path.clone(),
            });
        }
        let mut state = self.state();
        state
            .entries
            .insert(self.fold(key).into_owned(), value.to_string());
        self.persist(&mut state)
    }

    fn delete(&self, key: &str) -> Result<bool, TableError> {
        if !self.writable {
            return Err(TableError::ReadOnly {
                path: self.path.clone(),
            });
        }
        let mut state = self.state();
        let existed = state.entries.remove(self.fold(key).as_ref()).is_some();
        if existed {
            self.persist(&mut state)?;
        }
        Ok(existed)
    }

    fn flags(&self) -> u32 {
        let base = if self.writable {
            FLAG_FIXED | FLAG_LOCK
        } else {
            FLAG_FIXED
        };
        base | self.user_flags
    }

    fn changed(&self) -> bool {
        let state = self.state();
        match disk_state(&self.path) {
            Ok(current) => state.disk != Some(current),
            // Someone removed or replaced the backing file.
            Err(_) => true,
        }
    }
}

fn load_records(path: &Path, file: File) -> Result<BTreeMap<String, String>, TableError> {
    let mut entries = BTreeMap::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let corrupt = || TableError::Corrupt {
            path: path.to_path_buf(),
            line: index + 1,
        };
        let (key, value) = line.split_once('\t').ok_or_else(corrupt)?;
        let key = unescape(key).map_err(|_| corrupt())?;
        let value = unescape(value).map_err(|_| corrupt())?;
        entries.insert(key, value);
    }
    Ok(entries)
}

fn disk_state(path: &Path) -> io::Result<DiskState> {
    let meta = std::fs::metadata(path)?;
    Ok(DiskState {
        modified: meta.modified()?,
        len: meta.len(),
    })
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn acquire_lock(path: &Path) -> Result<File, TableError> {
    let lock_path = lock_path_for(path);
    let lock = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|source| TableError::Open {
            path: lock_path.clone(),
            source,
        })?;
    let mut attempt = 0;
    loop {
        match lock.try_lock_exclusive() {
            Ok(()) => return Ok(lock),
            Err(source) => {
                attempt += 1;
                if attempt >= LOCK_ATTEMPTS {
                    return Err(TableError::Lock {
                        path: lock_path,
                        attempts: attempt,
                        source,
                    });
                }
                thread::sleep(LOCK_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::FLAG_DUP_REPLACE;

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify.db");
        let name = path.to_str().unwrap();

        let table = FileTable::open(name, AccessMode::ReadWriteCreate, FLAG_DUP_REPLACE).unwrap();
        table.update("alice@example.com", "0:0:100:ok").unwrap();
        table
            .update("odd\tkey", "value with\nnewline and % sign")
            .unwrap();
        drop(table);

        let table = FileTable::open(name, AccessMode::ReadOnly, 0).unwrap();
        assert_eq!(
            table.lookup("alice@example.com").unwrap().as_deref(),
            Some("0:0:100:ok")
        );
        assert_eq!(
            table.lookup("odd\tkey").unwrap().as_deref(),
            Some("value with\nnewline and % sign")
        );
        assert_eq!(table.lookup("missing").unwrap(), None);
    }

    #[test]
    fn delete_is_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify.db");
        let name = path.to_str().unwrap();

        let table = FileTable::open(name, AccessMode::ReadWriteCreate, 0).unwrap();
        table.update("bob", "1:0:100:nouser").unwrap();
        assert!(table.delete("bob").unwrap());
        assert!(!table.delete("bob").unwrap());
        drop(table);

        let table = FileTable::open(name, AccessMode::ReadOnly, 0).unwrap();
        assert_eq!(table.lookup("bob").unwrap(), None);
    }

    #[test]
    fn read_only_handles_refuse_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases.db");
        std::fs::write(&path, "root\tpostmaster\n").unwrap();

        let table = FileTable::open(path.to_str().unwrap(), AccessMode::ReadOnly, 0).unwrap();
        assert_eq!(table.lookup("root").unwrap().as_deref(), Some("postmaster"));
        assert!(matches!(
            table.update("root", "other"),
            Err(TableError::ReadOnly { .. })
        ));
        assert!(table.flags() & FLAG_LOCK == 0);
    }

    #[test]
    fn missing_file_fails_read_only_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.db");
        assert!(matches!(
            FileTable::open(path.to_str().unwrap(), AccessMode::ReadOnly, 0),
            Err(TableError::Open { .. })
        ));
    }

    #[test]
    fn corrupt_record_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.db");
        std::fs::write(&path, "no tab separator here\n").unwrap();
        assert!(matches!(
            FileTable::open(path.to_str().unwrap(), AccessMode::ReadOnly, 0),
            Err(TableError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn external_mutation_trips_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify.db");
        let name = path.to_str().unwrap();

        let table = FileTable::open(name, AccessMode::ReadWriteCreate, 0).unwrap();
        table.update("k", "v").unwrap();
        assert!(!table.changed(), "own writes must not look like changes");

        std::fs::write(&path, "k\texternally rewritten\n").unwrap();
        assert!(table.changed());
    }

    #[test]
    fn removed_backing_file_counts_as_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify.db");
        let table =
            FileTable::open(path.to_str().unwrap(), AccessMode::ReadWriteCreate, 0).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(table.changed());
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify.db");
        let name = path.to_str().unwrap();

        let _holder = FileTable::open(name, AccessMode::ReadWriteCreate, 0).unwrap();
        assert!(matches!(
            FileTable::open(name, AccessMode::ReadWriteCreate, 0),
            Err(TableError::Lock { .. })
        ));
    }

    #[test]
    fn folded_keys_match_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify.db");
        let table = FileTable::open(
            path.to_str().unwrap(),
            AccessMode::ReadWriteCreate,
            FLAG_FOLD_KEY,
        )
        .unwrap();
        table.update("Alice@Example.COM", "0:0:1:ok").unwrap();
        assert_eq!(
            table.lookup("alice@example.com").unwrap().as_deref(),
            Some("0:0:1:ok")
        );
    }
}
