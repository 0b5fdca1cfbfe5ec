//! Key/value table abstraction.
//!
//! A table is named by a `type:name` reference (`file:/var/lib/verify.db`,
//! `memory:verify`). Backends are opened once and shared for the worker's
//! lifetime; there is no close protocol. Within one worker the
//! [`TableRegistry`] deduplicates opens by `(reference, user_flags)`.

mod file;
mod memory;
mod registry;

pub use file::FileTable;
pub use memory::MemoryTable;
pub use registry::TableRegistry;

use std::{io, path::PathBuf, sync::Arc};

use thiserror::Error;

/// Keys are matched literally, not as patterns.
pub const FLAG_FIXED: u32 = 1 << 0;
/// The backend holds an exclusive lock on its backing file.
pub const FLAG_LOCK: u32 = 1 << 1;
/// Updates replace existing values silently.
pub const FLAG_DUP_REPLACE: u32 = 1 << 2;
/// Every update is synced to stable storage before it is acknowledged.
pub const FLAG_SYNC_UPDATE: u32 = 1 << 3;
/// Keys are folded to lowercase before lookup.
pub const FLAG_FOLD_KEY: u32 = 1 << 4;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table reference `{reference}` has no `type:` prefix")]
    BadReference { reference: String },
    #[error("unsupported table type `{kind}` in `{reference}`")]
    UnsupportedType { kind: String, reference: String },
    #[error("cannot open table file `{path}`: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot lock table file `{path}` after {attempts} attempts: {source}")]
    Lock {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("corrupt record at line {line} of `{path}`")]
    Corrupt { path: PathBuf, line: usize },
    #[error("table `{path}` is open read-only")]
    ReadOnly { path: PathBuf },
    #[error("table I/O failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    /// Open read-write, creating the backing store if it does not exist.
    ReadWriteCreate,
}

/// One open key/value backend.
///
/// Handles are shared across connections behind an [`Arc`]; mutating
/// methods take `&self` and serialize internally.
pub trait Table: Send + Sync {
    /// Looks up a key. `Ok(None)` is a clean miss; `Err` is a transient
    /// backend failure the caller may retry.
    fn lookup(&self, key: &str) -> Result<Option<String>, TableError>;

    fn update(&self, key: &str, value: &str) -> Result<(), TableError>;

    /// Removes a key; returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, TableError>;

    /// Backend trait bits combined with the user flags supplied at open.
    fn flags(&self) -> u32;

    /// Whether the backing store was mutated on disk by someone else since
    /// this handle last read or wrote it.
    fn changed(&self) -> bool {
        false
    }
}

/// Opens the backend named by `reference`.
///
/// The backend contract is that every approved, well-formed reference
/// opens; callers treat an error here as a worker-fatal condition, not a
/// per-request one.
pub fn open_table(
    reference: &str,
    mode: AccessMode,
    user_flags: u32,
) -> Result<Arc<dyn Table>, TableError> {
    let (kind, name) = reference
        .split_once(':')
        .ok_or_else(|| TableError::BadReference {
            reference: reference.to_string(),
        })?;
    match kind {
        "memory" => Ok(Arc::new(MemoryTable::new(name, user_flags))),
        "file" => Ok(Arc::new(FileTable::open(name, mode, user_flags)?)),
        _ => Err(TableError::UnsupportedType {
            kind: kind.to_string(),
            reference: reference.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_bad_references() {
        assert!(matches!(
            open_table("no-colon", AccessMode::ReadOnly, 0),
            Err(TableError::BadReference { .. })
        ));
        assert!(matches!(
            open_table("ldap:/etc/ldap.cf", AccessMode::ReadOnly, 0),
            Err(TableError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn open_memory_table() {
        let table = open_table("memory:test", AccessMode::ReadWriteCreate, 0).unwrap();
        table.update("a", "1").unwrap();
        assert_eq!(table.lookup("a").unwrap().as_deref(), Some("1"));
    }
}
