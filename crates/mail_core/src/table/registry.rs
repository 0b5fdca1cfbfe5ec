//! Per-worker registry of open table handles.

use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use super::{open_table, AccessMode, Table, TableError};

/// Deduplicates table opens within one worker.
///
/// The key is the canonical reference plus the caller-supplied user flags:
/// one backend handle per distinct combination, for the worker's lifetime.
/// The registry is insert-only; there is no close protocol.
#[derive(Default)]
pub struct TableRegistry {
    tables: HashMap<(String, u32), Arc<dyn Table>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the already-open handle for `(reference, user_flags)`, or
    /// opens the backend and registers it.
    pub fn open_shared(
        &mut self,
        reference: &str,
        mode: AccessMode,
        user_flags: u32,
    ) -> Result<Arc<dyn Table>, TableError> {
        if let Some(table) = self.tables.get(&(reference.to_string(), user_flags)) {
            return Ok(table.clone());
        }
        let table = open_table(reference, mode, user_flags)?;
        debug!(table = %registry_label(reference, user_flags), "opened table");
        self.insert(reference, user_flags, table.clone());
        Ok(table)
    }

    /// Registers an already-open handle under `(reference, user_flags)`.
    pub fn insert(&mut self, reference: &str, user_flags: u32, table: Arc<dyn Table>) {
        self.tables
            .insert((reference.to_string(), user_flags), table);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Label of the first registered table whose backing store changed on
    /// disk since it was opened, if any.
    pub fn changed(&self) -> Option<String> {
        self.tables
            .iter()
            .find(|(_, table)| table.changed())
            .map(|((reference, flags), _)| registry_label(reference, *flags))
    }
}

/// The legacy `type:name:OCTAL_FLAGS` rendering, kept for log messages.
fn registry_label(reference: &str, flags: u32) -> String {
    format!("{reference}:{flags:o}")
}
