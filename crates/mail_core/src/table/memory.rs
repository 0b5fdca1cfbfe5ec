//! Volatile in-process table.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use super::{Table, TableError, FLAG_DUP_REPLACE, FLAG_FIXED};

/// In-memory map; contents are lost when the worker exits.
pub struct MemoryTable {
    label: String,
    user_flags: u32,
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryTable {
    pub fn new(label: impl Into<String>, user_flags: u32) -> Self {
        Self {
            label: label.into(),
            user_flags,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Table for MemoryTable {
    fn lookup(&self, key: &str) -> Result<Option<String>, TableError> {
        Ok(self.entries().get(key).cloned())
    }

    fn update(&self, key: &str, value: &str) -> Result<(), TableError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, TableError> {
        Ok(self.entries().remove(key).is_some())
    }

    fn flags(&self) -> u32 {
        FLAG_FIXED | FLAG_DUP_REPLACE | self.user_flags
    }
}
