//! Per-symbol exclusive locks for the position-entry critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

/// Lazily created lock per symbol. Entries live for the whole process; the
/// table grows with the number of distinct symbols ever traded.
#[derive(Debug, Default)]
pub struct SymbolLockTable {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SymbolLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `symbol`, created on first access.
    pub fn lock_for(&self, symbol: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(symbol.to_uppercase())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
