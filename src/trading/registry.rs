//! Account-wide set of symbols claimed by workers.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// Maps each claimed symbol to the id of the worker holding it.
///
/// Every mutation happens under one lock, so a claim is an atomic
/// check-and-insert: two workers racing for the same symbol cannot both win.
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    claims: Mutex<HashMap<String, String>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn claims(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `symbol` for `owner`. Returns `false` if another worker holds it.
    /// Re-claiming a symbol already owned by `owner` succeeds.
    pub fn claim(&self, symbol: &str, owner: &str) -> bool {
        let symbol = symbol.to_uppercase();
        let mut claims = self.claims();
        match claims.get(&symbol) {
            Some(current) if current != owner => false,
            _ => {
                claims.insert(symbol.clone(), owner.to_string());
                debug!(symbol = %symbol, owner = %owner, "Symbol claimed");
                true
            }
        }
    }

    /// Release `symbol` if `owner` holds it. Returns whether an entry was removed.
    pub fn release(&self, symbol: &str, owner: &str) -> bool {
        let symbol = symbol.to_uppercase();
        let mut claims = self.claims();
        if claims.get(&symbol).map(|o| o == owner).unwrap_or(false) {
            claims.remove(&symbol);
            debug!(symbol = %symbol, owner = %owner, "Symbol released");
            true
        } else {
            false
        }
    }

    /// Release every symbol held by `owner`, returning them sorted.
    pub fn release_owner(&self, owner: &str) -> Vec<String> {
        let mut claims = self.claims();
        let mut released: Vec<String> = claims
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(s, _)| s.clone())
            .collect();
        for symbol in &released {
            claims.remove(symbol);
        }
        released.sort();
        if !released.is_empty() {
            debug!(owner = %owner, symbols = ?released, "Owner claims released");
        }
        released
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.claims().contains_key(&symbol.to_uppercase())
    }

    pub fn owner_of(&self, symbol: &str) -> Option<String> {
        self.claims().get(&symbol.to_uppercase()).cloned()
    }

    /// All claimed symbols, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.claims().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.claims().len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims().is_empty()
    }
}
