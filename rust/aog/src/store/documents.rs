//! Embedded read-only document store.
//!
//! Bundled catalogs (recommended models per service, supported model lists)
//! ship inside the binary and are served as-is. The store intentionally has
//! no durable write path: saving a table is a contract-level no-op so the
//! bundled data stays authoritative for the lifetime of the process.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::Result;

/// Bundled catalog data, compiled into the binary.
const BUNDLED_CATALOG: &str = include_str!("../../data/model_catalog.json");

/// Read-only document store over the bundled catalogs.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    tables: HashMap<String, Value>,
}

impl DocumentStore {
    /// Load the bundled catalogs.
    pub fn bundled() -> Self {
        let tables: HashMap<String, Value> =
            serde_json::from_str(BUNDLED_CATALOG).unwrap_or_default();
        Self { tables }
    }

    /// A table by name, if bundled.
    pub fn table(&self, name: &str) -> Option<&Value> {
        self.tables.get(name)
    }

    /// Recommended models for a service, if catalogued.
    pub fn recommended_models(&self, service: &str) -> Option<&Value> {
        self.table("recommended_models").and_then(|t| t.get(service))
    }

    /// Supported models for a service, if catalogued.
    pub fn support_models(&self, service: &str) -> Option<&Value> {
        self.table("support_models").and_then(|t| t.get(service))
    }

    /// Persist a table.
    ///
    /// The bundled catalogs are read-only at runtime; this accepts and
    /// discards the write so callers do not need to special-case the
    /// embedded store.
    pub fn save_table(&self, _name: &str, _value: &Value) -> Result<()> {
        Ok(())
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::bundled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_catalog_parses() {
        let docs = DocumentStore::bundled();
        assert!(docs.table("recommended_models").is_some());
        assert!(docs.table("support_models").is_some());
    }

    #[test]
    fn test_recommended_models_for_chat() {
        let docs = DocumentStore::bundled();
        let chat = docs.recommended_models("chat").unwrap();
        assert!(chat.as_array().is_some_and(|a| !a.is_empty()));
    }

    #[test]
    fn test_save_table_is_noop() {
        let docs = DocumentStore::bundled();
        docs.save_table("recommended_models", &serde_json::json!({"x": 1}))
            .unwrap();
        // The bundled table is untouched.
        assert!(docs.recommended_models("chat").is_some());
    }

    #[test]
    fn test_unknown_table() {
        let docs = DocumentStore::bundled();
        assert!(docs.table("no_such_table").is_none());
        assert!(docs.support_models("telepathy").is_none());
    }
}
