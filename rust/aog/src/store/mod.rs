//! Persistent store.
//!
//! A small embedded relational store (rusqlite) holds the service, provider,
//! and model tables; migrations run on open. The store is single-writer,
//! many-reader: one connection guarded by a mutex, which is plenty for
//! admin-rate writes and dispatch-rate point reads.
//!
//! [`documents`] is the separate read-only document store for bundled
//! catalogs.

pub mod documents;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};

use crate::domain::{
    HybridPolicy, ModelRecord, ModelStatus, ProviderScope, ServiceProviderRecord, ServiceRecord,
    ServiceSource,
};
use crate::error::{GatewayError, Result};

/// Embedded relational store for services, providers, and models.
#[derive(Clone)]
pub struct Datastore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore").finish_non_exhaustive()
    }
}

/// Schema version applied by [`migrate`].
const SCHEMA_VERSION: i64 = 1;

impl Datastore {
    /// Open (or create) the store at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- services ----

    /// Insert or replace a service row.
    pub fn upsert_service(&self, rec: &ServiceRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO service (name, hybrid_policy, remote_provider, local_provider, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
               hybrid_policy = excluded.hybrid_policy,
               remote_provider = excluded.remote_provider,
               local_provider = excluded.local_provider,
               status = excluded.status,
               updated_at = excluded.updated_at",
            params![
                rec.name,
                policy_str(rec.hybrid_policy),
                rec.remote_provider,
                rec.local_provider,
                rec.status,
                rec.created_at.to_rfc3339(),
                rec.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load a service row by name.
    pub fn get_service(&self, name: &str) -> Result<Option<ServiceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, hybrid_policy, remote_provider, local_provider, status, created_at, updated_at
             FROM service WHERE name = ?1",
        )?;
        let mut rows = stmt.query_map(params![name], service_from_row)?;
        rows.next().transpose().map_err(GatewayError::from)
    }

    /// All service rows.
    pub fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, hybrid_policy, remote_provider, local_provider, status, created_at, updated_at
             FROM service ORDER BY name",
        )?;
        let rows = stmt.query_map([], service_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(GatewayError::from)
    }

    // ---- service providers ----

    /// Insert or replace a provider row, keyed by provider name.
    pub fn upsert_provider(&self, rec: &ServiceProviderRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO service_provider
               (provider_name, service_name, service_source, flavor, auth_type, auth_key, url, scope, properties, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(provider_name) DO UPDATE SET
               service_name = excluded.service_name,
               service_source = excluded.service_source,
               flavor = excluded.flavor,
               auth_type = excluded.auth_type,
               auth_key = excluded.auth_key,
               url = excluded.url,
               scope = excluded.scope,
               properties = excluded.properties,
               status = excluded.status,
               updated_at = excluded.updated_at",
            params![
                rec.provider_name,
                rec.service_name,
                rec.service_source.as_str(),
                rec.flavor,
                rec.auth_type,
                rec.auth_key,
                rec.url,
                rec.scope.as_str(),
                rec.properties,
                rec.status,
                rec.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load a provider row by name.
    pub fn get_provider(&self, provider_name: &str) -> Result<Option<ServiceProviderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT provider_name, service_name, service_source, flavor, auth_type, auth_key, url, scope, properties, status, updated_at
             FROM service_provider WHERE provider_name = ?1",
        )?;
        let mut rows = stmt.query_map(params![provider_name], provider_from_row)?;
        rows.next().transpose().map_err(GatewayError::from)
    }

    /// Provider rows, optionally filtered by service.
    pub fn list_providers(&self, service: Option<&str>) -> Result<Vec<ServiceProviderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT provider_name, service_name, service_source, flavor, auth_type, auth_key, url, scope, properties, status, updated_at
             FROM service_provider
             WHERE (?1 IS NULL OR service_name = ?1)
             ORDER BY provider_name",
        )?;
        let rows = stmt.query_map(params![service], provider_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(GatewayError::from)
    }

    /// Delete a provider row. Returns whether a row existed.
    pub fn delete_provider(&self, provider_name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM service_provider WHERE provider_name = ?1",
            params![provider_name],
        )?;
        Ok(n > 0)
    }

    // ---- models ----

    /// Insert or replace a model row, keyed by (model, provider).
    pub fn upsert_model(&self, rec: &ModelRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO model
               (model_name, provider_name, service_name, service_source, status, is_default, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(model_name, provider_name) DO UPDATE SET
               service_name = excluded.service_name,
               service_source = excluded.service_source,
               status = excluded.status,
               is_default = excluded.is_default,
               updated_at = excluded.updated_at",
            params![
                rec.model_name,
                rec.provider_name,
                rec.service_name,
                rec.service_source.as_str(),
                rec.status.as_str(),
                rec.is_default,
                rec.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load a model row by name, newest first when several providers carry it.
    pub fn get_model(&self, model_name: &str) -> Result<Option<ModelRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT model_name, provider_name, service_name, service_source, status, is_default, updated_at
             FROM model WHERE model_name = ?1 ORDER BY updated_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![model_name], model_from_row)?;
        rows.next().transpose().map_err(GatewayError::from)
    }

    /// Model rows, optionally filtered by service and status, newest first.
    pub fn list_models(
        &self,
        service: Option<&str>,
        status: Option<ModelStatus>,
    ) -> Result<Vec<ModelRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT model_name, provider_name, service_name, service_source, status, is_default, updated_at
             FROM model
             WHERE (?1 IS NULL OR service_name = ?1)
               AND (?2 IS NULL OR status = ?2)
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![service, status.map(ModelStatus::as_str)], model_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(GatewayError::from)
    }

    /// The default model for a service at a source: an `is_default` downloaded
    /// row if one exists, otherwise the newest downloaded row.
    pub fn default_model(
        &self,
        service: &str,
        source: ServiceSource,
    ) -> Result<Option<ModelRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT model_name, provider_name, service_name, service_source, status, is_default, updated_at
             FROM model
             WHERE service_name = ?1 AND service_source = ?2 AND status = 'downloaded'
             ORDER BY is_default DESC, updated_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![service, source.as_str()], model_from_row)?;
        rows.next().transpose().map_err(GatewayError::from)
    }

    /// Update a model row's status. Returns whether a row existed.
    pub fn set_model_status(
        &self,
        model_name: &str,
        provider_name: &str,
        status: ModelStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE model SET status = ?3, updated_at = ?4
             WHERE model_name = ?1 AND provider_name = ?2",
            params![model_name, provider_name, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(n > 0)
    }

    /// Delete a model row. Returns whether a row existed.
    pub fn delete_model(&self, model_name: &str, provider_name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM model WHERE model_name = ?1 AND provider_name = ?2",
            params![model_name, provider_name],
        )?;
        Ok(n > 0)
    }
}

/// Apply schema migrations based on `PRAGMA user_version`.
fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch(
        "BEGIN;
         CREATE TABLE IF NOT EXISTS service (
             name            TEXT PRIMARY KEY,
             hybrid_policy   TEXT NOT NULL DEFAULT 'default',
             remote_provider TEXT,
             local_provider  TEXT,
             status          INTEGER NOT NULL DEFAULT 1,
             created_at      TEXT NOT NULL,
             updated_at      TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS service_provider (
             provider_name  TEXT PRIMARY KEY,
             service_name   TEXT NOT NULL,
             service_source TEXT NOT NULL,
             flavor         TEXT NOT NULL DEFAULT '',
             auth_type      TEXT NOT NULL DEFAULT 'none',
             auth_key       TEXT NOT NULL DEFAULT '',
             url            TEXT NOT NULL DEFAULT '',
             scope          TEXT NOT NULL DEFAULT 'builtin',
             properties     TEXT NOT NULL DEFAULT '{}',
             status         INTEGER NOT NULL DEFAULT 1,
             updated_at     TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS model (
             model_name     TEXT NOT NULL,
             provider_name  TEXT NOT NULL,
             service_name   TEXT NOT NULL,
             service_source TEXT NOT NULL,
             status         TEXT NOT NULL DEFAULT 'downloading',
             is_default     INTEGER NOT NULL DEFAULT 0,
             updated_at     TEXT NOT NULL,
             PRIMARY KEY (model_name, provider_name)
         );
         CREATE INDEX IF NOT EXISTS idx_model_service ON model (service_name, status);
         COMMIT;",
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

fn policy_str(policy: HybridPolicy) -> &'static str {
    match policy {
        HybridPolicy::Default => "default",
        HybridPolicy::AlwaysLocal => "always_local",
        HybridPolicy::AlwaysRemote => "always_remote",
    }
}

fn policy_parse(value: &str) -> HybridPolicy {
    match value {
        "always_local" => HybridPolicy::AlwaysLocal,
        "always_remote" => HybridPolicy::AlwaysRemote,
        _ => HybridPolicy::Default,
    }
}

fn parse_time(value: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn service_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceRecord> {
    Ok(ServiceRecord {
        name: row.get(0)?,
        hybrid_policy: policy_parse(&row.get::<_, String>(1)?),
        remote_provider: row.get(2)?,
        local_provider: row.get(3)?,
        status: row.get(4)?,
        created_at: parse_time(row.get(5)?),
        updated_at: parse_time(row.get(6)?),
    })
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceProviderRecord> {
    let source: String = row.get(2)?;
    let scope: String = row.get(7)?;
    Ok(ServiceProviderRecord {
        provider_name: row.get(0)?,
        service_name: row.get(1)?,
        service_source: ServiceSource::parse(&source).unwrap_or(ServiceSource::Local),
        flavor: row.get(3)?,
        auth_type: row.get(4)?,
        auth_key: row.get(5)?,
        url: row.get(6)?,
        scope: ProviderScope::parse(&scope).unwrap_or(ProviderScope::Builtin),
        properties: row.get(8)?,
        status: row.get(9)?,
        updated_at: parse_time(row.get(10)?),
    })
}

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<ModelRecord> {
    let source: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(ModelRecord {
        model_name: row.get(0)?,
        provider_name: row.get(1)?,
        service_name: row.get(2)?,
        service_source: ServiceSource::parse(&source).unwrap_or(ServiceSource::Local),
        status: ModelStatus::parse(&status).unwrap_or(ModelStatus::Failed),
        is_default: row.get(5)?,
        updated_at: parse_time(row.get(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> Datastore {
        Datastore::open_in_memory().unwrap()
    }

    #[test]
    fn test_service_round_trip() {
        let ds = store();
        let mut rec = ServiceRecord::new("chat");
        rec.hybrid_policy = HybridPolicy::AlwaysLocal;
        rec.local_provider = Some("local_ollama".to_string());
        ds.upsert_service(&rec).unwrap();

        let loaded = ds.get_service("chat").unwrap().unwrap();
        assert_eq!(loaded.hybrid_policy, HybridPolicy::AlwaysLocal);
        assert_eq!(loaded.local_provider.as_deref(), Some("local_ollama"));
        assert!(ds.get_service("nope").unwrap().is_none());
    }

    #[test]
    fn test_provider_upsert_replaces() {
        let ds = store();
        let rec = ServiceProviderRecord::new("local_ollama", "chat", ServiceSource::Local)
            .with_flavor("ollama")
            .with_url("http://127.0.0.1:11434");
        ds.upsert_provider(&rec).unwrap();

        let updated = ServiceProviderRecord::new("local_ollama", "chat", ServiceSource::Local)
            .with_flavor("openai");
        ds.upsert_provider(&updated).unwrap();

        let loaded = ds.get_provider("local_ollama").unwrap().unwrap();
        assert_eq!(loaded.flavor, "openai");
        assert_eq!(ds.list_providers(Some("chat")).unwrap().len(), 1);
        assert!(ds.delete_provider("local_ollama").unwrap());
        assert!(!ds.delete_provider("local_ollama").unwrap());
    }

    #[test]
    fn test_model_listing_orders_newest_first() {
        let ds = store();
        let mut old = ModelRecord::downloaded("m-old", "p", "chat", ServiceSource::Local);
        old.updated_at = Utc::now() - Duration::minutes(10);
        let new = ModelRecord::downloaded("m-new", "p", "chat", ServiceSource::Local);
        ds.upsert_model(&old).unwrap();
        ds.upsert_model(&new).unwrap();

        let models = ds.list_models(Some("chat"), Some(ModelStatus::Downloaded)).unwrap();
        assert_eq!(models[0].model_name, "m-new");
        assert_eq!(models[1].model_name, "m-old");
    }

    #[test]
    fn test_default_model_prefers_is_default() {
        let ds = store();
        let newest = ModelRecord::downloaded("m-new", "p", "chat", ServiceSource::Local);
        let mut marked = ModelRecord::downloaded("m-default", "p", "chat", ServiceSource::Local);
        marked.is_default = true;
        marked.updated_at = Utc::now() - Duration::hours(1);
        ds.upsert_model(&newest).unwrap();
        ds.upsert_model(&marked).unwrap();

        let chosen = ds.default_model("chat", ServiceSource::Local).unwrap().unwrap();
        assert_eq!(chosen.model_name, "m-default");
    }

    #[test]
    fn test_dispatch_ignores_non_downloaded() {
        let ds = store();
        let mut rec = ModelRecord::downloaded("m1", "p", "chat", ServiceSource::Local);
        rec.status = ModelStatus::Downloading;
        ds.upsert_model(&rec).unwrap();

        assert!(ds
            .list_models(Some("chat"), Some(ModelStatus::Downloaded))
            .unwrap()
            .is_empty());
        assert!(ds.default_model("chat", ServiceSource::Local).unwrap().is_none());
    }

    #[test]
    fn test_set_model_status() {
        let ds = store();
        let mut rec = ModelRecord::downloaded("m1", "p", "chat", ServiceSource::Local);
        rec.status = ModelStatus::Downloading;
        ds.upsert_model(&rec).unwrap();

        assert!(ds.set_model_status("m1", "p", ModelStatus::Downloaded).unwrap());
        assert_eq!(
            ds.get_model("m1").unwrap().unwrap().status,
            ModelStatus::Downloaded
        );
        assert!(!ds.set_model_status("ghost", "p", ModelStatus::Failed).unwrap());
    }
}
