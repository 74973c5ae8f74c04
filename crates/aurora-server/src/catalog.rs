//! Catalog backends the REST routes delegate to

use crate::types::{CreateTableRequest, TableIdentifier, TableMetadata};
use aurora_core::ConfigError;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Table does not exist: {0}")]
    NoSuchTable(TableIdentifier),

    #[error("Table already exists: {0}")]
    AlreadyExists(TableIdentifier),

    #[error("{0}")]
    BadRequest(String),
}

/// Table-metadata operations served by the REST routes.
pub trait CatalogBackend: Send + Sync {
    fn name(&self) -> &str;

    fn list_tables(&self, namespace: &[String]) -> Result<Vec<TableIdentifier>, CatalogError>;

    fn create_table(
        &self,
        namespace: &[String],
        request: CreateTableRequest,
    ) -> Result<(TableIdentifier, TableMetadata), CatalogError>;

    fn load_table(&self, id: &TableIdentifier) -> Result<TableMetadata, CatalogError>;

    fn rename_table(
        &self,
        source: &TableIdentifier,
        destination: &TableIdentifier,
    ) -> Result<(), CatalogError>;

    /// Returns whether a table was removed.
    fn drop_table(&self, id: &TableIdentifier, purge: bool) -> Result<bool, CatalogError>;

    /// Releases backend resources.
    fn close(&self) {}
}

/// Opens the catalog named by `catalog-backend`.
pub fn open_catalog(kind: &str) -> Result<Arc<dyn CatalogBackend>, ConfigError> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryCatalog::new())),
        other => Err(ConfigError::unsupported("catalog backend", other)),
    }
}

// ============================================================================
// In-memory Catalog
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: RwLock<BTreeMap<TableIdentifier, TableMetadata>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

fn check_identifier(id: &TableIdentifier) -> Result<(), CatalogError> {
    if id.name.trim().is_empty() {
        return Err(CatalogError::BadRequest("Table name must not be blank".into()));
    }
    if id.namespace.is_empty() {
        return Err(CatalogError::BadRequest("Namespace must not be empty".into()));
    }
    Ok(())
}

impl CatalogBackend for MemoryCatalog {
    fn name(&self) -> &str {
        "memory"
    }

    fn list_tables(&self, namespace: &[String]) -> Result<Vec<TableIdentifier>, CatalogError> {
        Ok(self
            .tables
            .read()
            .keys()
            .filter(|id| id.namespace == namespace)
            .cloned()
            .collect())
    }

    fn create_table(
        &self,
        namespace: &[String],
        request: CreateTableRequest,
    ) -> Result<(TableIdentifier, TableMetadata), CatalogError> {
        let id = TableIdentifier::new(namespace.to_vec(), request.name);
        check_identifier(&id)?;

        let mut tables = self.tables.write();
        if tables.contains_key(&id) {
            return Err(CatalogError::AlreadyExists(id));
        }

        let location = request
            .location
            .unwrap_or_else(|| format!("memory://{}/{}", id.namespace.join("/"), id.name));
        let metadata = TableMetadata {
            location,
            properties: request.properties,
            metadata: request.schema.unwrap_or(serde_json::Value::Null),
            created_at: Utc::now(),
        };
        tables.insert(id.clone(), metadata.clone());

        info!(table = %id, "Created table");
        Ok((id, metadata))
    }

    fn load_table(&self, id: &TableIdentifier) -> Result<TableMetadata, CatalogError> {
        self.tables
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NoSuchTable(id.clone()))
    }

    fn rename_table(
        &self,
        source: &TableIdentifier,
        destination: &TableIdentifier,
    ) -> Result<(), CatalogError> {
        check_identifier(destination)?;

        let mut tables = self.tables.write();
        if tables.contains_key(destination) {
            return Err(CatalogError::AlreadyExists(destination.clone()));
        }
        let metadata = tables
            .remove(source)
            .ok_or_else(|| CatalogError::NoSuchTable(source.clone()))?;
        tables.insert(destination.clone(), metadata);

        info!(from = %source, to = %destination, "Renamed table");
        Ok(())
    }

    fn drop_table(&self, id: &TableIdentifier, purge: bool) -> Result<bool, CatalogError> {
        let removed = self.tables.write().remove(id).is_some();
        if removed {
            info!(table = %id, purge, "Dropped table");
        }
        Ok(removed)
    }

    fn close(&self) {
        debug!(tables = self.len(), "Closing memory catalog");
    }
}
