//! Schema storage with file persistence.
//!
//! Keeps every version of every pipeline schema in memory for fast
//! access, with optional JSON file persistence so schemas survive
//! restarts.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use fluxline_engine::PipelineSchema;

use crate::error::{Result, ServiceError};

/// Summary of a stored schema (for listing).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaMetadata {
    pub id: String,
    pub latest_version: u32,
    pub version_count: usize,
    pub node_count: usize,
}

/// In-memory schema store with optional file persistence.
///
/// Versions of one schema id are kept side by side; readers ask for a
/// specific version or take the latest.
///
/// # Example
///
/// ```ignore
/// use fluxline_service::SchemaStore;
///
/// let mut store = SchemaStore::with_persistence(".fluxline/schemas");
/// let count = store.load_from_disk()?;
/// log::info!("loaded {} schemas", count);
/// ```
#[derive(Debug, Default)]
pub struct SchemaStore {
    /// Versions per schema id, ordered so `.last()` is the latest.
    schemas: HashMap<String, BTreeMap<u32, PipelineSchema>>,
    /// Optional path for file persistence.
    persist_path: Option<PathBuf>,
}

impl SchemaStore {
    /// Create a new in-memory store without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that persists to the given directory.
    ///
    /// The directory will be created if it doesn't exist when saving.
    pub fn with_persistence(path: impl AsRef<Path>) -> Self {
        Self {
            schemas: HashMap::new(),
            persist_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Load all schemas from the persistence directory.
    ///
    /// Returns the number of schemas loaded. Files that fail to parse
    /// are skipped with a warning rather than aborting the load.
    pub fn load_from_disk(&mut self) -> Result<usize> {
        let Some(ref path) = self.persist_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let mut count = 0;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let file_path = entry.path();
            if file_path.extension().is_some_and(|e| e == "json") {
                let content = std::fs::read_to_string(&file_path)?;
                match serde_json::from_str::<PipelineSchema>(&content) {
                    Ok(schema) => {
                        log::info!(
                            "loaded schema '{}' v{} from {:?}",
                            schema.id,
                            schema.version,
                            file_path
                        );
                        self.schemas
                            .entry(schema.id.clone())
                            .or_default()
                            .insert(schema.version, schema);
                        count += 1;
                    }
                    Err(e) => {
                        log::warn!("failed to parse schema from {:?}: {}", file_path, e);
                    }
                }
            }
        }
        Ok(count)
    }

    /// Save a schema version to disk (if persistence is enabled).
    fn save_to_disk(&self, schema: &PipelineSchema) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        std::fs::create_dir_all(path)?;
        let file_path = path.join(format!("{}-v{}.json", schema.id, schema.version));
        let content = serde_json::to_string_pretty(schema)?;
        std::fs::write(&file_path, content)?;
        log::debug!("saved schema '{}' v{} to {:?}", schema.id, schema.version, file_path);
        Ok(())
    }

    /// Get a schema by id, at a specific version or the latest.
    pub fn get(&self, id: &str, version: Option<u32>) -> Option<&PipelineSchema> {
        let versions = self.schemas.get(id)?;
        match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        }
    }

    /// Insert or replace a schema version.
    ///
    /// The schema is persisted to disk if persistence is enabled.
    pub fn insert(&mut self, schema: PipelineSchema) -> Result<()> {
        self.save_to_disk(&schema)?;
        self.schemas
            .entry(schema.id.clone())
            .or_default()
            .insert(schema.version, schema);
        Ok(())
    }

    /// Remove every version of a schema id.
    ///
    /// Returns the removed versions, newest last.
    pub fn remove(&mut self, id: &str) -> Result<Vec<PipelineSchema>> {
        let versions = self
            .schemas
            .remove(id)
            .ok_or_else(|| ServiceError::SchemaNotFound {
                id: id.to_string(),
                version: None,
            })?;
        if let Some(ref path) = self.persist_path {
            for version in versions.keys() {
                let file_path = path.join(format!("{}-v{}.json", id, version));
                if file_path.exists() {
                    std::fs::remove_file(&file_path)?;
                }
            }
        }
        Ok(versions.into_values().collect())
    }

    /// List all stored schemas.
    pub fn list(&self) -> Vec<SchemaMetadata> {
        self.schemas
            .iter()
            .filter_map(|(id, versions)| {
                let latest = versions.values().next_back()?;
                Some(SchemaMetadata {
                    id: id.clone(),
                    latest_version: latest.version,
                    version_count: versions.len(),
                    node_count: latest.nodes.len(),
                })
            })
            .collect()
    }

    /// Check if any version of a schema exists.
    pub fn contains(&self, id: &str) -> bool {
        self.schemas.contains_key(id)
    }
}
