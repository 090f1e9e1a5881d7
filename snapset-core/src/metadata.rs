//! Per-set metadata on the management host.
//!
//! One JSON document per set under the metadata directory, written by
//! create and read by list, validate, restore and remove. Writes go to a
//! temporary file that is renamed into place.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{DatabaseKind, NfsExport};
use crate::naming::SetName;
use crate::plan::Tier;

/// Whether create ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetState {
    /// Create started but has not finished; a re-run resumes it.
    Partial,
    Complete,
}

/// One snapshot the set is made of.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub tier: Tier,
    /// LUN, filesystem or `host:vg/lv`.
    pub resource: String,
    pub snap_name: String,
    /// Array, NAS console or host.
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetMetadata {
    pub name: SetName,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub state: SetState,
    /// Database that owned the application data at create time.
    pub authoritative_db: Option<DatabaseKind>,
    pub pools: Vec<String>,
    /// NFS exports observed at create time, by filesystem.
    pub exports: BTreeMap<String, Vec<NfsExport>>,
    #[serde(default)]
    pub manifest: Vec<ManifestEntry>,
}

impl SetMetadata {
    pub fn new(name: SetName) -> Self {
        Self {
            name,
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            state: SetState::Partial,
            authoritative_db: None,
            pools: Vec::new(),
            exports: BTreeMap::new(),
            manifest: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == SetState::Complete
    }
}

/// JSON documents in one directory.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &SetName) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub fn save(&self, metadata: &SetMetadata) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(&metadata.name);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(metadata)
            .map_err(|e| Error::Metadata(format!("encode {}: {}", metadata.name, e)))?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), state = ?metadata.state, "Set metadata saved");
        Ok(())
    }

    pub fn load(&self, name: &SetName) -> Result<Option<SetMetadata>> {
        let path = self.path(name);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| Error::Metadata(format!("{}: {}", path.display(), e)))
    }

    /// Delete a set's record; `false` when there was none.
    pub fn delete(&self, name: &SetName) -> Result<bool> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => {
                info!(set = %name, "Set metadata deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every recorded set, by name.
    pub fn list(&self) -> Result<Vec<SetMetadata>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut sets = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(name) = SetName::new(stem) else {
                debug!(path = %path.display(), "Ignoring foreign file in metadata directory");
                continue;
            };
            if let Some(metadata) = self.load(&name)? {
                sets.push(metadata);
            }
        }
        sets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> SetName {
        SetName::new(s).unwrap()
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join("sets"));
        assert!(store.load(&name("s1")).unwrap().is_none());
        assert!(store.list().unwrap().is_empty());

        let mut metadata = SetMetadata::new(name("s1"));
        metadata.authoritative_db = Some(DatabaseKind::Graph);
        metadata.exports.insert(
            "pool1-fs1".to_string(),
            vec![NfsExport::new("10.0.0.1", "rw,no_root_squash")],
        );
        store.save(&metadata).unwrap();

        let loaded = store.load(&name("s1")).unwrap().unwrap();
        assert_eq!(loaded, metadata);
        assert!(!loaded.is_complete());

        assert!(store.delete(&name("s1")).unwrap());
        assert!(!store.delete(&name("s1")).unwrap());
    }

    #[test]
    fn test_list_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.save(&SetMetadata::new(name("b2"))).unwrap();
        store.save(&SetMetadata::new(name("a1"))).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("bad_name.json"), "{}").unwrap();

        let names: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|m| m.name.to_string())
            .collect();
        assert_eq!(names, vec!["a1", "b2"]);
    }
}
