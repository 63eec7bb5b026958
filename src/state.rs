//! State backends: persistence of the recorded resource graph
//!
//! The engine is agnostic to storage medium; anything that can hand back
//! the previously recorded specs for a logical root and persist the
//! updated set qualifies.

use anyhow::{Context, Result};
use reconcile::ResourceSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

pub trait StateBackend: Send + Sync {
    /// The previously recorded resources for a logical root, already
    /// materialized as specs. An unknown root is an empty graph, not an
    /// error.
    fn load(&self, root: &str) -> Result<Vec<ResourceSpec>>;

    fn save(&self, root: &str, resources: &[ResourceSpec]) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct StateFile {
    #[serde(default)]
    resources: Vec<ResourceSpec>,
}

/// JSON files on disk, one per root, under a state directory.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn state_file(&self, root: &str) -> PathBuf {
        self.dir.join(format!("{root}.json"))
    }
}

impl StateBackend for FileBackend {
    fn load(&self, root: &str) -> Result<Vec<ResourceSpec>> {
        let path = self.state_file(root);
        if !path.exists() {
            log::debug!("no state file for '{root}', starting empty");
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        let state: StateFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        log::debug!("Loaded {} resource(s) from {}", state.resources.len(), path.display());
        Ok(state.resources)
    }

    fn save(&self, root: &str, resources: &[ResourceSpec]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory: {}", self.dir.display()))?;

        let path = self.state_file(root);
        let state = StateFile {
            resources: resources.to_vec(),
        };
        let content =
            serde_json::to_string_pretty(&state).context("Failed to serialize state to JSON")?;
        fs::write(&path, &content)
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;

        log::debug!("Saved {} resource(s) to {}", resources.len(), path.display());
        Ok(())
    }
}

/// In-memory backend for tests and embedders that manage persistence
/// themselves.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    roots: Mutex<HashMap<String, Vec<ResourceSpec>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a root with recorded resources.
    pub fn seed(&self, root: &str, resources: Vec<ResourceSpec>) {
        self.roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(root.to_string(), resources);
    }
}

// Poisoning is ignored: the map stays readable after a panicking holder.
impl StateBackend for MemoryBackend {
    fn load(&self, root: &str) -> Result<Vec<ResourceSpec>> {
        Ok(self
            .roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(root)
            .cloned()
            .unwrap_or_default())
    }

    fn save(&self, root: &str, resources: &[ResourceSpec]) -> Result<()> {
        self.roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(root.to_string(), resources.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());

        let resources = vec![
            ResourceSpec::new("vpc", "v1").with_field("cidr", "10.0.0.0/16"),
            ResourceSpec::new("subnet", "s1").with_field("az", "a"),
        ];
        backend.save("network", &resources).unwrap();

        let loaded = backend.load("network").unwrap();
        assert_eq!(loaded, resources);
    }

    #[test]
    fn test_missing_root_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        assert!(backend.load("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "not json").unwrap();

        let backend = FileBackend::new(dir.path());
        assert!(backend.load("bad").is_err());
    }

    #[test]
    fn test_memory_backend_survives_poisoned_lock() {
        let backend = MemoryBackend::new();
        backend.seed("net", vec![ResourceSpec::new("vpc", "v1")]);

        std::thread::scope(|s| {
            let handle = s.spawn(|| {
                let _guard = backend.roots.lock().unwrap();
                panic!("holder dies");
            });
            assert!(handle.join().is_err());
        });

        assert_eq!(backend.load("net").unwrap().len(), 1);
        backend.save("net", &[]).unwrap();
        assert!(backend.load("net").unwrap().is_empty());
    }

    #[test]
    fn test_memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        backend.seed("net", vec![ResourceSpec::new("vpc", "v1")]);
        assert_eq!(backend.load("net").unwrap().len(), 1);

        backend.save("net", &[]).unwrap();
        assert!(backend.load("net").unwrap().is_empty());
    }
}
