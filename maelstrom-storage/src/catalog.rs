//! Spec catalog.
//!
//! Tracks the YAML files of the registry directory. Entries keep their raw
//! text; listings re-parse and re-compile on every call so they always reflect
//! the current bindings. Compiled machines are cached by machine id (the file
//! stem) and the cache entry is dropped whenever its file is imported,
//! deactivated or removed. A compile that raced with one of those changes is
//! returned to its caller but never cached.

use crate::error::StorageError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use maelstrom_core::{compile, Bindings, CompiledMachine, MachineSpec};
use maelstrom_engine::Resolution;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const UNKNOWN_VERSION: &str = "unknown";

/// A tracked file.
#[derive(Debug, Clone)]
struct CatalogEntry {
    version: String,
    active: bool,
    checksum: String,
    raw: String,
}

/// Kind of a catalog file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Statechart,
    Yaml,
}

/// One row of [`Catalog::list`].
#[derive(Debug, Clone, Serialize)]
pub struct CatalogListing {
    pub filename: String,
    pub version: String,
    pub active: bool,
    pub checksum: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub content: Value,
    #[serde(skip)]
    pub compiled: Option<Arc<CompiledMachine>>,
}

pub struct Catalog {
    dir: PathBuf,
    resolution: Arc<Resolution>,
    entries: RwLock<BTreeMap<String, CatalogEntry>>,
    cache: DashMap<String, Arc<CompiledMachine>>,
    /// Bumped on every invalidation.
    generation: AtomicU64,
}

impl Catalog {
    pub fn new(dir: impl AsRef<Path>, resolution: Arc<Resolution>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            resolution,
            entries: RwLock::new(BTreeMap::new()),
            cache: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Imports every `*.yaml` and `*.yml` file of the directory. Files that
    /// fail to import are logged and skipped. Returns the number imported.
    pub fn scan(&self) -> Result<usize, StorageError> {
        fs::create_dir_all(&self.dir)?;
        let mut names: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| machine_id(name).is_some())
            .collect();
        names.sort();

        let mut imported = 0;
        for name in names {
            match self.import(&name) {
                Ok(()) => imported += 1,
                Err(e) => tracing::warn!("Initial import of {} failed: {}", name, e),
            }
        }
        tracing::info!("Catalog scan imported {} files from {:?}", imported, self.dir);
        Ok(imported)
    }

    /// Reads a file of the directory and marks it active.
    pub fn import(&self, filename: &str) -> Result<(), StorageError> {
        let id = machine_id(filename).ok_or_else(|| StorageError::InvalidId(filename.to_string()))?;
        crate::store::validate_id(filename)?;

        let raw = fs::read_to_string(self.dir.join(filename))?;
        let entry = CatalogEntry {
            version: version_from_filename(filename),
            active: true,
            checksum: format!("{:08x}", crc32c::crc32c(raw.as_bytes())),
            raw,
        };
        tracing::info!(
            "Imported {} (version {}, crc {})",
            filename,
            entry.version,
            entry.checksum
        );
        self.entries.write().insert(filename.to_string(), entry);
        self.invalidate(id);
        Ok(())
    }

    /// Keeps the entry but stops serving it.
    pub fn deactivate(&self, filename: &str) -> Result<(), StorageError> {
        match self.entries.write().get_mut(filename) {
            Some(entry) => entry.active = false,
            None => return Err(StorageError::EntryNotFound(filename.to_string())),
        }
        if let Some(id) = machine_id(filename) {
            self.invalidate(id);
        }
        tracing::info!("Deactivated {}", filename);
        Ok(())
    }

    pub fn remove(&self, filename: &str) -> Result<(), StorageError> {
        if self.entries.write().remove(filename).is_none() {
            return Err(StorageError::EntryNotFound(filename.to_string()));
        }
        if let Some(id) = machine_id(filename) {
            self.invalidate(id);
        }
        tracing::info!("Removed {}", filename);
        Ok(())
    }

    pub fn invalidate(&self, id: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.remove(id);
    }

    /// Parses and compiles every entry. Active statecharts carry their
    /// compiled machine.
    pub fn list(&self) -> Vec<CatalogListing> {
        let entries = self.entries.read().clone();
        entries
            .into_iter()
            .map(|(filename, entry)| self.render(filename, entry))
            .collect()
    }

    fn render(&self, filename: String, entry: CatalogEntry) -> CatalogListing {
        let mut content = match serde_yaml::from_str::<Value>(&entry.raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => {
                tracing::warn!("{} is not valid YAML: {}", filename, e);
                Map::new()
            }
        };

        if !content.is_empty() {
            let doc = Value::Object(content.clone());
            let resolved = self.resolution.resolver().resolve(Some(&doc), None, None);
            content.insert("resolved".to_string(), resolved.to_json());
        }

        let spec = MachineSpec::from_yaml(&entry.raw)
            .ok()
            .filter(MachineSpec::is_statechart);
        let kind = if spec.is_some() {
            EntryKind::Statechart
        } else {
            EntryKind::Yaml
        };

        let compiled = match spec {
            Some(spec) if entry.active => {
                let bindings: &dyn Bindings = self.resolution.as_ref();
                match compile(Arc::new(spec), bindings) {
                    Ok(compiled) => Some(Arc::new(compiled)),
                    Err(e) => {
                        tracing::warn!("Compiling {} failed: {}", filename, e);
                        None
                    }
                }
            }
            _ => None,
        };

        CatalogListing {
            filename,
            version: entry.version,
            active: entry.active,
            checksum: entry.checksum,
            kind,
            content: Value::Object(content),
            compiled,
        }
    }

    /// Ids of active, compilable statecharts, sorted.
    pub fn machine_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .list()
            .into_iter()
            .filter(|listing| listing.compiled.is_some())
            .filter_map(|listing| machine_id(&listing.filename).map(str::to_string))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Compiled machine for an id. Served from the cache when possible.
    pub fn compiled(&self, id: &str) -> Option<Arc<CompiledMachine>> {
        if let Some(hit) = self.cache.get(id) {
            return Some(hit.value().clone());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let compiled = self.lookup(id)?;
        self.cache_if_current(id, generation, &compiled);
        Some(compiled)
    }

    /// Compiles the active statechart for an id, bypassing the cache.
    fn lookup(&self, id: &str) -> Option<Arc<CompiledMachine>> {
        self.list()
            .into_iter()
            .filter(|listing| machine_id(&listing.filename) == Some(id))
            .find_map(|listing| listing.compiled)
    }

    /// Caches a compile made at `generation` unless an invalidation happened
    /// since. The check runs under the cache shard lock, so a concurrent
    /// invalidation either fails it or removes the inserted value.
    fn cache_if_current(
        &self,
        id: &str,
        generation: u64,
        compiled: &Arc<CompiledMachine>,
    ) -> bool {
        match self.cache.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                if self.generation.load(Ordering::SeqCst) != generation {
                    tracing::debug!("Skipping cache of {}: catalog changed during compile", id);
                    return false;
                }
                slot.insert(compiled.clone());
                true
            }
        }
    }
}

/// File stem of a `.yaml`/`.yml` file name.
pub fn machine_id(filename: &str) -> Option<&str> {
    filename
        .strip_suffix(".yaml")
        .or_else(|| filename.strip_suffix(".yml"))
        .filter(|stem| !stem.is_empty())
}

/// Version embedded in a file name: `name-v1.2.yaml` is `1.2`, `app2.0.3.yml`
/// is `2.0.3`. Anything else is `unknown`.
pub fn version_from_filename(filename: &str) -> String {
    let Some(stem) = machine_id(filename) else {
        return UNKNOWN_VERSION.to_string();
    };

    // The name part is at least one character; the earliest split that leaves
    // `[-][v]<version>` wins.
    for (i, _) in stem.char_indices().skip(1) {
        let rest = &stem[i..];
        let rest = rest.strip_prefix('-').unwrap_or(rest);
        let rest = rest.strip_prefix('v').unwrap_or(rest);
        if is_version(rest) {
            return rest.to_string();
        }
    }
    UNKNOWN_VERSION.to_string()
}

fn is_version(text: &str) -> bool {
    let parts: Vec<&str> = text.split('.').collect();
    (2..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use maelstrom_engine::ConfigResolver;
    use maelstrom_tools::ToolRegistry;
    use tempfile::TempDir;

    const TRAFFIC_LIGHT: &str = r#"
name: traffic-light
version: 1
llm:
  model: small
machine:
  id: traffic
  initial: green
  states:
    green:
      on:
        timer: { target: yellow }
    yellow:
      on:
        timer: { target: red }
    red:
      on:
        timer: { target: green }
"#;

    fn catalog(dir: &TempDir) -> Catalog {
        let resolution = Resolution::new(ConfigResolver::default(), Arc::new(ToolRegistry::new()));
        Catalog::new(dir.path(), Arc::new(resolution))
    }

    #[test]
    fn test_version_from_filename() {
        assert_eq!(version_from_filename("traffic-v1.2.yaml"), "1.2");
        assert_eq!(version_from_filename("traffic-1.2.3.yml"), "1.2.3");
        assert_eq!(version_from_filename("app2.0.yaml"), "2.0");
        assert_eq!(version_from_filename("a.1.2.yaml"), "1.2");
        assert_eq!(version_from_filename("traffic.yaml"), "unknown");
        assert_eq!(version_from_filename("1.2.yaml"), "unknown");
        assert_eq!(version_from_filename("notes.txt"), "unknown");
    }

    #[test]
    fn test_machine_id() {
        assert_eq!(machine_id("traffic.yaml"), Some("traffic"));
        assert_eq!(machine_id("traffic.yml"), Some("traffic"));
        assert_eq!(machine_id(".yaml"), None);
        assert_eq!(machine_id("traffic.json"), None);
    }

    #[test]
    fn test_scan_and_list() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("traffic.yaml"), TRAFFIC_LIGHT).unwrap();
        fs::write(dir.path().join("settings-v2.0.yml"), "retries: 3\n").unwrap();
        fs::write(dir.path().join("readme.md"), "# not yaml").unwrap();

        let catalog = catalog(&dir);
        assert_eq!(catalog.scan().unwrap(), 2);

        let listing = catalog.list();
        assert_eq!(listing.len(), 2);

        let settings = &listing[0];
        assert_eq!(settings.filename, "settings-v2.0.yml");
        assert_eq!(settings.version, "2.0");
        assert_eq!(settings.kind, EntryKind::Yaml);
        assert!(settings.compiled.is_none());

        let traffic = &listing[1];
        assert_eq!(traffic.kind, EntryKind::Statechart);
        assert_eq!(traffic.version, "unknown");
        assert_eq!(traffic.checksum.len(), 8);
        assert_eq!(traffic.content["resolved"]["model"], "small");
        assert_eq!(traffic.content["resolved"]["provider"], "anthropic");
        assert!(traffic.compiled.is_some());

        assert_eq!(catalog.machine_ids(), vec!["traffic"]);
    }

    #[test]
    fn test_compiled_cache_and_invalidation() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("traffic.yaml"), TRAFFIC_LIGHT).unwrap();
        let catalog = catalog(&dir);
        catalog.scan().unwrap();

        let first = catalog.compiled("traffic").unwrap();
        let second = catalog.compiled("traffic").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.initial_path().unwrap(), "traffic.green");

        catalog.import("traffic.yaml").unwrap();
        let third = catalog.compiled("traffic").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));

        catalog.deactivate("traffic.yaml").unwrap();
        assert!(catalog.compiled("traffic").is_none());
        assert!(catalog.machine_ids().is_empty());
        assert!(!catalog.list()[0].active);

        catalog.remove("traffic.yaml").unwrap();
        assert!(catalog.list().is_empty());
        assert!(matches!(
            catalog.remove("traffic.yaml"),
            Err(StorageError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_stale_compile_not_cached() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("traffic.yaml"), TRAFFIC_LIGHT).unwrap();
        let catalog = catalog(&dir);
        catalog.scan().unwrap();

        // A compile that started before the deactivation finishes after it.
        let generation = catalog.generation.load(Ordering::SeqCst);
        let stale = catalog.lookup("traffic").unwrap();
        catalog.deactivate("traffic.yaml").unwrap();
        assert!(!catalog.cache_if_current("traffic", generation, &stale));
        assert!(catalog.compiled("traffic").is_none());

        // Same for an import that replaces the file.
        catalog.import("traffic.yaml").unwrap();
        let generation = catalog.generation.load(Ordering::SeqCst);
        let stale = catalog.lookup("traffic").unwrap();
        catalog.import("traffic.yaml").unwrap();
        assert!(!catalog.cache_if_current("traffic", generation, &stale));
        let fresh = catalog.compiled("traffic").unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));

        // An unchanged catalog caches normally.
        let generation = catalog.generation.load(Ordering::SeqCst);
        catalog.invalidate("traffic");
        let current = catalog.lookup("traffic").unwrap();
        assert!(!catalog.cache_if_current("traffic", generation, &current));
        let generation = catalog.generation.load(Ordering::SeqCst);
        assert!(catalog.cache_if_current("traffic", generation, &current));
        assert!(Arc::ptr_eq(&catalog.compiled("traffic").unwrap(), &current));
    }

    #[test]
    fn test_broken_file_listed_as_yaml() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("broken.yaml"), "machine: [unclosed").unwrap();
        let catalog = catalog(&dir);
        catalog.scan().unwrap();
        let listing = catalog.list();
        assert_eq!(listing[0].kind, EntryKind::Yaml);
        assert_eq!(listing[0].content, Value::Object(Map::new()));
        assert!(catalog.compiled("broken").is_none());
    }

    #[test]
    fn test_import_rejects_paths() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        assert!(matches!(
            catalog.import("../escape.yaml"),
            Err(StorageError::InvalidId(_))
        ));
        assert!(matches!(
            catalog.import("missing.yaml"),
            Err(StorageError::Io(_))
        ));
    }
}
