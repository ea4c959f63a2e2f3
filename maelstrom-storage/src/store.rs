//! Durable instance files.
//!
//! Each instance lives at `<dir>/<machine>/<instance>.json`. Writes go to a
//! temp file in the same directory which is then renamed over the target, so
//! a reader never sees a partial record.

use crate::error::StorageError;
use maelstrom_core::{InstanceKey, InstanceRecord};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Prefix of generated instance ids.
pub const INSTANCE_PREFIX: char = 'i';

pub struct InstanceStore {
    dir: PathBuf,
}

impl InstanceStore {
    /// Opens or creates a store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &InstanceKey) -> Result<PathBuf, StorageError> {
        validate_id(&key.machine_id)?;
        validate_id(&key.instance_id)?;
        Ok(self
            .dir
            .join(&key.machine_id)
            .join(format!("{}.json", key.instance_id)))
    }

    /// Loads a record. A missing file is `InstanceNotFound`.
    pub fn load(&self, key: &InstanceKey) -> Result<InstanceRecord, StorageError> {
        let path = self.path(key)?;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::InstanceNotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_reader(BufReader::new(file))?;
        Ok(record)
    }

    /// Writes a record atomically.
    pub fn save(&self, key: &InstanceKey, record: &InstanceRecord) -> Result<(), StorageError> {
        let path = self.path(key)?;
        let persist_err = |source: std::io::Error| StorageError::Persistence {
            path: path.clone(),
            source,
        };

        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidId(key.to_string()))?;
        fs::create_dir_all(parent).map_err(persist_err)?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(persist_err)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, record)?;
            writer.flush().map_err(persist_err)?;
        }
        tmp.as_file().sync_all().map_err(persist_err)?;
        tmp.persist(&path).map_err(|e| persist_err(e.error))?;

        tracing::debug!(
            "Persisted {} ({} events)",
            key,
            record.history.len()
        );
        Ok(())
    }

    /// Removes a record. Returns whether a file was removed.
    pub fn remove(&self, key: &InstanceKey) -> Result<bool, StorageError> {
        let path = self.path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Instance ids stored for a machine, sorted.
    pub fn list(&self, machine_id: &str) -> Result<Vec<String>, StorageError> {
        validate_id(machine_id)?;
        let dir = self.dir.join(machine_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Highest `i<N>` sequence number on disk, across all machines.
    pub fn max_instance_seq(&self) -> Result<u64, StorageError> {
        let mut max = 0;
        for machine in fs::read_dir(&self.dir)? {
            let machine = machine?;
            if !machine.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(machine.path())? {
                let name = entry?.file_name();
                let seq = name
                    .to_str()
                    .and_then(|n| n.strip_suffix(".json"))
                    .and_then(|n| n.strip_prefix(INSTANCE_PREFIX))
                    .and_then(|n| n.parse::<u64>().ok());
                if let Some(seq) = seq {
                    max = max.max(seq);
                }
            }
        }
        Ok(max)
    }
}

/// Ids become path components, so they must be plain names.
pub fn validate_id(id: &str) -> Result<(), StorageError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && !id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidId(id.to_string()))
    }
}
