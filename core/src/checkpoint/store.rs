//! Blob storage addressed by URI.
//!
//! - `file:///a/b` and bare paths map to the local filesystem.
//! - `mem://bucket/a/b` is a process-wide in-memory object store, shared by every client
//!   thread of the process.
//! - Any other scheme (`gs://`, `s3://`, ...) is rejected.

use crate::error::{MeshError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{LazyLock, Mutex};

pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    fn exists(&self, key: &str) -> Result<bool>;
}

/// Resolves `uri` to a store and the key of `uri` within it.
pub fn open_store(uri: &str) -> Result<(Box<dyn BlobStore>, String)> {
    match uri.split_once("://") {
        None => Ok((Box::new(FileStore), uri.to_string())),
        Some(("file", path)) => Ok((Box::new(FileStore), path.to_string())),
        Some(("mem", key)) => Ok((Box::new(MemoryStore), key.to_string())),
        Some(_) => Err(MeshError::UnsupportedStorage(uri.to_string())),
    }
}

/// Joins a key and a child name with `/`.
pub fn join_key(base: &str, name: &str) -> String {
    if base.is_empty() || base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

pub struct FileStore;

impl BlobStore for FileStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = PathBuf::from(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        std::fs::read(key).map_err(|e| MeshError::Storage(format!("cannot read {key}: {e}")))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(PathBuf::from(key).try_exists()?)
    }
}

static MEMORY: LazyLock<Mutex<HashMap<String, Vec<u8>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub struct MemoryStore;

impl MemoryStore {
    fn with<R>(f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> R) -> Result<R> {
        let mut objects = MEMORY
            .lock()
            .map_err(|_| MeshError::Storage("in-memory store is poisoned".into()))?;
        Ok(f(&mut objects))
    }
}

impl BlobStore for MemoryStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        Self::with(|objects| {
            objects.insert(key.to_string(), bytes.to_vec());
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        Self::with(|objects| objects.get(key).cloned())?
            .ok_or_else(|| MeshError::Storage(format!("no object at mem://{key}")))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Self::with(|objects| objects.contains_key(key))
    }
}
