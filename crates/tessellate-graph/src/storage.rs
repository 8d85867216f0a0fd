//! Document I/O through an injected store.
//!
//! Nothing in this crate reaches for a process-wide default store; callers
//! pass the store they want used.

use crate::{
    Document, DocumentFormat, FinalizeConfig, FinalizeReport, GraphError, finalize,
    parse_document, render_document,
};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {key}")]
    NotFound { key: String },
    #[error("invalid document key: {0}")]
    InvalidKey(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub trait DocumentStore: Send + Sync {
    fn read(&self, key: &str) -> StoreResult<String>;
    fn write(&self, key: &str, contents: &str) -> StoreResult<()>;
}

/// Documents as files below a root directory. Keys are relative paths.
#[derive(Clone, Debug)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        fs::create_dir_all(root.as_ref()).map_err(|err| {
            StoreError::Backend(format!("create document store root failed: {err}"))
        })?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    /// Opens an existing root without creating anything.
    pub fn open<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(StoreError::NotFound {
                key: root.display().to_string(),
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(key);
        let plain = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if key.is_empty() || !plain {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl DocumentStore for FsDocumentStore {
    fn read(&self, key: &str) -> StoreResult<String> {
        let path = self.resolve(key)?;
        fs::read_to_string(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound {
                key: key.to_string(),
            },
            _ => StoreError::Backend(format!("read {} failed: {err}", path.display())),
        })
    }

    fn write(&self, key: &str, contents: &str) -> StoreResult<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::Backend(format!("create {} failed: {err}", parent.display()))
            })?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, contents)
            .map_err(|err| StoreError::Backend(format!("write {} failed: {err}", tmp.display())))?;
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::Backend(format!(
                "rename {} failed: {err}",
                path.display()
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory document store mutex poisoned".to_string()))
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn read(&self, key: &str) -> StoreResult<String> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    fn write(&self, key: &str, contents: &str) -> StoreResult<()> {
        self.lock()?.insert(key.to_string(), contents.to_string());
        Ok(())
    }
}

/// Reads and parses `key`, picking the format from its extension.
pub fn load_document(store: &dyn DocumentStore, key: &str) -> Result<Document, GraphError> {
    let source = store.read(key)?;
    parse_document(&source, DocumentFormat::from_path(key))
}

pub fn save_document(
    store: &dyn DocumentStore,
    key: &str,
    document: &Document,
) -> Result<(), GraphError> {
    let rendered = render_document(document, DocumentFormat::from_path(key))?;
    store.write(key, &rendered)?;
    Ok(())
}

/// Loads `source_key`, finalizes it and writes the result to `target_key`.
/// Nothing is written when finalizing fails.
pub fn finalize_stored(
    store: &dyn DocumentStore,
    source_key: &str,
    target_key: &str,
    config: &FinalizeConfig,
) -> Result<FinalizeReport, GraphError> {
    let document = load_document(store, source_key)?;
    let finalized = finalize(&document, config)?;
    save_document(store, target_key, &finalized.document)?;
    tracing::info!(source = source_key, target = target_key, "stored finalized document");
    Ok(finalized.report)
}
