//! File storage — blobs keyed by (scope, owner, filename).
//!
//! `LocalFileStorage` lays files out as `root/scope/owner/filename` and
//! writes through a temp file + rename so readers never see a partial file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use serde::Serialize;

/// Scope for files received from clients.
pub const UPLOAD_SCOPE: &str = "uploads";
/// Scope for files served to clients.
pub const LIBRARY_SCOPE: &str = "library";
/// Owner of library files every screen name may download.
pub const PUBLIC_OWNER: &str = "public";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMeta {
    pub filename: String,
    pub size: u64,
    /// Seconds since the Unix epoch, when known.
    pub modified: Option<u64>,
}

pub trait FileStorage: Send + Sync {
    fn list(&self, scope: &str, owner: &str) -> Result<Vec<FileMeta>, StorageError>;
    fn read(&self, scope: &str, owner: &str, filename: &str) -> Result<Bytes, StorageError>;
    fn write(&self, scope: &str, owner: &str, filename: &str, data: &[u8])
        -> Result<(), StorageError>;
    /// Returns false if there was nothing to delete.
    fn delete(&self, scope: &str, owner: &str, filename: &str) -> Result<bool, StorageError>;
    fn exists(&self, scope: &str, owner: &str, filename: &str) -> Result<bool, StorageError>;
    fn metadata(
        &self,
        scope: &str,
        owner: &str,
        filename: &str,
    ) -> Result<Option<FileMeta>, StorageError>;
}

/// Reject names that could escape their directory.
pub fn check_name(name: &str) -> Result<(), StorageError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.len() > 255
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn check_key(scope: &str, owner: &str, filename: &str) -> Result<(), StorageError> {
    check_name(scope)?;
    check_name(owner)?;
    check_name(filename)
}

// ── Local filesystem ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, scope: &str, owner: &str, filename: &str) -> Result<PathBuf, StorageError> {
        check_key(scope, owner, filename)?;
        Ok(self.root.join(scope).join(owner).join(filename))
    }

    fn meta(filename: &str, md: &std::fs::Metadata) -> FileMeta {
        FileMeta {
            filename: filename.to_string(),
            size: md.len(),
            modified: md
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
        }
    }
}

impl FileStorage for LocalFileStorage {
    fn list(&self, scope: &str, owner: &str) -> Result<Vec<FileMeta>, StorageError> {
        check_name(scope)?;
        check_name(owner)?;
        let dir = self.root.join(scope).join(owner);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // skip in-flight temp files
            if name.starts_with(".tmp-") {
                continue;
            }
            let md = entry.metadata()?;
            if md.is_file() {
                out.push(Self::meta(&name, &md));
            }
        }
        out.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(out)
    }

    fn read(&self, scope: &str, owner: &str, filename: &str) -> Result<Bytes, StorageError> {
        let path = self.path(scope, owner, filename)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("{scope}/{owner}/{filename}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(
        &self,
        scope: &str,
        owner: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.path(scope, owner, filename)?;
        let dir = self.root.join(scope).join(owner);
        std::fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!(".tmp-{}-{filename}", std::process::id()));
        std::fs::write(&tmp, data)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn delete(&self, scope: &str, owner: &str, filename: &str) -> Result<bool, StorageError> {
        let path = self.path(scope, owner, filename)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, scope: &str, owner: &str, filename: &str) -> Result<bool, StorageError> {
        Ok(self.path(scope, owner, filename)?.is_file())
    }

    fn metadata(
        &self,
        scope: &str,
        owner: &str,
        filename: &str,
    ) -> Result<Option<FileMeta>, StorageError> {
        let path = self.path(scope, owner, filename)?;
        match std::fs::metadata(&path) {
            Ok(md) if md.is_file() => Ok(Some(Self::meta(filename, &md))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ── In-memory ─────────────────────────────────────────────────────────────────

type Key = (String, String, String);

/// Process-local storage for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: Mutex<BTreeMap<Key, Bytes>>,
    read_only: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects every write.
    pub fn read_only() -> Self {
        Self {
            files: Mutex::default(),
            read_only: true,
        }
    }

    fn key(scope: &str, owner: &str, filename: &str) -> Result<Key, StorageError> {
        check_key(scope, owner, filename)?;
        Ok((scope.to_string(), owner.to_string(), filename.to_string()))
    }

    fn files(&self) -> std::sync::MutexGuard<'_, BTreeMap<Key, Bytes>> {
        self.files.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl FileStorage for MemoryStorage {
    fn list(&self, scope: &str, owner: &str) -> Result<Vec<FileMeta>, StorageError> {
        Ok(self
            .files()
            .iter()
            .filter(|((s, o, _), _)| s == scope && o == owner)
            .map(|((_, _, f), data)| FileMeta {
                filename: f.clone(),
                size: data.len() as u64,
                modified: None,
            })
            .collect())
    }

    fn read(&self, scope: &str, owner: &str, filename: &str) -> Result<Bytes, StorageError> {
        let key = Self::key(scope, owner, filename)?;
        self.files()
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{scope}/{owner}/{filename}")))
    }

    fn write(
        &self,
        scope: &str,
        owner: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let key = Self::key(scope, owner, filename)?;
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        self.files().insert(key, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn delete(&self, scope: &str, owner: &str, filename: &str) -> Result<bool, StorageError> {
        let key = Self::key(scope, owner, filename)?;
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        Ok(self.files().remove(&key).is_some())
    }

    fn exists(&self, scope: &str, owner: &str, filename: &str) -> Result<bool, StorageError> {
        let key = Self::key(scope, owner, filename)?;
        Ok(self.files().contains_key(&key))
    }

    fn metadata(
        &self,
        scope: &str,
        owner: &str,
        filename: &str,
    ) -> Result<Option<FileMeta>, StorageError> {
        let key = Self::key(scope, owner, filename)?;
        Ok(self.files().get(&key).map(|data| FileMeta {
            filename: filename.to_string(),
            size: data.len() as u64,
            modified: None,
        }))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage is read-only")]
    ReadOnly,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
