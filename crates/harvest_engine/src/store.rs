use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use harvest_logging::harvest_warn;
use tempfile::NamedTempFile;
use thiserror::Error;

use harvest_core::{page_marker, parse_page_marker};

use crate::extract::ItemRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store directory missing or not writable: {0}")]
    StoreDir(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed store file {path:?}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// The discovered-URL set for one harvest run, persisted as a JSON array of
/// absolute URL strings. Existence of the file short-circuits a re-harvest.
#[derive(Debug, Clone)]
pub struct DiscoveryStore {
    path: PathBuf,
}

impl DiscoveryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<BTreeSet<String>, StoreError> {
        let raw = fs::read_to_string(&self.path)?;
        let urls: Vec<String> =
            serde_json::from_str(&raw).map_err(|source| StoreError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        Ok(urls.into_iter().collect())
    }

    pub fn save(&self, urls: &BTreeSet<String>) -> Result<(), StoreError> {
        let listed: Vec<&String> = urls.iter().collect();
        let body = serde_json::to_string_pretty(&listed).map_err(|source| {
            StoreError::Malformed {
                path: self.path.clone(),
                source,
            }
        })?;
        atomic_write(&self.path, &body)
    }
}

/// Listing pages that failed to yield data, persisted as `PAGE::<n>`
/// strings. Absent when no pages are outstanding.
#[derive(Debug, Clone)]
pub struct FailedPageStore {
    path: PathBuf,
}

impl FailedPageStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the outstanding page indices; an absent file is an empty set.
    pub fn load(&self) -> Result<BTreeSet<u32>, StoreError> {
        if !self.path.is_file() {
            return Ok(BTreeSet::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        let markers: Vec<String> =
            serde_json::from_str(&raw).map_err(|source| StoreError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        let mut pages = BTreeSet::new();
        for marker in markers {
            match parse_page_marker(&marker) {
                Some(index) => {
                    pages.insert(index);
                }
                None => harvest_warn!("ignoring malformed page marker {marker:?}"),
            }
        }
        Ok(pages)
    }

    /// Persists the outstanding set. An empty set deletes the file rather
    /// than writing an empty one.
    pub fn save(&self, pages: &BTreeSet<u32>) -> Result<(), StoreError> {
        if pages.is_empty() {
            if self.path.is_file() {
                fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        let markers: Vec<String> = pages.iter().map(|&index| page_marker(index)).collect();
        let body = serde_json::to_string_pretty(&markers).map_err(|source| {
            StoreError::Malformed {
                path: self.path.clone(),
                source,
            }
        })?;
        atomic_write(&self.path, &body)
    }
}

/// One record file per item id; the file's existence is the completion
/// marker, so records are written atomically (temp file, then rename).
#[derive(Debug, Clone)]
pub struct ItemStore {
    dir: PathBuf,
}

impl ItemStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.record_path(id).is_file()
    }

    pub fn write(&self, id: &str, record: &ItemRecord) -> Result<PathBuf, StoreError> {
        let path = self.record_path(id);
        let body = serde_json::to_string_pretty(record).map_err(|source| {
            StoreError::Malformed {
                path: path.clone(),
                source,
            }
        })?;
        atomic_write(&path, &body)?;
        Ok(path)
    }

    pub fn load(&self, id: &str) -> Result<ItemRecord, StoreError> {
        let path = self.record_path(id);
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|source| StoreError::Malformed { path, source })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

/// Ensure a store directory exists; create if missing.
fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    if dir.exists() {
        let meta = fs::metadata(dir).map_err(|e| StoreError::StoreDir(e.to_string()))?;
        if !meta.is_dir() {
            return Err(StoreError::StoreDir("path is not a directory".into()));
        }
    } else {
        fs::create_dir_all(dir).map_err(|e| StoreError::StoreDir(e.to_string()))?;
    }
    Ok(())
}

/// Atomically write content to `path` by writing a temp file then renaming.
fn atomic_write(path: &Path, content: &str) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::StoreDir("path has no parent directory".into()))?;
    ensure_dir(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.as_file_mut().sync_all()?;

    // The rename replaces an existing target in one step, so there is no
    // window where the previous file is gone but the new one not yet there.
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}
