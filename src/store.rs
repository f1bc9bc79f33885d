use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::{Builder, TempDir};

use crate::config::StoragePaths;
use crate::domain::AccessionNumber;
use crate::error::RelayError;

pub const METADATA_FILE: &str = "metadata.json";
pub const PIPELINE_RESPONSE_FILE: &str = "pipeline_response.json";
pub const REPORT_PAYLOAD_FILE: &str = "report_payload.json";

/// On-disk layout shared by the engine, router and retention.
#[derive(Debug, Clone)]
pub struct Store {
    persistent_root: Utf8PathBuf,
    staging_root: Utf8PathBuf,
    incoming_dir: Option<Utf8PathBuf>,
    records_dir: Utf8PathBuf,
}

impl Store {
    pub fn new(paths: &StoragePaths) -> Self {
        Self {
            persistent_root: paths.persistent_dir.clone(),
            staging_root: paths.staging_dir.clone(),
            incoming_dir: paths.incoming_dir.clone(),
            records_dir: paths.records_dir.clone(),
        }
    }

    pub fn new_with_paths(root: &Utf8Path) -> Self {
        Self {
            persistent_root: root.join("data/DICOM"),
            staging_root: root.join("tmp"),
            incoming_dir: Some(root.join("incoming")),
            records_dir: root.join("records"),
        }
    }

    pub fn persistent_root(&self) -> &Utf8Path {
        &self.persistent_root
    }

    pub fn staging_root(&self) -> &Utf8Path {
        &self.staging_root
    }

    pub fn incoming_dir(&self) -> Option<&Utf8Path> {
        self.incoming_dir.as_deref()
    }

    pub fn records_dir(&self) -> &Utf8Path {
        &self.records_dir
    }

    pub fn study_dir(&self, accession: &AccessionNumber) -> Utf8PathBuf {
        self.persistent_root.join(accession.as_str())
    }

    pub fn record_path(&self, accession: &AccessionNumber) -> Utf8PathBuf {
        self.records_dir.join(format!("{accession}.json"))
    }

    pub fn ensure_layout(&self) -> Result<(), RelayError> {
        let mut dirs = vec![&self.persistent_root, &self.staging_root, &self.records_dir];
        if let Some(incoming) = &self.incoming_dir {
            dirs.push(incoming);
        }
        for dir in dirs {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| RelayError::Filesystem(format!("create {dir}: {err}")))?;
        }
        Ok(())
    }

    /// Scratch directory for one study; removed on drop unless moved away first.
    pub fn staging_dir_for(&self, accession: &AccessionNumber) -> Result<TempDir, RelayError> {
        fs::create_dir_all(self.staging_root.as_std_path())
            .map_err(|err| RelayError::Filesystem(err.to_string()))?;
        Builder::new()
            .prefix(&format!("{}-", accession.query_key()))
            .tempdir_in(self.staging_root.as_std_path())
            .map_err(|err| RelayError::Filesystem(err.to_string()))
    }

    pub fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), RelayError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| RelayError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), RelayError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| RelayError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| RelayError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| RelayError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Moves a directory into place, replacing any previous content at `dest`.
    /// Falls back to copy + delete when the rename crosses filesystems.
    pub fn move_dir(source: &Path, dest: &Path) -> Result<(), RelayError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| RelayError::Filesystem(err.to_string()))?;
        }
        if dest.exists() {
            fs::remove_dir_all(dest).map_err(|err| RelayError::Filesystem(err.to_string()))?;
        }
        if fs::rename(source, dest).is_ok() {
            return Ok(());
        }
        copy_dir_recursive(source, dest).map_err(|err| RelayError::Filesystem(err.to_string()))?;
        fs::remove_dir_all(source).map_err(|err| RelayError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn move_file(source: &Path, dest: &Path) -> Result<(), RelayError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| RelayError::Filesystem(err.to_string()))?;
        }
        if fs::rename(source, dest).is_ok() {
            return Ok(());
        }
        fs::copy(source, dest).map_err(|err| RelayError::Filesystem(err.to_string()))?;
        fs::remove_file(source).map_err(|err| RelayError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn remove_dir(path: &Utf8Path) -> Result<(), RelayError> {
        match fs::remove_dir_all(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(RelayError::Filesystem(format!("remove {path}: {err}"))),
        }
    }

    pub fn list_files(root: &Path) -> Result<Vec<PathBuf>, RelayError> {
        let mut files = walk_dir(root).map_err(|err| RelayError::Filesystem(err.to_string()))?;
        files.retain(|path| path.is_file());
        files.sort();
        Ok(files)
    }
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in walk_dir(source)? {
        let Ok(relative) = entry.strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&entry, &target)?;
        }
    }
    Ok(())
}

fn walk_dir(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        for entry in fs::read_dir(&path)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
