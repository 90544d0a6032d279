//! Crash-safe persistence: atomic replace, rotating backups and post-write
//! validation.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::table::{RecordStore, StoreError, TableShape};

pub const DEFAULT_BACKUP_RETENTION: usize = 5;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serializing {0}")]
    Json(#[from] serde_json::Error),
    #[error(
        "saved file {path} failed validation: expected {expected}, found {found}; \
         restored from {restored_from:?}"
    )]
    Integrity {
        path: PathBuf,
        expected: TableShape,
        found: String,
        restored_from: Option<PathBuf>,
    },
    #[error("store {0} does not exist and no backup is available")]
    Missing(PathBuf),
}

fn io_err(
    action: &'static str,
    path: &Path,
) -> impl FnOnce(std::io::Error) -> PersistenceError {
    let path = path.to_path_buf();
    move |source| PersistenceError::Io { action, path, source }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn temp_prefix(target: &Path) -> String {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    format!(".{name}.")
}

/// Writes bytes to a temp file beside `target`, fsyncs it, then renames it
/// over the target. The target is never observed half-written.
pub async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(io_err("creating directory", &parent))?;

    let temp_path = parent.join(format!("{}{}.tmp", temp_prefix(target), Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err("opening temp file", &temp_path))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PersistenceError::Io {
            action: "writing temp file",
            path: temp_path,
            source,
        });
    }

    if let Err(source) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PersistenceError::Io {
            action: "renaming temp file over",
            path: target.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Serializes a value as pretty JSON and writes it atomically.
pub async fn write_json_atomic<T: Serialize>(
    target: &Path,
    value: &T,
) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(target, &bytes).await
}

/// Deletes temp files left behind by a write that never reached its rename.
pub async fn sweep_stale_temps(target: &Path) -> Result<usize, PersistenceError> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !fs::try_exists(&parent).await.map_err(io_err("checking", &parent))? {
        return Ok(0);
    }
    let prefix = temp_prefix(target);
    let mut removed = 0;
    let mut entries = fs::read_dir(&parent).await.map_err(io_err("listing", &parent))?;
    while let Some(entry) = entries.next_entry().await.map_err(io_err("listing", &parent))? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name.ends_with(".tmp") {
            let path = entry.path();
            warn!(path = %path.display(), "removing stale temp file from interrupted save");
            fs::remove_file(&path).await.map_err(io_err("removing", &path))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Re-reads a written store without padding: the row count and every row's
/// width must match the expected shape.
pub async fn verify_written(path: &Path, expected: TableShape) -> Result<(), String> {
    let bytes = fs::read(path).await.map_err(|e| format!("unreadable: {e}"))?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes.as_slice());
    let columns = reader.headers().map_err(|e| format!("unparseable: {e}"))?.len();
    let mut rows = 0;
    for record in reader.records() {
        let record = record.map_err(|e| format!("unparseable: {e}"))?;
        rows += 1;
        if record.len() != columns {
            return Err(format!("row {rows} has {} of {columns} columns", record.len()));
        }
    }
    let found = TableShape { rows, columns };
    if found != expected {
        return Err(found.to_string());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub stamp: String,
}

/// Splits backups (oldest first) into those kept and those to delete so that
/// at most `keep` of the newest survive.
pub fn evict_oldest(entries: &[BackupEntry], keep: usize) -> (Vec<BackupEntry>, Vec<BackupEntry>) {
    let cut = entries.len().saturating_sub(keep);
    (entries[cut..].to_vec(), entries[..cut].to_vec())
}

/// Known backups of one store file, oldest first.
#[derive(Debug, Clone, Default)]
pub struct BackupCatalog {
    entries: Vec<BackupEntry>,
}

impl BackupCatalog {
    pub async fn scan(backup_dir: &Path, file_name: &str) -> Result<Self, PersistenceError> {
        let mut entries = Vec::new();
        if fs::try_exists(backup_dir).await.map_err(io_err("checking", backup_dir))? {
            let prefix = format!("{file_name}.backup_");
            let mut dir = fs::read_dir(backup_dir).await.map_err(io_err("listing", backup_dir))?;
            while let Some(entry) = dir
                .next_entry()
                .await
                .map_err(io_err("listing", backup_dir))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(stamp) = name.strip_prefix(&prefix) {
                    entries.push(BackupEntry {
                        path: entry.path(),
                        stamp: stamp.to_string(),
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.stamp.cmp(&b.stamp));
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[BackupEntry] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&BackupEntry> {
        self.entries.last()
    }

    fn push(&mut self, entry: BackupEntry) {
        self.entries.push(entry);
    }

    fn replace(&mut self, entries: Vec<BackupEntry>) {
        self.entries = entries;
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub target: PathBuf,
    pub backup_dir: PathBuf,
    pub retention: usize,
}

impl CheckpointConfig {
    /// Backups go to a `backups` directory beside the store.
    pub fn beside(target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        let backup_dir = target
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"));
        Self {
            target,
            backup_dir,
            retention: DEFAULT_BACKUP_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveReport {
    pub path: PathBuf,
    pub shape: TableShape,
    pub bytes: usize,
    pub sha256: String,
    pub backup: Option<PathBuf>,
    pub evicted: usize,
}

/// Owns the save protocol for one store file.
#[derive(Debug)]
pub struct Checkpointer {
    config: CheckpointConfig,
    file_name: String,
    catalog: BackupCatalog,
}

impl Checkpointer {
    /// Prepares the backup directory, clears temp files left by interrupted
    /// saves or backups, and indexes existing backups.
    pub async fn open(config: CheckpointConfig) -> Result<Self, PersistenceError> {
        let file_name = config
            .target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "store.csv".to_string());
        fs::create_dir_all(&config.backup_dir)
            .await
            .map_err(io_err("creating backup directory", &config.backup_dir))?;
        sweep_stale_temps(&config.target).await?;
        sweep_stale_temps(&config.backup_dir.join(&file_name)).await?;
        let catalog = BackupCatalog::scan(&config.backup_dir, &file_name).await?;
        Ok(Self {
            config,
            file_name,
            catalog,
        })
    }

    pub fn target(&self) -> &Path {
        &self.config.target
    }

    pub fn catalog(&self) -> &BackupCatalog {
        &self.catalog
    }

    /// Loads the store, restoring the newest backup first if the target is gone.
    pub async fn load_or_recover(&self) -> Result<RecordStore, PersistenceError> {
        let target = &self.config.target;
        if !fs::try_exists(target).await.map_err(io_err("checking", target))? {
            match self.catalog.latest() {
                Some(latest) => {
                    warn!(
                        backup = %latest.path.display(),
                        "store missing, restoring newest backup"
                    );
                    self.restore_from(&latest.path).await?;
                }
                None => return Err(PersistenceError::Missing(target.clone())),
            }
        }
        let bytes = fs::read(target).await.map_err(io_err("reading", target))?;
        Ok(RecordStore::from_csv_bytes(&bytes)?)
    }

    async fn restore_from(&self, backup: &Path) -> Result<(), PersistenceError> {
        let bytes = fs::read(backup).await.map_err(io_err("reading backup", backup))?;
        write_atomic(&self.config.target, &bytes).await
    }

    pub async fn restore_latest(&self) -> Result<Option<PathBuf>, PersistenceError> {
        match self.catalog.latest() {
            Some(latest) => {
                self.restore_from(&latest.path).await?;
                Ok(Some(latest.path.clone()))
            }
            None => Ok(None),
        }
    }

    async fn backup_current(&mut self) -> Result<Option<PathBuf>, PersistenceError> {
        let target = &self.config.target;
        if !fs::try_exists(target).await.map_err(io_err("checking", target))? {
            return Ok(None);
        }
        let base = Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string();
        let mut stamp = base.clone();
        let mut n = 1;
        while self.catalog.entries().iter().any(|e| e.stamp == stamp) {
            stamp = format!("{base}_{n}");
            n += 1;
        }
        let path = self
            .config
            .backup_dir
            .join(format!("{}.backup_{stamp}", self.file_name));
        let current = fs::read(target).await.map_err(io_err("reading", target))?;
        write_atomic(&path, &current).await?;
        info!(backup = %path.display(), "backup created");
        self.catalog.push(BackupEntry {
            path: path.clone(),
            stamp,
        });
        Ok(Some(path))
    }

    async fn rotate(&mut self) -> usize {
        let (kept, evicted) = evict_oldest(self.catalog.entries(), self.config.retention);
        let mut removed = 0;
        for entry in &evicted {
            match fs::remove_file(&entry.path).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(backup = %entry.path.display(), %err, "could not delete old backup")
                }
            }
        }
        self.catalog.replace(kept);
        removed
    }

    /// Backup, atomic write, validate. A validation failure restores the
    /// newest backup and is returned as a hard error.
    pub async fn save(&mut self, store: &RecordStore) -> Result<SaveReport, PersistenceError> {
        let bytes = store.to_csv_bytes()?;
        self.commit(&bytes, store.shape()).await
    }

    async fn commit(
        &mut self,
        bytes: &[u8],
        expected: TableShape,
    ) -> Result<SaveReport, PersistenceError> {
        let backup = self.backup_current().await?;

        write_atomic(&self.config.target, bytes).await?;

        if let Err(found) = verify_written(&self.config.target, expected).await {
            error!(
                path = %self.config.target.display(),
                %expected,
                %found,
                "saved store failed validation"
            );
            let restored_from = self.restore_latest().await?;
            return Err(PersistenceError::Integrity {
                path: self.config.target.clone(),
                expected,
                found,
                restored_from,
            });
        }

        let evicted = self.rotate().await;
        let report = SaveReport {
            path: self.config.target.clone(),
            shape: expected,
            bytes: bytes.len(),
            sha256: sha256_hex(bytes),
            backup,
            evicted,
        };
        info!(
            path = %report.path.display(),
            shape = %report.shape,
            sha256 = %report.sha256,
            "store saved"
        );
        Ok(report)
    }
}
