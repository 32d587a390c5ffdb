// ibx-core/src/registry/store.rs
use super::discovery::{FoundBundle, scan};
use crate::bundle::layout::BundleLayout;
use crate::domain::{BackupSnapshot, BackupStatus, DecryptionStatus};
use crate::error::{IbxError, Result};
use crate::index::board::JobBoard;
use crate::index::report::JobReport;
use crate::session::store::SessionStore;
use crate::util::fsx::write_json_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use time::OffsetDateTime;
use tracing::{info, warn};

/// Persisted facts about one backup. Status is never stored, see [`derive_status`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub path: PathBuf,
    pub display_name: String,
    pub device_name: Option<String>,
    pub product_version: Option<String>,
    pub is_encrypted: bool,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_modified_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
    #[serde(default)]
    pub decryption_status: DecryptionStatus,
    #[serde(default)]
    pub decryption_error: Option<String>,
    #[serde(default)]
    pub decrypted_path: Option<PathBuf>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub decrypted_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_indexed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub manifest_stale: bool,
    #[serde(default)]
    pub last_index: Option<JobReport>,
}

impl BackupRecord {
    fn from_found(b: &FoundBundle, now: OffsetDateTime) -> Self {
        Self {
            id: b.id.clone(),
            path: b.path.clone(),
            display_name: b.info.label(&b.dir_name),
            device_name: b.info.device_name.clone(),
            product_version: b.info.product_version.clone(),
            is_encrypted: b.info.is_encrypted,
            size_bytes: b.size_bytes,
            last_modified_at: b.last_modified_at,
            last_seen_at: now,
            decryption_status: DecryptionStatus::Pending,
            decryption_error: None,
            decrypted_path: None,
            decrypted_at: None,
            last_indexed_at: None,
            manifest_stale: false,
            last_index: None,
        }
    }

    pub fn layout(&self) -> BundleLayout {
        BundleLayout::new(&self.path)
    }
}

/// Status as a pure function of the record, session liveness and job state.
pub fn derive_status(record: &BackupRecord, session_live: bool, indexing: bool) -> BackupStatus {
    let decrypted = record.decryption_status == DecryptionStatus::Decrypted;
    if indexing {
        BackupStatus::Indexing
    } else if decrypted && record.last_indexed_at.is_some() {
        BackupStatus::Indexed
    } else if session_live || (decrypted && !record.is_encrypted) {
        BackupStatus::Unlocked
    } else if record.is_encrypted {
        BackupStatus::Locked
    } else {
        BackupStatus::Discovered
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryDiff {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    /// Known but absent on disk; kept in the registry.
    pub missing: Vec<String>,
}

pub struct BackupRegistry {
    root: PathBuf,
    state_path: PathBuf,
    records: RwLock<BTreeMap<String, BackupRecord>>,
}

impl BackupRegistry {
    /// Loads persisted records. A record caught mid-decrypt by a restart is
    /// marked failed.
    pub fn open(root: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Result<Self> {
        let state_path = state_path.into();
        let mut records: BTreeMap<String, BackupRecord> = match std::fs::read(&state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| IbxError::format(format!("{}: {e}", state_path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        for r in records.values_mut() {
            if r.decryption_status == DecryptionStatus::Decrypting {
                r.decryption_status = DecryptionStatus::Failed;
                r.decryption_error = Some("interrupted".into());
            }
        }
        Ok(Self {
            root: root.into(),
            state_path,
            records: RwLock::new(records),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, BackupRecord>> {
        self.records.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, BackupRecord>> {
        self.records.write().unwrap_or_else(|p| p.into_inner())
    }

    fn persist(&self, records: &BTreeMap<String, BackupRecord>) -> Result<()> {
        write_json_atomic(&self.state_path, records)
    }

    /// Inserts new bundles, refreshes metadata of known ones and flags size or
    /// mtime changes. Never removes a record.
    pub fn discover(&self) -> Result<DiscoveryDiff> {
        let found = scan(&self.root)?;
        let now = OffsetDateTime::now_utc();
        let mut diff = DiscoveryDiff::default();

        let mut records = self.write();
        for b in &found {
            match records.get_mut(&b.id) {
                None => {
                    records.insert(b.id.clone(), BackupRecord::from_found(b, now));
                    diff.added.push(b.id.clone());
                }
                Some(r) => {
                    if r.size_bytes != b.size_bytes || r.last_modified_at != b.last_modified_at {
                        r.manifest_stale = true;
                        diff.changed.push(b.id.clone());
                    }
                    r.path = b.path.clone();
                    r.display_name = b.info.label(&b.dir_name);
                    r.device_name = b.info.device_name.clone();
                    r.product_version = b.info.product_version.clone();
                    r.is_encrypted = b.info.is_encrypted;
                    r.size_bytes = b.size_bytes;
                    r.last_modified_at = b.last_modified_at;
                    r.last_seen_at = now;
                }
            }
        }
        diff.missing = records
            .keys()
            .filter(|id| !found.iter().any(|b| &b.id == *id))
            .cloned()
            .collect();
        self.persist(&records)?;
        drop(records);

        info!(
            added = diff.added.len(),
            changed = diff.changed.len(),
            missing = diff.missing.len(),
            "discovery finished"
        );
        Ok(diff)
    }

    pub fn refresh(&self) -> Result<DiscoveryDiff> {
        self.discover()
    }

    pub fn get(&self, id: &str) -> Result<BackupRecord> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| IbxError::NotFound(format!("backup {id}")))
    }

    pub fn list(&self) -> Vec<BackupRecord> {
        self.read().values().cloned().collect()
    }

    /// Applies `f` and persists; the in-memory change is kept even if the
    /// state file cannot be written.
    pub fn update<F>(&self, id: &str, f: F) -> Result<BackupRecord>
    where
        F: FnOnce(&mut BackupRecord),
    {
        let mut records = self.write();
        let r = records
            .get_mut(id)
            .ok_or_else(|| IbxError::NotFound(format!("backup {id}")))?;
        f(r);
        let updated = r.clone();
        if let Err(e) = self.persist(&records) {
            warn!(backup_id = id, error = %e, "registry state not saved");
            return Err(e);
        }
        Ok(updated)
    }

    pub fn snapshot(&self, id: &str, sessions: &SessionStore, board: &JobBoard) -> Result<BackupSnapshot> {
        let record = self.get(id)?;
        Ok(build_snapshot(record, sessions, board))
    }

    pub fn snapshots(&self, sessions: &SessionStore, board: &JobBoard) -> Vec<BackupSnapshot> {
        self.list()
            .into_iter()
            .map(|r| build_snapshot(r, sessions, board))
            .collect()
    }
}

fn build_snapshot(r: BackupRecord, sessions: &SessionStore, board: &JobBoard) -> BackupSnapshot {
    let progress = board.progress(&r.id);
    let status = derive_status(&r, sessions.is_live(&r.id), progress.is_some());
    let mut snap = BackupSnapshot {
        id: r.id,
        display_name: r.display_name,
        device_name: r.device_name,
        product_version: r.product_version,
        is_encrypted: r.is_encrypted,
        status,
        decryption_status: r.decryption_status,
        decryption_error: r.decryption_error,
        size_bytes: r.size_bytes,
        last_modified_at: r.last_modified_at,
        last_seen_at: r.last_seen_at,
        decrypted_at: r.decrypted_at,
        last_indexed_at: r.last_indexed_at,
        indexing_progress: None,
        indexing_total: None,
        indexing_artifact: None,
        manifest_stale: r.manifest_stale,
        last_index: r.last_index,
    };
    snap.apply_progress(progress);
    snap
}
