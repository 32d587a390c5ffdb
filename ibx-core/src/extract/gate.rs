use super::markers::MarkerStore;
use crate::crypto::hex::is_file_id;
use crate::error::{IbxError, Result};
use crate::resolver::ManifestResolver;
use crate::session::store::Unlocked;
use crate::sink::RecordSink;
use crate::util::fsx::remove_dir_if_present;
use dashmap::DashMap;
use serde::Serialize;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

pub const FILES_DIR: &str = "files";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionReport {
    pub files_extracted: u64,
    pub bytes_extracted: u64,
    /// Attachment ids that could not be written.
    pub failed: Vec<String>,
    pub already_extracted: bool,
}

type GroupKey = (String, String);

/// Per-group mutex checked out of the gate; the map entry goes away with the
/// last holder.
struct GroupLease<'a> {
    locks: &'a DashMap<GroupKey, Arc<Mutex<()>>>,
    key: GroupKey,
    lock: Arc<Mutex<()>>,
}

impl<'a> GroupLease<'a> {
    fn take(locks: &'a DashMap<GroupKey, Arc<Mutex<()>>>, backup_id: &str, group_key: &str) -> Self {
        let key = (backup_id.to_string(), group_key.to_string());
        let lock = locks.entry(key.clone()).or_default().clone();
        Self { locks, key, lock }
    }
}

impl Drop for GroupLease<'_> {
    fn drop(&mut self) {
        // Map plus this lease; any other count means someone is still waiting.
        self.locks
            .remove_if(&self.key, |_, l| Arc::strong_count(l) <= 2);
    }
}

/// Bulk attachment extraction into `<root>/<backup>/files/<file_id>`, at most
/// once per `(backup, group)`.
///
/// Extraction holds the backup's lock shared and [`ExtractionGate::purge`]
/// holds it exclusively, so a purge never interleaves with a running
/// extraction.
pub struct ExtractionGate {
    root: PathBuf,
    markers: MarkerStore,
    resolver: Arc<ManifestResolver>,
    sink: Arc<dyn RecordSink>,
    backup_locks: DashMap<String, Arc<RwLock<()>>>,
    group_locks: DashMap<GroupKey, Arc<Mutex<()>>>,
}

impl ExtractionGate {
    pub fn new(root: impl Into<PathBuf>, resolver: Arc<ManifestResolver>, sink: Arc<dyn RecordSink>) -> Self {
        let root = root.into();
        Self {
            markers: MarkerStore::new(&root),
            root,
            resolver,
            sink,
            backup_locks: DashMap::new(),
            group_locks: DashMap::new(),
        }
    }

    pub fn cache_dir(&self, backup_id: &str) -> PathBuf {
        self.root.join(backup_id).join(FILES_DIR)
    }

    fn backup_lock(&self, backup_id: &str) -> Arc<RwLock<()>> {
        self.backup_locks
            .entry(backup_id.to_string())
            .or_default()
            .clone()
    }

    /// `admit` runs once the backup's shared lock is held; an error from it
    /// refuses the call before anything is read or written.
    pub fn extract(
        &self,
        unlocked: &Unlocked,
        group_key: &str,
        admit: impl FnOnce() -> Result<()>,
    ) -> Result<ExtractionReport> {
        let backup_id = unlocked.backup_id();
        let backup_lock = self.backup_lock(backup_id);
        let _shared = backup_lock.read().unwrap_or_else(|p| p.into_inner());
        admit()?;

        let done = ExtractionReport {
            already_extracted: true,
            ..ExtractionReport::default()
        };
        if self.markers.contains(backup_id, group_key)? {
            return Ok(done);
        }

        let lease = GroupLease::take(&self.group_locks, backup_id, group_key);
        let _held = lease.lock.lock().unwrap_or_else(|p| p.into_inner());
        // Another caller may have finished while we waited.
        if self.markers.contains(backup_id, group_key)? {
            return Ok(done);
        }

        let ids = self
            .sink
            .group_attachments(backup_id, group_key)?
            .ok_or_else(|| IbxError::NotFound(format!("group {group_key}")))?;

        let dir = self.cache_dir(backup_id);
        let mut report = ExtractionReport::default();
        let mut present = 0u64;
        for id in &ids {
            match self.resolver.extract_into(unlocked, id, &dir) {
                Ok(Some(n)) => {
                    report.files_extracted += 1;
                    report.bytes_extracted += n;
                }
                Ok(None) => present += 1,
                Err(e) => {
                    warn!(backup_id, group_key, file_id = %id, error = %e, "attachment not extracted");
                    report.failed.push(id.clone());
                }
            }
        }

        // Partial success still marks the group; failed blobs will not
        // decrypt on a later attempt either.
        if report.failed.is_empty() || report.files_extracted + present > 0 {
            self.markers.add(backup_id, group_key)?;
        }
        info!(
            backup_id,
            group_key,
            files = report.files_extracted,
            bytes = report.bytes_extracted,
            failed = report.failed.len(),
            "group extracted"
        );
        Ok(report)
    }

    /// Opens an attachment from the cache; its group must have been extracted.
    pub fn open_cached(&self, backup_id: &str, group_key: &str, file_id: &str) -> Result<File> {
        if !self.markers.contains(backup_id, group_key)? {
            return Err(IbxError::NotExtracted {
                backup: backup_id.to_string(),
                group: group_key.to_string(),
            });
        }
        if !is_file_id(file_id) {
            return Err(IbxError::NotFound(format!("file {file_id}")));
        }
        match File::open(self.cache_dir(backup_id).join(file_id)) {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(IbxError::NotFound(format!("file {file_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drops markers and cached files of one backup, after every running
    /// extraction of it has returned.
    pub fn purge(&self, backup_id: &str) -> Result<()> {
        let backup_lock = self.backup_lock(backup_id);
        let _exclusive = backup_lock.write().unwrap_or_else(|p| p.into_inner());
        self.markers.clear(backup_id)?;
        remove_dir_if_present(&self.root.join(backup_id))?;
        Ok(())
    }

    #[cfg(test)]
    fn group_locks_held(&self) -> usize {
        self.group_locks.len()
    }
}
