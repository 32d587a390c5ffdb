use super::artifact::ArtifactKind;
use crate::error::{IbxError, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// What holds a backup's exclusive claim.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Index,
    Decrypt,
    Purge,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub done: u32,
    pub total: u32,
    pub artifact: Option<ArtifactKind>,
}

struct JobState {
    job_id: Uuid,
    kind: JobKind,
    progress: Mutex<Progress>,
    cancel: AtomicBool,
}

/// Per-backup exclusive claims. A second claim fails fast, it never waits.
#[derive(Clone, Default)]
pub struct JobBoard {
    jobs: Arc<DashMap<String, Arc<JobState>>>,
}

impl JobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_claim(&self, backup_id: &str, kind: JobKind, total: u32) -> Result<JobGuard> {
        match self.jobs.entry(backup_id.to_string()) {
            Entry::Occupied(_) => Err(IbxError::AlreadyIndexing(backup_id.to_string())),
            Entry::Vacant(slot) => {
                let state = Arc::new(JobState {
                    job_id: Uuid::new_v4(),
                    kind,
                    progress: Mutex::new(Progress {
                        done: 0,
                        total,
                        artifact: None,
                    }),
                    cancel: AtomicBool::new(false),
                });
                slot.insert(state.clone());
                Ok(JobGuard {
                    jobs: self.jobs.clone(),
                    backup_id: backup_id.to_string(),
                    state,
                })
            }
        }
    }

    pub fn is_busy(&self, backup_id: &str) -> bool {
        self.jobs.contains_key(backup_id)
    }

    pub fn is_indexing(&self, backup_id: &str) -> bool {
        self.jobs
            .get(backup_id)
            .is_some_and(|s| s.kind == JobKind::Index)
    }

    /// Decrypt and purge claims rewrite the backup's decrypted state.
    pub fn is_rewriting(&self, backup_id: &str) -> bool {
        self.jobs
            .get(backup_id)
            .is_some_and(|s| s.kind != JobKind::Index)
    }

    /// Progress of a running indexing job.
    pub fn progress(&self, backup_id: &str) -> Option<Progress> {
        let state = self.jobs.get(backup_id)?.clone();
        if state.kind != JobKind::Index {
            return None;
        }
        let p = *state.progress.lock().unwrap_or_else(|p| p.into_inner());
        Some(p)
    }

    /// Asks a running indexing job to stop after its current artifact.
    pub fn cancel(&self, backup_id: &str) -> bool {
        match self.jobs.get(backup_id) {
            Some(s) if s.kind == JobKind::Index => {
                s.cancel.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }
}

/// Exclusive claim on one backup; released on drop, including unwinding.
pub struct JobGuard {
    jobs: Arc<DashMap<String, Arc<JobState>>>,
    backup_id: String,
    state: Arc<JobState>,
}

impl JobGuard {
    pub fn job_id(&self) -> Uuid {
        self.state.job_id
    }

    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.load(Ordering::SeqCst)
    }

    pub fn set_artifact(&self, artifact: ArtifactKind) {
        self.update(|p| p.artifact = Some(artifact));
    }

    /// Counts one artifact as finished and clears the current name.
    pub fn advance(&self) {
        self.update(|p| {
            p.done = (p.done + 1).min(p.total);
            p.artifact = None;
        });
    }

    fn update(&self, f: impl FnOnce(&mut Progress)) {
        let mut p = self.state.progress.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut p);
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.jobs
            .remove_if(&self.backup_id, |_, s| Arc::ptr_eq(s, &self.state));
    }
}
