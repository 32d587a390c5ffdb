// ibx-core/src/index/coordinator.rs
use super::artifact::ArtifactKind;
use super::board::{JobBoard, JobGuard, JobKind};
use super::report::{ArtifactOutcome, ArtifactState, JobReport};
use crate::domain::DecryptionStatus;
use crate::error::{IbxError, Result};
use crate::parse::ParserTable;
use crate::registry::store::BackupRegistry;
use crate::resolver::ManifestResolver;
use crate::session::store::{SessionStore, Unlocked};
use crate::sink::RecordSink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn};
use uuid::Uuid;

const SCRATCH_PREFIX: &str = "ibxjob_";

/// Handle to an indexing job running on the blocking pool.
pub struct JobTicket {
    pub job_id: Uuid,
    pub backup_id: String,
    handle: JoinHandle<JobReport>,
}

impl JobTicket {
    pub async fn wait(self) -> Result<JobReport> {
        self.handle
            .await
            .map_err(|e| IbxError::Worker(format!("indexing job: {e}")))
    }
}

/// A claimed job with its captured decryption context.
struct IndexingJob {
    guard: JobGuard,
    unlocked: Arc<Unlocked>,
    decrypted_dir: PathBuf,
}

struct Inner {
    board: JobBoard,
    registry: Arc<BackupRegistry>,
    sessions: Arc<SessionStore>,
    resolver: Arc<ManifestResolver>,
    parsers: ParserTable,
    sink: Arc<dyn RecordSink>,
    decrypted_root: PathBuf,
    batch_size: usize,
}

#[derive(Clone)]
pub struct IndexingCoordinator {
    inner: Arc<Inner>,
}

pub struct CoordinatorParts {
    pub board: JobBoard,
    pub registry: Arc<BackupRegistry>,
    pub sessions: Arc<SessionStore>,
    pub resolver: Arc<ManifestResolver>,
    pub parsers: ParserTable,
    pub sink: Arc<dyn RecordSink>,
    pub decrypted_root: PathBuf,
    pub batch_size: usize,
}

impl IndexingCoordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                board: parts.board,
                registry: parts.registry,
                sessions: parts.sessions,
                resolver: parts.resolver,
                parsers: parts.parsers,
                sink: parts.sink,
                decrypted_root: parts.decrypted_root,
                batch_size: parts.batch_size.max(1),
            }),
        }
    }

    /// Claims the backup and runs the job on the runtime's blocking pool.
    /// A concurrent trigger fails with `AlreadyIndexing`.
    pub fn trigger_index(&self, backup_id: &str) -> Result<JobTicket> {
        let rt = tokio::runtime::Handle::try_current()
            .map_err(|e| IbxError::Worker(format!("no async runtime: {e}")))?;
        let job = self.inner.prepare(backup_id)?;
        let job_id = job.guard.job_id();
        let inner = self.inner.clone();
        let handle = rt.spawn_blocking(move || inner.execute(job));
        Ok(JobTicket {
            job_id,
            backup_id: backup_id.to_string(),
            handle,
        })
    }

    /// Same job, on the calling thread.
    pub fn run_index(&self, backup_id: &str) -> Result<JobReport> {
        let job = self.inner.prepare(backup_id)?;
        Ok(self.inner.execute(job))
    }

    pub fn cancel(&self, backup_id: &str) -> bool {
        self.inner.board.cancel(backup_id)
    }
}

impl Inner {
    /// State is read only while the claim is held.
    fn prepare(&self, backup_id: &str) -> Result<IndexingJob> {
        self.registry.get(backup_id)?;
        let guard = self
            .board
            .try_claim(backup_id, JobKind::Index, ArtifactKind::ALL.len() as u32)?;
        let record = self.registry.get(backup_id)?;
        if record.decryption_status != DecryptionStatus::Decrypted {
            return Err(IbxError::NotDecrypted(backup_id.to_string()));
        }
        let unlocked = self.sessions.context_for(backup_id)?;
        let decrypted_dir = record
            .decrypted_path
            .unwrap_or_else(|| self.decrypted_root.join(backup_id));
        Ok(IndexingJob {
            guard,
            unlocked,
            decrypted_dir,
        })
    }

    fn execute(&self, job: IndexingJob) -> JobReport {
        let backup_id = job.guard.backup_id().to_string();
        let span = info_span!("index", backup_id = %backup_id, job_id = %job.guard.job_id());
        let _enter = span.enter();
        info!("indexing started");

        let started_at = OffsetDateTime::now_utc();
        let mut scratch: Option<TempDir> = None;
        let mut artifacts = Vec::with_capacity(ArtifactKind::ALL.len());
        let mut cancelled = false;

        for kind in ArtifactKind::ALL {
            if job.guard.is_cancelled() {
                cancelled = true;
                break;
            }
            job.guard.set_artifact(kind);
            let state = self.index_artifact(&job, kind, &mut scratch);
            match &state {
                ArtifactState::Ingested { records } => info!(artifact = %kind, records, "artifact ingested"),
                ArtifactState::Skipped => info!(artifact = %kind, "artifact source absent"),
                ArtifactState::Failed { error } => warn!(artifact = %kind, error = %error, "artifact failed"),
            }
            artifacts.push(ArtifactOutcome {
                artifact: kind,
                state,
            });
            // Only after the artifact's truncate+ingest has completed.
            job.guard.advance();
        }

        let report = JobReport {
            job_id: job.guard.job_id(),
            backup_id: backup_id.clone(),
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            cancelled,
            artifacts,
        };
        let saved = self.registry.update(&backup_id, |r| {
            if !cancelled {
                r.last_indexed_at = Some(report.finished_at);
            }
            r.last_index = Some(report.clone());
        });
        if let Err(e) = saved {
            warn!(error = %e, "index result not recorded");
        }
        info!(failed = report.failed().len(), cancelled, "indexing finished");
        // `job.guard` drops here and releases the backup.
        report
    }

    fn index_artifact(&self, job: &IndexingJob, kind: ArtifactKind, scratch: &mut Option<TempDir>) -> ArtifactState {
        let source = match self.locate(job, kind, scratch) {
            Ok(Some(path)) => path,
            Ok(None) => return ArtifactState::Skipped,
            Err(e) => return ArtifactState::Failed { error: e.to_string() },
        };
        let Some(parser) = self.parsers.get(kind) else {
            return ArtifactState::Failed {
                error: format!("no parser registered for {kind}"),
            };
        };
        let ingested = parser.parse(&source).and_then(|records| {
            self.sink
                .replace_artifact(job.guard.backup_id(), kind, records, self.batch_size)
        });
        match ingested {
            Ok(records) => ArtifactState::Ingested { records },
            Err(e) => ArtifactState::Failed { error: e.to_string() },
        }
    }

    /// Decrypted copy when present, else a fresh extraction from the bundle
    /// through the captured context. `None` when the backup has no such source.
    fn locate(&self, job: &IndexingJob, kind: ArtifactKind, scratch: &mut Option<TempDir>) -> Result<Option<PathBuf>> {
        let decrypted = job.decrypted_dir.join(kind.decrypted_name());
        if decrypted.is_file() {
            return Ok(Some(decrypted));
        }
        let Some(entry) = self
            .resolver
            .find(&job.unlocked, kind.source_domain(), kind.source_path())?
        else {
            return Ok(None);
        };
        let dir = match scratch {
            Some(dir) => dir.path().to_path_buf(),
            None => {
                let root: &Path = self.resolver.sandbox_root();
                std::fs::create_dir_all(root)?;
                let dir = tempfile::Builder::new()
                    .prefix(SCRATCH_PREFIX)
                    .tempdir_in(root)?;
                let path = dir.path().to_path_buf();
                *scratch = Some(dir);
                path
            }
        };
        self.resolver.extract_into(&job.unlocked, &entry.file_id, &dir)?;
        Ok(Some(dir.join(&entry.file_id)))
    }
}
