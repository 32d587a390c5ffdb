// ibx-core/src/engine.rs
use crate::config::Settings;
use crate::crypto::context::{Decryptor, SealedBundleCrypto};
use crate::decrypt::{DecryptSummary, decrypt_sources};
use crate::domain::{BackupSnapshot, DecryptionStatus, FileFilter, FilePage};
use crate::error::{IbxError, Result};
use crate::extract::gate::{ExtractionGate, ExtractionReport};
use crate::index::board::{JobBoard, JobKind};
use crate::index::coordinator::{CoordinatorParts, IndexingCoordinator, JobTicket};
use crate::index::report::JobReport;
use crate::parse::ParserTable;
use crate::registry::store::{BackupRegistry, DiscoveryDiff};
use crate::resolver::ManifestResolver;
use crate::resolver::sandbox::Download;
use crate::session::clock::{Clock, SystemClock};
use crate::session::store::{SessionStore, Unlocked};
use crate::sink::RecordSink;
use crate::sink::memory::MemorySink;
use crate::sink::sqlite::SqliteSink;
use crate::util::fsx::remove_dir_if_present;
use serde::Serialize;
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnlockGrant {
    pub session_token: String,
    pub ttl_seconds: u64,
}

pub struct EngineBuilder {
    settings: Settings,
    decryptor: Arc<dyn Decryptor>,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn RecordSink>>,
    parsers: ParserTable,
}

impl EngineBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            decryptor: Arc::new(SealedBundleCrypto),
            clock: Arc::new(SystemClock),
            sink: None,
            parsers: ParserTable::builtin(),
        }
    }

    pub fn decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn parsers(mut self, parsers: ParserTable) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let settings = self.settings;
        let sink: Arc<dyn RecordSink> = match (self.sink, &settings.records_db) {
            (Some(sink), _) => sink,
            (None, Some(path)) => Arc::new(SqliteSink::open(path)?),
            (None, None) => Arc::new(MemorySink::new()),
        };
        let sessions = Arc::new(SessionStore::new(
            Duration::from_secs(settings.session_ttl_secs),
            self.clock,
            self.decryptor.clone(),
        ));
        let registry = Arc::new(BackupRegistry::open(
            &settings.backup_root,
            settings.registry_path(),
        )?);
        let resolver = Arc::new(ManifestResolver::new(&settings.sandbox_root, self.decryptor));
        let board = JobBoard::new();
        let coordinator = IndexingCoordinator::new(CoordinatorParts {
            board: board.clone(),
            registry: registry.clone(),
            sessions: sessions.clone(),
            resolver: resolver.clone(),
            parsers: self.parsers,
            sink: sink.clone(),
            decrypted_root: settings.decrypted_root.clone(),
            batch_size: settings.index_batch_size,
        });
        let gate = ExtractionGate::new(&settings.extraction_root, resolver.clone(), sink.clone());

        Ok(Engine {
            settings,
            sessions,
            registry,
            resolver,
            board,
            coordinator,
            gate,
            sink,
        })
    }
}

/// Core-facing operations over every backup under the configured root.
pub struct Engine {
    settings: Settings,
    sessions: Arc<SessionStore>,
    registry: Arc<BackupRegistry>,
    resolver: Arc<ManifestResolver>,
    board: JobBoard,
    coordinator: IndexingCoordinator,
    gate: ExtractionGate,
    sink: Arc<dyn RecordSink>,
}

impl Engine {
    pub fn open(settings: Settings) -> Result<Self> {
        EngineBuilder::new(settings).build()
    }

    pub fn builder(settings: Settings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sink(&self) -> &Arc<dyn RecordSink> {
        &self.sink
    }

    // ---- registry ----

    pub fn discover(&self) -> Result<DiscoveryDiff> {
        self.registry.discover()
    }

    pub fn refresh(&self) -> Result<DiscoveryDiff> {
        self.registry.refresh()
    }

    pub fn list_backups(&self) -> Vec<BackupSnapshot> {
        self.registry.snapshots(&self.sessions, &self.board)
    }

    pub fn backup_status(&self, backup_id: &str) -> Result<BackupSnapshot> {
        self.registry.snapshot(backup_id, &self.sessions, &self.board)
    }

    // ---- sessions ----

    pub fn unlock(&self, backup_id: &str, password: &str) -> Result<UnlockGrant> {
        let record = self.registry.get(backup_id)?;
        let session_token = self
            .sessions
            .unlock(backup_id, &record.layout(), record.is_encrypted, password)?;
        Ok(UnlockGrant {
            session_token,
            ttl_seconds: self.sessions.ttl_secs(),
        })
    }

    pub fn lock(&self, session_token: &str) {
        self.sessions.lock(session_token);
    }

    pub fn validate(&self, session_token: &str) -> Result<String> {
        self.sessions.validate(session_token)
    }

    pub fn purge_expired_sessions(&self) -> usize {
        self.sessions.purge_expired()
    }

    fn authorize(&self, backup_id: &str, session_token: &str) -> Result<Arc<Unlocked>> {
        self.registry.get(backup_id)?;
        self.sessions.authorize(backup_id, session_token)
    }

    // ---- manifest ----

    pub fn list_files(&self, backup_id: &str, session_token: &str, filter: &FileFilter) -> Result<FilePage> {
        let unlocked = self.authorize(backup_id, session_token)?;
        self.resolver.list_entries(&unlocked, filter)
    }

    pub fn list_domains(&self, backup_id: &str, session_token: &str) -> Result<Vec<String>> {
        let unlocked = self.authorize(backup_id, session_token)?;
        self.resolver.list_domains(&unlocked)
    }

    /// The returned stream owns its sandbox; dropping it removes the directory.
    pub fn download_file(&self, backup_id: &str, session_token: &str, file_id: &str) -> Result<Download> {
        let unlocked = self.authorize(backup_id, session_token)?;
        self.resolver.open_download(&unlocked, file_id)
    }

    // ---- decrypted data ----

    pub fn decrypt(&self, backup_id: &str, session_token: &str) -> Result<DecryptSummary> {
        let unlocked = self.authorize(backup_id, session_token)?;
        let _claim = self.board.try_claim(backup_id, JobKind::Decrypt, 0)?;
        self.registry.update(backup_id, |r| {
            r.decryption_status = DecryptionStatus::Decrypting;
            r.decryption_error = None;
        })?;

        let out = self.settings.decrypted_root.join(backup_id);
        match decrypt_sources(&self.resolver, &unlocked, &out) {
            Ok(summary) => {
                let error = (!summary.failed.is_empty()).then(|| {
                    summary
                        .failed
                        .iter()
                        .map(|(k, e)| format!("{k}: {e}"))
                        .collect::<Vec<_>>()
                        .join("; ")
                });
                self.registry.update(backup_id, |r| {
                    r.decryption_status = DecryptionStatus::Decrypted;
                    r.decryption_error = error;
                    r.decrypted_path = Some(out.clone());
                    r.decrypted_at = Some(OffsetDateTime::now_utc());
                    r.manifest_stale = false;
                })?;
                info!(
                    backup_id,
                    written = summary.written.len(),
                    failed = summary.failed.len(),
                    "backup decrypted"
                );
                Ok(summary)
            }
            Err(e) => {
                self.registry.update(backup_id, |r| {
                    r.decryption_status = DecryptionStatus::Failed;
                    r.decryption_error = Some(e.to_string());
                })?;
                Err(e)
            }
        }
    }

    /// Locks the backup, then removes decrypted sources, cached attachments,
    /// markers and records. Refused while a job holds the backup.
    pub fn delete_decrypted(&self, backup_id: &str) -> Result<()> {
        let record = self.registry.get(backup_id)?;
        let _claim = self.board.try_claim(backup_id, JobKind::Purge, 0)?;
        self.sessions.revoke_backup(backup_id);

        remove_dir_if_present(&self.settings.decrypted_root.join(backup_id))?;
        if let Some(path) = &record.decrypted_path {
            remove_dir_if_present(path)?;
        }
        self.gate.purge(backup_id)?;
        self.sink.purge_backup(backup_id)?;
        self.registry.update(backup_id, |r| {
            r.decryption_status = DecryptionStatus::Pending;
            r.decryption_error = None;
            r.decrypted_path = None;
            r.decrypted_at = None;
            r.last_indexed_at = None;
            r.last_index = None;
        })?;
        info!(backup_id, "decrypted data deleted");
        Ok(())
    }

    // ---- indexing ----

    pub fn trigger_index(&self, backup_id: &str) -> Result<JobTicket> {
        self.coordinator.trigger_index(backup_id)
    }

    pub fn run_index(&self, backup_id: &str) -> Result<JobReport> {
        self.coordinator.run_index(backup_id)
    }

    pub fn cancel_index(&self, backup_id: &str) -> bool {
        self.coordinator.cancel(backup_id)
    }

    // ---- attachments ----

    /// Refused with `AlreadyIndexing` while the backup is being decrypted or
    /// deleted; a delete that arrives mid-extraction waits for it.
    pub fn extract(&self, backup_id: &str, session_token: &str, group_key: &str) -> Result<ExtractionReport> {
        let unlocked = self.authorize(backup_id, session_token)?;
        self.gate.extract(&unlocked, group_key, || {
            if self.board.is_rewriting(backup_id) {
                return Err(IbxError::AlreadyIndexing(backup_id.to_string()));
            }
            // A delete that finished before the shared lock was taken revoked the session.
            self.sessions.authorize(backup_id, session_token).map(drop)
        })
    }

    pub fn open_extracted(&self, backup_id: &str, group_key: &str, file_id: &str) -> Result<File> {
        self.registry.get(backup_id)?;
        self.gate.open_cached(backup_id, group_key, file_id)
    }
}
