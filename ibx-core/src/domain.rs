use crate::index::board::Progress;
use crate::index::report::JobReport;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Discovered,
    Locked,
    Unlocked,
    Indexing,
    Indexed,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecryptionStatus {
    #[default]
    Pending,
    Decrypting,
    Decrypted,
    Failed,
}

/// One regular file of a backup manifest. Size and mtime stay `None` when the
/// row's metadata could not be decrypted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub file_id: String,
    pub domain: String,
    pub relative_path: String,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileFilter {
    pub domain: Option<String>,
    /// Substring match; `*` and `?` are wildcards.
    pub path_pattern: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for FileFilter {
    fn default() -> Self {
        Self {
            domain: None,
            path_pattern: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl FileFilter {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FilePage {
    pub items: Vec<ManifestEntry>,
    pub limit: u32,
    pub offset: u32,
}

/// Caller-facing view of one backup. `status` is derived on every read.
#[derive(Clone, Debug, Serialize)]
pub struct BackupSnapshot {
    pub id: String,
    pub display_name: String,
    pub device_name: Option<String>,
    pub product_version: Option<String>,
    pub is_encrypted: bool,
    pub status: BackupStatus,
    pub decryption_status: DecryptionStatus,
    pub decryption_error: Option<String>,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_modified_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub decrypted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_indexed_at: Option<OffsetDateTime>,
    pub indexing_progress: Option<u32>,
    pub indexing_total: Option<u32>,
    pub indexing_artifact: Option<String>,
    pub manifest_stale: bool,
    pub last_index: Option<JobReport>,
}

impl BackupSnapshot {
    pub(crate) fn apply_progress(&mut self, progress: Option<Progress>) {
        if let Some(p) = progress {
            self.indexing_progress = Some(p.done);
            self.indexing_total = Some(p.total);
            self.indexing_artifact = p.artifact.map(|a| a.name().to_string());
        }
    }
}
