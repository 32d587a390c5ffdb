use super::artifact::ArtifactKind;
use crate::error::{IbxError, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ArtifactState {
    Ingested { records: u64 },
    /// Source database absent from the backup.
    Skipped,
    Failed { error: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactOutcome {
    pub artifact: ArtifactKind,
    #[serde(flatten)]
    pub state: ArtifactState,
}

/// Result of one indexing run, kept on the backup record for status queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub backup_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub cancelled: bool,
    pub artifacts: Vec<ArtifactOutcome>,
}

impl JobReport {
    pub fn failed(&self) -> Vec<ArtifactKind> {
        self.artifacts
            .iter()
            .filter(|o| matches!(o.state, ArtifactState::Failed { .. }))
            .map(|o| o.artifact)
            .collect()
    }

    pub fn records(&self, artifact: ArtifactKind) -> Option<u64> {
        self.artifacts.iter().find_map(|o| match o.state {
            ArtifactState::Ingested { records } if o.artifact == artifact => Some(records),
            _ => None,
        })
    }

    /// `PartialArtifactFailure` naming every failed artifact, if any.
    pub fn ensure_complete(&self) -> Result<()> {
        let failed = self.failed();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(IbxError::PartialArtifactFailure(
                failed.iter().map(|k| k.name().to_string()).collect(),
            ))
        }
    }
}
