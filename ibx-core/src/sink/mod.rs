pub mod memory;
pub mod sqlite;

use crate::error::Result;
use crate::index::artifact::ArtifactKind;
use crate::parse::{Record, RecordStream};

/// Storage for normalized records. Records are keyed by
/// `(backup, artifact, record key)`; inserting an existing key replaces it.
pub trait RecordSink: Send + Sync {
    fn truncate(&self, backup_id: &str, artifact: ArtifactKind) -> Result<()>;

    fn insert_batch(&self, backup_id: &str, artifact: ArtifactKind, records: &[Record]) -> Result<()>;

    /// Replaces everything stored for `artifact` with `records`.
    ///
    /// Without transactions this is two-phase: the truncate has fully
    /// committed before the first batch is inserted. A failing stream leaves
    /// the batches written so far in place.
    fn replace_artifact(
        &self,
        backup_id: &str,
        artifact: ArtifactKind,
        records: RecordStream,
        batch_size: usize,
    ) -> Result<u64> {
        self.truncate(backup_id, artifact)?;
        let mut batch = Vec::with_capacity(batch_size);
        let mut n = 0u64;
        for rec in records {
            batch.push(rec?);
            if batch.len() >= batch_size.max(1) {
                self.insert_batch(backup_id, artifact, &batch)?;
                n += batch.len() as u64;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.insert_batch(backup_id, artifact, &batch)?;
            n += batch.len() as u64;
        }
        Ok(n)
    }

    fn record_count(&self, backup_id: &str, artifact: ArtifactKind) -> Result<u64>;

    /// Attachment file ids of every record in `group_key`, deduplicated and
    /// sorted; `None` when no record belongs to the group.
    fn group_attachments(&self, backup_id: &str, group_key: &str) -> Result<Option<Vec<String>>>;

    fn purge_backup(&self, backup_id: &str) -> Result<()>;
}
