use super::RecordSink;
use crate::error::Result;
use crate::index::artifact::ArtifactKind;
use crate::parse::Record;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

type Table = BTreeMap<String, Record>;

/// In-process sink; relies on the two-phase default for replacement.
#[derive(Default)]
pub struct MemorySink {
    tables: Mutex<BTreeMap<(String, ArtifactKind), Table>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<(String, ArtifactKind), Table>> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn records(&self, backup_id: &str, artifact: ArtifactKind) -> Vec<Record> {
        self.tables()
            .get(&(backup_id.to_string(), artifact))
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl RecordSink for MemorySink {
    fn truncate(&self, backup_id: &str, artifact: ArtifactKind) -> Result<()> {
        self.tables().remove(&(backup_id.to_string(), artifact));
        Ok(())
    }

    fn insert_batch(&self, backup_id: &str, artifact: ArtifactKind, records: &[Record]) -> Result<()> {
        let mut tables = self.tables();
        let table = tables.entry((backup_id.to_string(), artifact)).or_default();
        for r in records {
            table.insert(r.key.clone(), r.clone());
        }
        Ok(())
    }

    fn record_count(&self, backup_id: &str, artifact: ArtifactKind) -> Result<u64> {
        Ok(self
            .tables()
            .get(&(backup_id.to_string(), artifact))
            .map_or(0, |t| t.len() as u64))
    }

    fn group_attachments(&self, backup_id: &str, group_key: &str) -> Result<Option<Vec<String>>> {
        let tables = self.tables();
        let mut seen = false;
        let mut ids = BTreeSet::new();
        for ((b, _), table) in tables.iter() {
            if b != backup_id {
                continue;
            }
            for r in table.values() {
                if r.group_key.as_deref() == Some(group_key) {
                    seen = true;
                    ids.extend(r.attachments.iter().cloned());
                }
            }
        }
        Ok(seen.then(|| ids.into_iter().collect()))
    }

    fn purge_backup(&self, backup_id: &str) -> Result<()> {
        self.tables().retain(|(b, _), _| b != backup_id);
        Ok(())
    }
}
