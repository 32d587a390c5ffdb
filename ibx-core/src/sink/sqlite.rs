use super::RecordSink;
use crate::error::{IbxError, Result};
use crate::index::artifact::ArtifactKind;
use crate::parse::{Record, RecordStream};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    backup_id TEXT NOT NULL,
    artifact TEXT NOT NULL,
    record_key TEXT NOT NULL,
    group_key TEXT,
    fields TEXT NOT NULL,
    PRIMARY KEY (backup_id, artifact, record_key)
);
CREATE INDEX IF NOT EXISTS records_group ON records(backup_id, group_key);
CREATE TABLE IF NOT EXISTS record_attachments (
    backup_id TEXT NOT NULL,
    artifact TEXT NOT NULL,
    record_key TEXT NOT NULL,
    file_id TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS record_attachments_owner
    ON record_attachments(backup_id, artifact, record_key);
";

/// SQLite-backed sink; each artifact replacement runs in one transaction.
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn truncate_in(conn: &Connection, backup_id: &str, artifact: ArtifactKind) -> Result<()> {
    conn.execute(
        "DELETE FROM records WHERE backup_id = ?1 AND artifact = ?2",
        params![backup_id, artifact.name()],
    )?;
    conn.execute(
        "DELETE FROM record_attachments WHERE backup_id = ?1 AND artifact = ?2",
        params![backup_id, artifact.name()],
    )?;
    Ok(())
}

fn insert_in(conn: &Connection, backup_id: &str, artifact: ArtifactKind, records: &[Record]) -> Result<()> {
    let mut put = conn.prepare_cached(
        "INSERT OR REPLACE INTO records (backup_id, artifact, record_key, group_key, fields)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut clear = conn.prepare_cached(
        "DELETE FROM record_attachments WHERE backup_id = ?1 AND artifact = ?2 AND record_key = ?3",
    )?;
    let mut attach = conn.prepare_cached(
        "INSERT INTO record_attachments (backup_id, artifact, record_key, file_id)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for r in records {
        let fields = serde_json::to_string(&r.fields)
            .map_err(|e| IbxError::format(format!("record {}: {e}", r.key)))?;
        put.execute(params![backup_id, artifact.name(), r.key, r.group_key, fields])?;
        clear.execute(params![backup_id, artifact.name(), r.key])?;
        for id in &r.attachments {
            attach.execute(params![backup_id, artifact.name(), r.key, id])?;
        }
    }
    Ok(())
}

impl RecordSink for SqliteSink {
    fn truncate(&self, backup_id: &str, artifact: ArtifactKind) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        truncate_in(&tx, backup_id, artifact)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_batch(&self, backup_id: &str, artifact: ArtifactKind, records: &[Record]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        insert_in(&tx, backup_id, artifact, records)?;
        tx.commit()?;
        Ok(())
    }

    fn replace_artifact(
        &self,
        backup_id: &str,
        artifact: ArtifactKind,
        records: RecordStream,
        batch_size: usize,
    ) -> Result<u64> {
        let mut conn = self.conn();
        // Rolled back on drop if anything below returns early.
        let tx = conn.transaction()?;
        truncate_in(&tx, backup_id, artifact)?;
        let mut batch = Vec::with_capacity(batch_size);
        let mut n = 0u64;
        for rec in records {
            batch.push(rec?);
            if batch.len() >= batch_size.max(1) {
                insert_in(&tx, backup_id, artifact, &batch)?;
                n += batch.len() as u64;
                batch.clear();
            }
        }
        insert_in(&tx, backup_id, artifact, &batch)?;
        n += batch.len() as u64;
        tx.commit()?;
        Ok(n)
    }

    fn record_count(&self, backup_id: &str, artifact: ArtifactKind) -> Result<u64> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM records WHERE backup_id = ?1 AND artifact = ?2",
            params![backup_id, artifact.name()],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    fn group_attachments(&self, backup_id: &str, group_key: &str) -> Result<Option<Vec<String>>> {
        let conn = self.conn();
        let any: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM records WHERE backup_id = ?1 AND group_key = ?2 LIMIT 1",
                params![backup_id, group_key],
                |r| r.get(0),
            )
            .optional()?;
        if any.is_none() {
            return Ok(None);
        }
        let mut stmt = conn.prepare(
            "SELECT DISTINCT a.file_id FROM record_attachments a
             JOIN records r ON r.backup_id = a.backup_id
                           AND r.artifact = a.artifact
                           AND r.record_key = a.record_key
             WHERE r.backup_id = ?1 AND r.group_key = ?2
             ORDER BY a.file_id",
        )?;
        let ids = stmt
            .query_map(params![backup_id, group_key], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(Some(ids))
    }

    fn purge_backup(&self, backup_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM records WHERE backup_id = ?1", params![backup_id])?;
        tx.execute(
            "DELETE FROM record_attachments WHERE backup_id = ?1",
            params![backup_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(key: &str, group: Option<&str>, attachments: &[&str]) -> Record {
        let mut fields = serde_json::Map::new();
        fields.insert("text".into(), serde_json::Value::from(format!("body {key}")));
        Record {
            key: key.into(),
            group_key: group.map(str::to_string),
            attachments: attachments.iter().map(|s| s.to_string()).collect(),
            fields,
        }
    }

    #[test]
    fn failed_stream_rolls_back_to_previous_records() {
        let sink = SqliteSink::in_memory().unwrap();
        let first = Box::new(vec![Ok(rec("1", Some("g"), &["f1"]))].into_iter());
        assert_eq!(
            sink.replace_artifact("B1", ArtifactKind::WhatsApp, first, 10).unwrap(),
            1
        );

        let broken = Box::new(
            vec![Ok(rec("2", Some("g"), &["f2"])), Err(IbxError::format("bad row"))].into_iter(),
        );
        assert!(sink.replace_artifact("B1", ArtifactKind::WhatsApp, broken, 1).is_err());
        assert_eq!(sink.record_count("B1", ArtifactKind::WhatsApp).unwrap(), 1);
        assert_eq!(
            sink.group_attachments("B1", "g").unwrap(),
            Some(vec!["f1".to_string()])
        );
    }

    #[test]
    fn reinsert_does_not_duplicate_attachments() {
        let sink = SqliteSink::in_memory().unwrap();
        for _ in 0..2 {
            sink.insert_batch("B1", ArtifactKind::Messages, &[rec("1", Some("g"), &["x", "y"])])
                .unwrap();
        }
        assert_eq!(sink.record_count("B1", ArtifactKind::Messages).unwrap(), 1);
        assert_eq!(
            sink.group_attachments("B1", "g").unwrap(),
            Some(vec!["x".to_string(), "y".to_string()])
        );
        sink.purge_backup("B1").unwrap();
        assert_eq!(sink.group_attachments("B1", "g").unwrap(), None);
    }
}
