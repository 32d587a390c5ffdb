use crate::codec::CodecId;
use crate::error::{IbxError, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const FLAG_FILE: i64 = 1;
pub const FLAG_DIRECTORY: i64 = 2;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Files (
    fileID TEXT PRIMARY KEY,
    domain TEXT NOT NULL,
    relativePath TEXT NOT NULL,
    flags INTEGER NOT NULL,
    file BLOB
);
CREATE INDEX IF NOT EXISTS FilesDomainIdx ON Files(domain);
CREATE INDEX IF NOT EXISTS FilesRelativePathIdx ON Files(relativePath);
";

/// Per-file metadata, CBOR-encoded into the `file` column (sealed when encrypted).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub codec: CodecId,
    pub blake3: [u8; 32],
}

impl FileMeta {
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out)
            .map_err(|e| IbxError::format(format!("file meta encode: {e}")))?;
        Ok(out)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| IbxError::DecryptionFailed(format!("file meta: {e}")))
    }
}

#[derive(Clone, Debug)]
pub struct ManifestRow {
    pub file_id: String,
    pub domain: String,
    pub relative_path: String,
    pub flags: i64,
    pub file: Option<Vec<u8>>,
}

impl ManifestRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            file_id: row.get(0)?,
            domain: row.get(1)?,
            relative_path: row.get(2)?,
            flags: row.get(3)?,
            file: row.get(4)?,
        })
    }
}

/// Filters applied in SQL; all present filters must match.
#[derive(Clone, Debug, Default)]
pub struct RowQuery<'a> {
    pub domain: Option<&'a str>,
    pub path_pattern: Option<&'a str>,
    pub limit: u32,
    pub offset: u32,
}

pub struct ManifestDb {
    conn: Connection,
}

impl ManifestDb {
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(IbxError::format(format!(
                "manifest missing: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    pub fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn insert(&self, row: &ManifestRow) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO Files (fileID, domain, relativePath, flags, file)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.file_id,
                row.domain,
                row.relative_path,
                row.flags,
                row.file
            ],
        )?;
        Ok(())
    }

    pub fn insert_many(&mut self, rows: &[ManifestRow]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO Files (fileID, domain, relativePath, flags, file)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.file_id,
                    row.domain,
                    row.relative_path,
                    row.flags,
                    row.file
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn lookup(&self, file_id: &str) -> Result<Option<ManifestRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT fileID, domain, relativePath, flags, file FROM Files
                 WHERE fileID = ?1 AND flags = ?2",
                params![file_id, FLAG_FILE],
                ManifestRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find(&self, domain: &str, relative_path: &str) -> Result<Option<ManifestRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT fileID, domain, relativePath, flags, file FROM Files
                 WHERE domain = ?1 AND relativePath = ?2 AND flags = ?3",
                params![domain, relative_path, FLAG_FILE],
                ManifestRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn query(&self, q: &RowQuery<'_>) -> Result<Vec<ManifestRow>> {
        let like = q.path_pattern.map(like_pattern);
        let mut stmt = self.conn.prepare(
            "SELECT fileID, domain, relativePath, flags, file FROM Files
             WHERE flags = ?1
               AND (?2 IS NULL OR domain = ?2)
               AND (?3 IS NULL OR relativePath LIKE ?3 ESCAPE '\\')
             ORDER BY domain, relativePath
             LIMIT ?4 OFFSET ?5",
        )?;
        let rows = stmt
            .query_map(
                params![FLAG_FILE, q.domain, like, q.limit, q.offset],
                ManifestRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn domains(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT domain FROM Files WHERE flags = ?1 ORDER BY domain",
        )?;
        let rows = stmt
            .query_map(params![FLAG_FILE], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
    }
}

/// `*`/`?` become `%`/`_`; literal `%`, `_` and `\` are escaped; the result
/// matches anywhere in the path.
pub fn like_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('%');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            c => out.push(c),
        }
    }
    out.push('%');
    out
}
