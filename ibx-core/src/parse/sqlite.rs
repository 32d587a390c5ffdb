use super::{ArtifactParser, Record, RecordStream};
use crate::error::Result;
use crate::index::artifact::ArtifactKind;
use crate::resolver::file_id::resolve_file_id;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, params};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

const RECORD_KEY: &str = "record_key";
const GROUP_KEY: &str = "group_key";
/// Optional column naming the row attachments are looked up by, when a
/// source row appears once per group and `record_key` is made unique.
const OWNER_KEY: &str = "owner_key";

/// Maps attachment paths stored in a source database into manifest file ids.
#[derive(Clone, Debug)]
pub struct AttachmentQuery {
    /// Yields `(owner key, stored path)`.
    pub sql: &'static str,
    /// Tables `sql` reads; when one is absent records carry no attachments.
    pub tables: &'static [&'static str],
    pub domain: &'static str,
    pub prefix: &'static str,
    /// Device-absolute prefixes removed before joining `prefix`.
    pub strip: &'static [&'static str],
}

impl AttachmentQuery {
    pub fn file_id(&self, stored: &str) -> Option<String> {
        let mut p = stored.trim();
        for s in self.strip {
            if let Some(rest) = p.strip_prefix(s) {
                p = rest;
                break;
            }
        }
        let p = p.trim_start_matches('/');
        if p.is_empty() {
            return None;
        }
        Some(resolve_file_id(self.domain, &format!("{}{}", self.prefix, p)))
    }
}

/// Query-driven parser: every column other than `record_key`, `group_key`
/// and `owner_key` lands in the record's fields.
#[derive(Clone, Debug)]
pub struct SqliteTableParser {
    pub kind: ArtifactKind,
    pub required_tables: &'static [&'static str],
    pub records_sql: &'static str,
    pub attachments: Option<AttachmentQuery>,
}

impl SqliteTableParser {
    pub fn for_kind(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::Photos => Self {
                kind,
                required_tables: &["ZASSET"],
                records_sql: "SELECT CAST(Z_PK AS TEXT) AS record_key, NULL AS group_key, *
                              FROM ZASSET ORDER BY Z_PK",
                attachments: Some(AttachmentQuery {
                    sql: "SELECT CAST(Z_PK AS TEXT), ZDIRECTORY || '/' || ZFILENAME FROM ZASSET
                          WHERE ZDIRECTORY IS NOT NULL AND ZFILENAME IS NOT NULL",
                    tables: &["ZASSET"],
                    domain: "CameraRollDomain",
                    prefix: "Media/",
                    strip: &[],
                }),
            },
            ArtifactKind::WhatsApp => Self {
                kind,
                required_tables: &["ZWAMESSAGE", "ZWACHATSESSION"],
                records_sql: "SELECT CAST(m.Z_PK AS TEXT) AS record_key,
                                     COALESCE(s.ZCONTACTJID, CAST(m.ZCHATSESSION AS TEXT)) AS group_key,
                                     m.*
                              FROM ZWAMESSAGE m
                              LEFT JOIN ZWACHATSESSION s ON s.Z_PK = m.ZCHATSESSION
                              ORDER BY m.Z_PK",
                attachments: Some(AttachmentQuery {
                    sql: "SELECT CAST(ZMESSAGE AS TEXT), ZMEDIALOCALPATH FROM ZWAMEDIAITEM
                          WHERE ZMESSAGE IS NOT NULL AND ZMEDIALOCALPATH IS NOT NULL",
                    tables: &["ZWAMEDIAITEM"],
                    domain: "AppDomainGroup-group.net.whatsapp.WhatsApp.shared",
                    prefix: "Message/",
                    strip: &[],
                }),
            },
            ArtifactKind::Messages => Self {
                kind,
                required_tables: &["message", "chat", "chat_message_join"],
                records_sql: "SELECT CAST(message.ROWID AS TEXT) || COALESCE(':' || cmj.chat_id, '') AS record_key,
                                     CAST(message.ROWID AS TEXT) AS owner_key,
                                     chat.chat_identifier AS group_key,
                                     message.*
                              FROM message
                              LEFT JOIN chat_message_join cmj ON cmj.message_id = message.ROWID
                              LEFT JOIN chat ON chat.ROWID = cmj.chat_id
                              ORDER BY message.ROWID, cmj.chat_id",
                attachments: Some(AttachmentQuery {
                    sql: "SELECT CAST(maj.message_id AS TEXT), attachment.filename
                          FROM attachment
                          JOIN message_attachment_join maj ON maj.attachment_id = attachment.ROWID
                          WHERE attachment.filename IS NOT NULL",
                    tables: &["attachment", "message_attachment_join"],
                    domain: "MediaDomain",
                    prefix: "",
                    strip: &["~/", "/var/mobile/"],
                }),
            },
            ArtifactKind::Notes => Self {
                kind,
                required_tables: &["ZNOTE"],
                records_sql: "SELECT CAST(Z_PK AS TEXT) AS record_key, NULL AS group_key, *
                              FROM ZNOTE ORDER BY Z_PK",
                attachments: None,
            },
            ArtifactKind::Calendar => Self {
                kind,
                required_tables: &["Event"],
                records_sql: "SELECT CAST(ROWID AS TEXT) AS record_key,
                                     CAST(calendar_id AS TEXT) AS group_key, *
                              FROM Event ORDER BY ROWID",
                attachments: None,
            },
            ArtifactKind::Contacts => Self {
                kind,
                required_tables: &["ABPerson"],
                records_sql: "SELECT CAST(ROWID AS TEXT) AS record_key, NULL AS group_key, *
                              FROM ABPerson ORDER BY ROWID",
                attachments: None,
            },
        }
    }

    fn attachment_map(&self, conn: &Connection) -> Result<HashMap<String, Vec<String>>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        let Some(q) = &self.attachments else {
            return Ok(out);
        };
        if !tables_present(conn, q.tables)? {
            return Ok(out);
        }
        let mut stmt = conn.prepare(q.sql)?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, Option<String>>(0)?, r.get::<_, Option<String>>(1)?))
        })?;
        for row in rows {
            if let (Some(owner), Some(path)) = row? {
                if let Some(id) = q.file_id(&path) {
                    out.entry(owner).or_default().push(id);
                }
            }
        }
        Ok(out)
    }
}

fn tables_present(conn: &Connection, tables: &[&str]) -> Result<bool> {
    for table in tables {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |r| r.get(0),
        )?;
        if n == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

fn column_value(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

impl ArtifactParser for SqliteTableParser {
    fn kind(&self) -> ArtifactKind {
        self.kind
    }

    fn parse(&self, source: &Path) -> Result<RecordStream> {
        let conn = Connection::open_with_flags(
            source,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        if !tables_present(&conn, self.required_tables)? {
            return Ok(Box::new(std::iter::empty()));
        }
        let attachments = self.attachment_map(&conn)?;

        let mut stmt = conn.prepare(self.records_sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let rows = stmt.query_map([], |row| {
            let mut key = String::new();
            let mut owner = None;
            let mut group_key = None;
            let mut fields = Map::new();
            for (i, name) in names.iter().enumerate() {
                let value = row.get_ref(i)?;
                match name.as_str() {
                    RECORD_KEY => key = row.get::<_, Option<String>>(i)?.unwrap_or_default(),
                    GROUP_KEY => group_key = row.get::<_, Option<String>>(i)?,
                    OWNER_KEY => owner = row.get::<_, Option<String>>(i)?,
                    _ => {
                        fields.entry(name.clone()).or_insert_with(|| column_value(value));
                    }
                }
            }
            let owner = owner.unwrap_or_else(|| key.clone());
            Ok((
                owner,
                Record {
                    key,
                    group_key,
                    attachments: Vec::new(),
                    fields,
                },
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (owner, mut rec) = row?;
            if let Some(ids) = attachments.get(&owner) {
                rec.attachments = ids.clone();
            }
            records.push(rec);
        }
        Ok(Box::new(records.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sms_db(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE message (ROWID INTEGER PRIMARY KEY, guid TEXT, text TEXT, date INTEGER, is_from_me INTEGER);
             CREATE TABLE chat (ROWID INTEGER PRIMARY KEY, guid TEXT, chat_identifier TEXT);
             CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
             CREATE TABLE attachment (ROWID INTEGER PRIMARY KEY, filename TEXT);
             CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER);
             INSERT INTO chat VALUES (1, 'iMessage;-;+15550100', '+15550100');
             INSERT INTO message VALUES (1, 'm1', 'hi', 10, 0), (2, 'm2', 'photo', 20, 1);
             INSERT INTO chat_message_join VALUES (1, 1), (1, 2);
             INSERT INTO attachment VALUES (1, '~/Library/SMS/Attachments/ab/01/IMG_1.jpg');
             INSERT INTO message_attachment_join VALUES (2, 1);",
        )
        .unwrap();
    }

    #[test]
    fn messages_carry_group_and_attachment_ids() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chat.db");
        sms_db(&db);

        let parser = SqliteTableParser::for_kind(ArtifactKind::Messages);
        let records: Vec<Record> = parser
            .parse(&db)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "1:1");
        assert!(!records[0].fields.contains_key("owner_key"));
        assert_eq!(records[0].group_key.as_deref(), Some("+15550100"));
        assert_eq!(records[0].fields["text"], "hi");
        assert!(records[0].attachments.is_empty());
        assert_eq!(
            records[1].attachments,
            [resolve_file_id(
                "MediaDomain",
                "Library/SMS/Attachments/ab/01/IMG_1.jpg"
            )]
        );

        // Each parse re-reads from the start.
        assert_eq!(parser.parse(&db).unwrap().count(), 2);
    }

    #[test]
    fn message_in_two_chats_keeps_attachments_in_both() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chat.db");
        sms_db(&db);
        Connection::open(&db)
            .unwrap()
            .execute_batch(
                "INSERT INTO chat VALUES (2, 'iMessage;+;group-7', 'group-7');
                 INSERT INTO chat_message_join VALUES (2, 2);",
            )
            .unwrap();

        let records: Vec<Record> = SqliteTableParser::for_kind(ArtifactKind::Messages)
            .parse(&db)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["1:1", "2:1", "2:2"]);
        let photo = resolve_file_id("MediaDomain", "Library/SMS/Attachments/ab/01/IMG_1.jpg");
        for r in &records[1..] {
            assert_eq!(r.attachments, [photo.clone()]);
        }
        assert_eq!(records[2].group_key.as_deref(), Some("group-7"));
    }

    #[test]
    fn absent_attachment_tables_leave_records_bare() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chat.db");
        Connection::open(&db)
            .unwrap()
            .execute_batch(
                "CREATE TABLE message (ROWID INTEGER PRIMARY KEY, text TEXT);
                 CREATE TABLE chat (ROWID INTEGER PRIMARY KEY, chat_identifier TEXT);
                 CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
                 INSERT INTO message VALUES (1, 'hi');",
            )
            .unwrap();

        let records: Vec<Record> = SqliteTableParser::for_kind(ArtifactKind::Messages)
            .parse(&db)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "1");
        assert_eq!(records[0].group_key, None);
        assert!(records[0].attachments.is_empty());
    }

    #[test]
    fn missing_tables_yield_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("notes.sqlite");
        Connection::open(&db)
            .unwrap()
            .execute_batch("CREATE TABLE unrelated (x INTEGER);")
            .unwrap();
        let parser = SqliteTableParser::for_kind(ArtifactKind::Notes);
        assert_eq!(parser.parse(&db).unwrap().count(), 0);
    }

    #[test]
    fn whatsapp_media_maps_into_shared_container() {
        let q = SqliteTableParser::for_kind(ArtifactKind::WhatsApp)
            .attachments
            .unwrap();
        assert_eq!(
            q.file_id("Media/447700900123@s.whatsapp.net/a/b/photo.jpg"),
            Some(resolve_file_id(
                "AppDomainGroup-group.net.whatsapp.WhatsApp.shared",
                "Message/Media/447700900123@s.whatsapp.net/a/b/photo.jpg"
            ))
        );
        assert_eq!(q.file_id("   "), None);
    }
}
