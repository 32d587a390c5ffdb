#![allow(dead_code)]

use ibx_core::bundle::info::BundleInfo;
use ibx_core::crypto::keybag::KdfParams;
use ibx_core::{BundleWriter, Engine, Settings, WriteOptions};
use rusqlite::Connection;
use std::path::Path;
use tempfile::TempDir;

pub const BACKUP_ID: &str = "dev-a";
pub const PASSWORD: &str = "correct-pw";
pub const CHAT: &str = "+15550100";
pub const ATTACHMENT_PATH: &str = "Library/SMS/Attachments/ab/01/IMG_1.jpg";
pub const ATTACHMENT: &[u8] = b"\xff\xd8\xff\xe0 not really a jpeg";

pub fn sms_db(path: &Path) {
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

fn options(password: Option<&str>) -> WriteOptions {
    WriteOptions {
        info: BundleInfo {
            unique_device_id: Some(BACKUP_ID.into()),
            display_name: Some("Test iPhone".into()),
            product_version: Some("17.4".into()),
            ..BundleInfo::default()
        },
        password: password.map(str::to_string),
        kdf: KdfParams::fast(),
        ..WriteOptions::default()
    }
}

/// Encrypted bundle with a messages database and one attachment.
pub fn messages_bundle(root: &Path) {
    let scratch = tempfile::tempdir().unwrap();
    let db = scratch.path().join("sms.db");
    sms_db(&db);
    let bytes = std::fs::read(&db).unwrap();

    let mut w = BundleWriter::create(&root.join("backups").join("iphone-a"), options(Some(PASSWORD))).unwrap();
    w.add_directory("HomeDomain", "Library/SMS").unwrap();
    w.add_file("HomeDomain", "Library/SMS/sms.db", &bytes, 1_700_000_000).unwrap();
    w.add_file("MediaDomain", ATTACHMENT_PATH, ATTACHMENT, 1_700_000_000).unwrap();
    w.finish().unwrap();
}

/// Encrypted bundle holding a single opaque 4096-byte file.
pub fn opaque_bundle(root: &Path) -> Vec<u8> {
    let data: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
    let mut w = BundleWriter::create(&root.join("backups").join("iphone-a"), options(Some(PASSWORD))).unwrap();
    w.add_file("HomeDomain", "Library/SMS/sms.db", &data, 1_700_000_000).unwrap();
    w.finish().unwrap();
    data
}

pub fn engine(root: &TempDir) -> Engine {
    let engine = Engine::open(Settings::rooted(root.path())).unwrap();
    engine.discover().unwrap();
    engine
}
