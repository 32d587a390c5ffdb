mod common;

use common::*;
use ibx_core::sink::RecordSink;
use ibx_core::{ArtifactKind, ArtifactState, BackupStatus, DecryptionStatus, FileFilter, IbxError, resolve_file_id};
use std::io::Read;

#[test]
fn list_and_download_opaque_file() {
    let root = tempfile::tempdir().unwrap();
    let data = opaque_bundle(root.path());
    let engine = engine(&root);

    let grant = engine.unlock(BACKUP_ID, PASSWORD).unwrap();
    assert_eq!(grant.ttl_seconds, 3600);

    let page = engine
        .list_files(BACKUP_ID, &grant.session_token, &FileFilter::domain("HomeDomain"))
        .unwrap();
    assert_eq!(page.items.len(), 1);
    let entry = &page.items[0];
    assert_eq!(entry.relative_path, "Library/SMS/sms.db");
    assert_eq!(entry.size, Some(4096));
    assert_eq!(entry.file_id, resolve_file_id("HomeDomain", "Library/SMS/sms.db"));

    let mut dl = engine
        .download_file(BACKUP_ID, &grant.session_token, &entry.file_id)
        .unwrap();
    let sandbox = dl.sandbox_dir().to_path_buf();
    assert!(sandbox.starts_with(&engine.settings().sandbox_root));
    let mut out = Vec::new();
    dl.read_to_end(&mut out).unwrap();
    assert_eq!(out, data);
    drop(dl);
    assert!(!sandbox.exists());
}

#[test]
fn unknown_file_leaves_no_sandbox() {
    let root = tempfile::tempdir().unwrap();
    opaque_bundle(root.path());
    let engine = engine(&root);
    let grant = engine.unlock(BACKUP_ID, PASSWORD).unwrap();

    let missing = resolve_file_id("HomeDomain", "Library/nope.db");
    let err = engine
        .download_file(BACKUP_ID, &grant.session_token, &missing)
        .unwrap_err();
    assert!(matches!(err, IbxError::NotFound(_)), "{err}");
    assert!(!engine.settings().sandbox_root.exists());
}

#[test]
fn wrong_password_keeps_backup_locked() {
    let root = tempfile::tempdir().unwrap();
    opaque_bundle(root.path());
    let engine = engine(&root);

    assert_eq!(engine.backup_status(BACKUP_ID).unwrap().status, BackupStatus::Locked);
    let err = engine.unlock(BACKUP_ID, "wrong").unwrap_err();
    assert!(matches!(err, IbxError::InvalidCredentials));
    assert_eq!(engine.backup_status(BACKUP_ID).unwrap().status, BackupStatus::Locked);

    let grant = engine.unlock(BACKUP_ID, PASSWORD).unwrap();
    assert_eq!(engine.backup_status(BACKUP_ID).unwrap().status, BackupStatus::Unlocked);
    engine.lock(&grant.session_token);
    engine.lock(&grant.session_token);
    assert_eq!(engine.backup_status(BACKUP_ID).unwrap().status, BackupStatus::Locked);
    assert!(matches!(
        engine.validate(&grant.session_token),
        Err(IbxError::SessionUnknown)
    ));
}

#[test]
fn decrypt_index_extract_and_delete() {
    let root = tempfile::tempdir().unwrap();
    messages_bundle(root.path());
    let engine = engine(&root);

    assert!(matches!(engine.run_index(BACKUP_ID), Err(IbxError::NotDecrypted(_))));

    let grant = engine.unlock(BACKUP_ID, PASSWORD).unwrap();
    let token = grant.session_token.as_str();
    let domains = engine.list_domains(BACKUP_ID, token).unwrap();
    assert_eq!(domains, ["HomeDomain", "MediaDomain"]);

    let summary = engine.decrypt(BACKUP_ID, token).unwrap();
    assert_eq!(summary.written, [ArtifactKind::Messages]);
    assert!(summary.failed.is_empty());
    assert!(summary.output_dir.join("chat.db").is_file());
    let snap = engine.backup_status(BACKUP_ID).unwrap();
    assert_eq!(snap.decryption_status, DecryptionStatus::Decrypted);
    assert_eq!(snap.status, BackupStatus::Unlocked);

    let first = engine.run_index(BACKUP_ID).unwrap();
    assert!(!first.cancelled);
    assert_eq!(first.records(ArtifactKind::Messages), Some(2));
    assert!(matches!(
        first.artifacts.iter().find(|a| a.artifact == ArtifactKind::Notes).map(|a| &a.state),
        Some(ArtifactState::Skipped)
    ));
    first.ensure_complete().unwrap();
    assert_eq!(engine.backup_status(BACKUP_ID).unwrap().status, BackupStatus::Indexed);

    // Re-indexing replaces, never accumulates.
    let second = engine.run_index(BACKUP_ID).unwrap();
    assert_eq!(second.records(ArtifactKind::Messages), Some(2));
    assert_eq!(engine.sink().record_count(BACKUP_ID, ArtifactKind::Messages).unwrap(), 2);

    let attachment = resolve_file_id("MediaDomain", ATTACHMENT_PATH);
    assert!(matches!(
        engine.open_extracted(BACKUP_ID, CHAT, &attachment),
        Err(IbxError::NotExtracted { .. })
    ));

    let report = engine.extract(BACKUP_ID, token, CHAT).unwrap();
    assert_eq!(report.files_extracted, 1);
    assert_eq!(report.bytes_extracted, ATTACHMENT.len() as u64);
    assert!(!report.already_extracted);

    let cache = engine.settings().extraction_root.join(BACKUP_ID).join("files");
    let cached_before = std::fs::read_dir(&cache).unwrap().count();
    let again = engine.extract(BACKUP_ID, token, CHAT).unwrap();
    assert!(again.already_extracted);
    assert_eq!((again.files_extracted, again.bytes_extracted), (0, 0));
    assert_eq!(std::fs::read_dir(&cache).unwrap().count(), cached_before);

    let mut body = Vec::new();
    engine
        .open_extracted(BACKUP_ID, CHAT, &attachment)
        .unwrap()
        .read_to_end(&mut body)
        .unwrap();
    assert_eq!(body, ATTACHMENT);

    assert!(matches!(
        engine.extract(BACKUP_ID, token, "no-such-chat"),
        Err(IbxError::NotFound(_))
    ));

    engine.delete_decrypted(BACKUP_ID).unwrap();
    let snap = engine.backup_status(BACKUP_ID).unwrap();
    assert_eq!(snap.decryption_status, DecryptionStatus::Pending);
    assert_eq!(snap.status, BackupStatus::Locked);
    assert!(snap.last_indexed_at.is_none());
    assert!(!summary.output_dir.exists());
    assert_eq!(engine.sink().record_count(BACKUP_ID, ArtifactKind::Messages).unwrap(), 0);
    assert!(matches!(
        engine.open_extracted(BACKUP_ID, CHAT, &attachment),
        Err(IbxError::NotExtracted { .. })
    ));
    assert!(engine.list_files(BACKUP_ID, token, &FileFilter::default()).is_err());
}

#[test]
fn registry_survives_restart() {
    let root = tempfile::tempdir().unwrap();
    messages_bundle(root.path());
    {
        let engine = engine(&root);
        let grant = engine.unlock(BACKUP_ID, PASSWORD).unwrap();
        engine.decrypt(BACKUP_ID, &grant.session_token).unwrap();
        engine.run_index(BACKUP_ID).unwrap();
    }

    let engine = ibx_core::Engine::open(ibx_core::Settings::rooted(root.path())).unwrap();
    let snap = engine.backup_status(BACKUP_ID).unwrap();
    assert_eq!(snap.decryption_status, DecryptionStatus::Decrypted);
    assert!(snap.last_indexed_at.is_some());
    assert_eq!(snap.status, BackupStatus::Indexed);
    // Contexts are memory-only.
    assert!(matches!(engine.run_index(BACKUP_ID), Err(IbxError::SessionRequired(_))));
}

#[test]
fn unknown_backup_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(&root);
    assert!(engine.list_backups().is_empty());
    assert!(matches!(engine.unlock("ghost", "pw"), Err(IbxError::NotFound(_))));
    assert!(matches!(engine.backup_status("ghost"), Err(IbxError::NotFound(_))));
}
