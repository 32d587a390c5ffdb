use std::io::{Read, Write};
use std::path::PathBuf;

use crate::presentation::cli::Unlock;
use ibx_core::bundle::info::BundleInfo;
use ibx_core::{
    BundleWriter, DecryptionStatus, Engine, FileFilter, IbxError, Result, Settings, WriteOptions,
};
use serde::Serialize;
use tracing::info;

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| IbxError::Format(format!("json output: {e}")))?;
    println!("{json}");
    Ok(())
}

/// Every invocation is its own process: open, rescan, and unlock as needed.
fn open(settings: Settings) -> Result<Engine> {
    let engine = Engine::open(settings)?;
    engine.discover()?;
    Ok(engine)
}

fn open_unlocked(settings: Settings, unlock: &Unlock) -> Result<(Engine, String)> {
    let engine = open(settings)?;
    let grant = engine.unlock(&unlock.backup, &unlock.password)?;
    Ok((engine, grant.session_token))
}

pub fn handle_scan(settings: Settings) -> Result<()> {
    let engine = Engine::open(settings)?;
    let diff = engine.discover()?;
    for id in &diff.missing {
        eprintln!("missing on disk: {id}");
    }
    print_json(&engine.list_backups())
}

pub fn handle_status(settings: Settings, backup: Option<String>) -> Result<()> {
    let engine = open(settings)?;
    match backup {
        Some(id) => print_json(&engine.backup_status(&id)?),
        None => print_json(&engine.list_backups()),
    }
}

pub fn handle_ls(settings: Settings, unlock: Unlock, filter: FileFilter) -> Result<()> {
    let (engine, token) = open_unlocked(settings, &unlock)?;
    let page = engine.list_files(&unlock.backup, &token, &filter)?;
    for e in &page.items {
        println!(
            "{}  {:>10}  {}/{}",
            e.file_id,
            e.size.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            e.domain,
            e.relative_path
        );
    }
    Ok(())
}

pub fn handle_domains(settings: Settings, unlock: Unlock) -> Result<()> {
    let (engine, token) = open_unlocked(settings, &unlock)?;
    for d in engine.list_domains(&unlock.backup, &token)? {
        println!("{d}");
    }
    Ok(())
}

pub fn handle_get(settings: Settings, unlock: Unlock, file_id: String, out: PathBuf) -> Result<()> {
    let (engine, token) = open_unlocked(settings, &unlock)?;
    let mut reader = engine.download_file(&unlock.backup, &token, &file_id)?;
    let mut file = std::fs::File::create(&out)?;
    let mut buf = [0u8; 256 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
    }
    file.sync_all()?;
    info!(file_id, bytes = reader.len(), out = %out.display(), "file written");
    Ok(())
}

pub fn handle_decrypt(settings: Settings, unlock: Unlock) -> Result<()> {
    let (engine, token) = open_unlocked(settings, &unlock)?;
    print_json(&engine.decrypt(&unlock.backup, &token)?)
}

pub fn handle_purge(settings: Settings, backup: String) -> Result<()> {
    let engine = open(settings)?;
    engine.delete_decrypted(&backup)?;
    print_json(&engine.backup_status(&backup)?)
}

pub fn handle_index(settings: Settings, unlock: Unlock) -> Result<()> {
    let (engine, token) = open_unlocked(settings, &unlock)?;
    if engine.backup_status(&unlock.backup)?.decryption_status != DecryptionStatus::Decrypted {
        engine.decrypt(&unlock.backup, &token)?;
    }
    let report = engine.run_index(&unlock.backup)?;
    print_json(&report)?;
    report.ensure_complete()
}

pub fn handle_extract(settings: Settings, unlock: Unlock, group: String) -> Result<()> {
    let (engine, token) = open_unlocked(settings, &unlock)?;
    print_json(&engine.extract(&unlock.backup, &token, &group)?)
}

pub fn handle_pack(
    src: PathBuf,
    out: PathBuf,
    device_id: Option<String>,
    name: Option<String>,
    password: Option<String>,
    min_gain: f32,
) -> Result<()> {
    let opts = WriteOptions {
        info: BundleInfo {
            unique_device_id: device_id,
            display_name: name,
            ..BundleInfo::default()
        },
        password,
        min_gain,
        ..WriteOptions::default()
    };
    let mut writer = BundleWriter::create(&out, opts)?;
    let files = writer.add_tree(&src)?;
    writer.finish()?;
    eprintln!("packed {files} files into {}", out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_tree_is_discovered() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("HomeDomain/Library/Notes")).unwrap();
        std::fs::write(src.join("HomeDomain/Library/Notes/a.txt"), b"note").unwrap();

        let settings = Settings::rooted(tmp.path());
        handle_pack(
            src,
            settings.backup_root.join("phone"),
            Some("dev-cli".into()),
            None,
            None,
            0.05,
        )
        .unwrap();

        let engine = open(settings).unwrap();
        let snap = engine.backup_status("dev-cli").unwrap();
        assert!(!snap.is_encrypted);
        assert_eq!(snap.display_name, "phone");
    }
}
