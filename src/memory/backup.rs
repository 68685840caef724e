//! On-disk backup generations of the local replica.
//!
//! Each backup is one pretty-printed JSON file carrying the entries and a
//! SHA-256 checksum over their canonical JSON encoding.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use super::entry::MemoryEntry;

const BACKUP_PREFIX: &str = "backup-";
const BACKUP_SUFFIX: &str = ".json";
const ID_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%3f";

static BACKUP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupFile {
    id: String,
    created_at: DateTime<Utc>,
    entry_count: usize,
    checksum: String,
    entries: Vec<MemoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub entry_count: usize,
    pub checksum: String,
}

pub fn checksum(entries: &[MemoryEntry]) -> Result<String> {
    let body = serde_json::to_vec(entries).context("serialize backup entries")?;
    Ok(hex::encode(Sha256::digest(&body)))
}

/// Write a new backup generation into `dir`.
pub fn write_backup(dir: &Path, mut entries: Vec<MemoryEntry>) -> Result<BackupInfo> {
    fs::create_dir_all(dir)
        .with_context(|| format!("create backup dir '{}'", dir.display()))?;
    entries.sort_by(|a, b| {
        (a.namespace.as_str(), a.key.as_str()).cmp(&(b.namespace.as_str(), b.key.as_str()))
    });

    let created_at = Utc::now();
    let seq = BACKUP_SEQ.fetch_add(1, Ordering::SeqCst);
    let id = format!("{}-{seq:04}", created_at.format(ID_TIME_FORMAT));
    let file = BackupFile {
        id: id.clone(),
        created_at,
        entry_count: entries.len(),
        checksum: checksum(&entries)?,
        entries,
    };
    let path = dir.join(format!("{BACKUP_PREFIX}{id}{BACKUP_SUFFIX}"));
    let body = serde_json::to_vec_pretty(&file).context("serialize backup")?;
    fs::write(&path, body)
        .with_context(|| format!("failed writing backup '{}'", path.display()))?;

    Ok(BackupInfo {
        id,
        path,
        created_at,
        entry_count: file.entry_count,
        checksum: file.checksum,
    })
}

fn load(path: &Path) -> Result<BackupFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading backup '{}'", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing backup '{}'", path.display()))
}

/// Sort key of a backup id: creation time, milliseconds, sequence number.
fn id_order(id: &str) -> Option<(NaiveDateTime, u32, u64)> {
    let (stamp, seq) = id.rsplit_once('-')?;
    if stamp.len() < 3 || !stamp.is_ascii() {
        return None;
    }
    let (seconds, millis) = stamp.split_at(stamp.len() - 3);
    let at = NaiveDateTime::parse_from_str(seconds, "%Y%m%dT%H%M%S").ok()?;
    Some((at, millis.parse().ok()?, seq.parse().ok()?))
}

/// Backup ids and paths in `dir`, oldest first, taken from file names alone.
/// Files that only look like backups are skipped with a warning.
fn generations(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for dirent in
        fs::read_dir(dir).with_context(|| format!("read backup dir '{}'", dir.display()))?
    {
        let path = dirent?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(id) = name
            .strip_prefix(BACKUP_PREFIX)
            .and_then(|rest| rest.strip_suffix(BACKUP_SUFFIX))
        else {
            continue;
        };
        match id_order(id) {
            Some(order) => out.push((order, id.to_string(), path)),
            None => warn!(path = %path.display(), "ignoring file with unrecognized backup name"),
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out.into_iter().map(|(_, id, path)| (id, path)).collect())
}

/// Backups in `dir`, oldest first. A missing directory has none; unreadable
/// generations are skipped with a warning.
pub fn list_backups(dir: &Path) -> Result<Vec<BackupInfo>> {
    let mut out = Vec::new();
    for (id, path) in generations(dir)? {
        match load(&path) {
            Ok(file) => out.push(BackupInfo {
                id,
                path,
                created_at: file.created_at,
                entry_count: file.entry_count,
                checksum: file.checksum,
            }),
            Err(err) => warn!(error = %format!("{err:#}"), "skipping unreadable backup"),
        }
    }
    Ok(out)
}

/// Remove the oldest generations so at most `keep` remain. Unreadable
/// generations count toward the limit and are pruned like any other.
pub fn prune_backups(dir: &Path, keep: usize) -> Result<usize> {
    let backups = generations(dir)?;
    let excess = backups.len().saturating_sub(keep);
    for (_, path) in backups.iter().take(excess) {
        fs::remove_file(path)
            .with_context(|| format!("remove old backup '{}'", path.display()))?;
    }
    Ok(excess)
}

/// Read a backup by id and verify its checksum.
pub fn read_backup(dir: &Path, id: &str) -> Result<Vec<MemoryEntry>> {
    let path = dir.join(format!("{BACKUP_PREFIX}{id}{BACKUP_SUFFIX}"));
    let file = load(&path)?;
    let actual = checksum(&file.entries)?;
    if actual != file.checksum {
        return Err(anyhow!(
            "backup '{}' checksum mismatch: recorded {}, computed {}",
            path.display(),
            file.checksum,
            actual
        ));
    }
    Ok(file.entries)
}
