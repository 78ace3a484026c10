/*
   R Environment Manager identity orchestration
   Copyright (C) R Environment Manager developers 2026

   This program is free software; you can redistribute it and/or modify
   it under the terms of the GNU General Public License as published by
   the Free Software Foundation; either version 3 of the License, or
   (at your option) any later version.

   This program is distributed in the hope that it will be useful,
   but WITHOUT ANY WARRANTY; without even the implied warranty of
   MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
   GNU General Public License for more details.

   You should have received a copy of the GNU General Public License
   along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/
use crate::constants::{BACKUP_SESSION_PREFIX, DIAGNOSTICS_FILE, LEDGER_INDEX_FILE};
use crate::error::{AuthError, FailureKind};
use crate::host::{Diagnostic, Host};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;
use walkdir::WalkDir;

/// A rendered file waiting to be deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    /// System path, resolved beneath the host root at write time.
    pub path: String,
    pub contents: String,
    pub mode: u32,
}

impl RenderedConfig {
    pub fn new(path: &str, contents: String, mode: u32) -> Self {
        RenderedConfig {
            path: path.to_string(),
            contents,
            mode,
        }
    }
}

/// One copy taken before a tracked file was replaced or removed. Records
/// are append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub original_path: String,
    pub backup_path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub session: String,
}

/// Why an operation aborted, with the files it was working on as they are
/// now.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub operation: String,
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
    pub files: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Unchanged,
    Created,
    Replaced(BackupRecord),
}

/// Writes `contents` to a temporary file beside `dest` and renames it into
/// place, so readers see either the old file or the complete new one.
pub fn atomic_write(dest: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    fs::File::open(parent)?.sync_all()
}

fn session_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!(
        "{}{}_{}",
        BACKUP_SESSION_PREFIX,
        Utc::now().format("%Y%m%d_%H%M%S"),
        &id[..8]
    )
}

/// The session-scoped backup area. Every destructive change to a tracked
/// file goes through here; each session owns its own directory and index.
pub struct BackupLedger<'a> {
    host: &'a Host<'a>,
    session_dir: PathBuf,
    session: String,
    records: Vec<BackupRecord>,
    fail_writes: bool,
}

impl<'a> BackupLedger<'a> {
    /// Starts a new session beneath `base`, a system path.
    pub fn open_session(host: &'a Host<'a>, base: &Path) -> Result<Self, AuthError> {
        let session = session_name();
        let session_dir = host.path(base).join(&session);
        fs::create_dir_all(&session_dir).map_err(|e| AuthError::ledger(&session_dir, e))?;
        info!("Backup session {}", session_dir.display());
        Ok(BackupLedger {
            host,
            session_dir,
            session,
            records: vec![],
            fail_writes: false,
        })
    }

    pub fn host(&self) -> &'a Host<'a> {
        self.host
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    /// Makes every following write fail after its backup is taken and
    /// before the destination is touched.
    #[doc(hidden)]
    pub fn inject_write_failure(&mut self) {
        self.fail_writes = true;
    }

    fn backup_slot(&self, original: &str) -> PathBuf {
        let rel = original.trim_start_matches('/');
        let first = self.session_dir.join(rel);
        if !first.exists() {
            return first;
        }
        let mut n = 1;
        loop {
            let candidate = self.session_dir.join(format!("{}.~{}~", rel, n));
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }

    fn append_index(&self, record: &BackupRecord) -> Result<(), AuthError> {
        let index = self.session_dir.join(LEDGER_INDEX_FILE);
        let line = serde_json::to_string(record)
            .map_err(|e| AuthError::ledger(&index, io::Error::other(e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .map_err(|e| AuthError::ledger(&index, e))?;
        writeln!(file, "{}", line).map_err(|e| AuthError::ledger(&index, e))?;
        file.sync_all().map_err(|e| AuthError::ledger(&index, e))
    }

    /// Copies the current file at `original` into the session. A file that
    /// does not exist has nothing to back up.
    pub fn backup(&mut self, original: &str) -> Result<Option<BackupRecord>, AuthError> {
        let source = self.host.path(original);
        if !source.is_file() {
            return Ok(None);
        }
        let dest = self.backup_slot(original);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| AuthError::ledger(parent, e))?;
        }
        fs::copy(&source, &dest).map_err(|e| AuthError::ledger(&dest, e))?;
        let record = BackupRecord {
            original_path: original.to_string(),
            backup_path: dest,
            timestamp: Utc::now(),
            session: self.session.clone(),
        };
        self.append_index(&record)?;
        debug!(
            path = %original,
            backup = %record.backup_path.display(),
            "Backed up"
        );
        self.records.push(record.clone());
        Ok(Some(record))
    }

    /// Backs up the destination, then replaces it atomically. On failure the
    /// destination is left exactly as it was.
    pub fn write_with_backup(&mut self, config: &RenderedConfig) -> Result<WriteOutcome, AuthError> {
        let dest = self.host.path(&config.path);
        if let Ok(current) = fs::read(&dest) {
            let mode = fs::metadata(&dest)
                .map(|m| m.permissions().mode() & 0o7777)
                .unwrap_or(0);
            if current == config.contents.as_bytes() && mode == config.mode {
                debug!("{} is already up to date", config.path);
                return Ok(WriteOutcome::Unchanged);
            }
        }

        let record = self.backup(&config.path)?;
        let written = if self.fail_writes {
            Err(io::Error::other("injected write failure"))
        } else {
            atomic_write(&dest, config.contents.as_bytes(), config.mode)
        };
        if let Err(source) = written {
            error!("Failed to write {}: {}", config.path, source);
            return Err(AuthError::SynthesisWriteFailed {
                path: PathBuf::from(&config.path),
                source,
            });
        }
        info!("Wrote {}", config.path);
        Ok(match record {
            Some(record) => WriteOutcome::Replaced(record),
            None => WriteOutcome::Created,
        })
    }

    pub fn remove_with_backup(&mut self, original: &str) -> Result<Option<BackupRecord>, AuthError> {
        let record = match self.backup(original)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let path = self.host.path(original);
        fs::remove_file(&path).map_err(|source| AuthError::SynthesisWriteFailed {
            path: PathBuf::from(original),
            source,
        })?;
        info!("Removed {}", original);
        Ok(Some(record))
    }

    /// Puts the copy held by `record` back in place. Whatever is there now
    /// is backed up into this session first.
    pub fn restore(&mut self, record: &BackupRecord) -> Result<(), AuthError> {
        let contents =
            fs::read(&record.backup_path).map_err(|e| AuthError::ledger(&record.backup_path, e))?;
        let mode = fs::metadata(&record.backup_path)
            .map(|m| m.permissions().mode() & 0o7777)
            .map_err(|e| AuthError::ledger(&record.backup_path, e))?;
        self.backup(&record.original_path)?;
        atomic_write(&self.host.path(&record.original_path), &contents, mode).map_err(
            |source| AuthError::SynthesisWriteFailed {
                path: PathBuf::from(&record.original_path),
                source,
            },
        )?;
        info!(
            "Restored {} from {}",
            record.original_path,
            record.backup_path.display()
        );
        Ok(())
    }

    /// Returns files changed by one stage to their state before it ran:
    /// replaced files come back from their backups, created files go away.
    pub fn rollback(&mut self, changes: &[(String, WriteOutcome)]) -> Vec<AuthError> {
        let mut errors = vec![];
        for (path, outcome) in changes.iter().rev() {
            let res = match outcome {
                WriteOutcome::Unchanged => Ok(()),
                WriteOutcome::Created => fs::remove_file(self.host.path(path))
                    .map(|_| info!("Rolled back {} (removed)", path))
                    .map_err(|source| AuthError::SynthesisWriteFailed {
                        path: PathBuf::from(path),
                        source,
                    }),
                WriteOutcome::Replaced(record) => {
                    let record = record.clone();
                    self.restore(&record)
                }
            };
            if let Err(e) = res {
                error!("Rollback of {} failed: {}", path, e);
                errors.push(e);
            }
        }
        errors
    }

    /// Keeps a JSON document (e.g. a diagnostic bundle) in the session.
    pub fn retain_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf, AuthError> {
        let path = self.session_dir.join(name);
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| AuthError::ledger(&path, io::Error::other(e)))?;
        atomic_write(&path, &body, 0o600).map_err(|e| AuthError::ledger(&path, e))?;
        Ok(path)
    }

    /// Keeps the failure of `operation` in the session as the diagnostic
    /// bundle.
    pub fn retain_failure(
        &self,
        operation: &str,
        err: &AuthError,
        files: &[String],
    ) -> Result<PathBuf, AuthError> {
        let record = FailureRecord {
            operation: operation.to_string(),
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now(),
            files: files.iter().map(|f| self.host.file_diagnostic(f)).collect(),
        };
        self.retain_json(DIAGNOSTICS_FILE, &record)
    }

    /// Copies every existing target (files and whole directories) into the
    /// session, keeping the directory hierarchy.
    pub fn snapshot(&mut self, targets: &[&str]) -> Result<usize, AuthError> {
        let mut copied = 0;
        for target in targets {
            let full = self.host.path(target);
            if !full.exists() {
                debug!("Skipping {}: path does not exist", target);
                continue;
            }
            if full.is_file() {
                if self.backup(target)?.is_some() {
                    copied += 1;
                }
                continue;
            }
            for entry in WalkDir::new(&full).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        error!("Failed to walk {}: {}", target, e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = match entry.path().strip_prefix(self.host.root()) {
                    Ok(rel) => format!("/{}", rel.display()),
                    Err(_) => continue,
                };
                if self.backup(&rel)?.is_some() {
                    copied += 1;
                }
            }
        }
        info!("Snapshot finished: {} files secured", copied);
        Ok(copied)
    }
}

fn session_dirs(base: &Path) -> Result<Vec<PathBuf>, AuthError> {
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(AuthError::ledger(base, e)),
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|n| n.starts_with(BACKUP_SESSION_PREFIX))
                .unwrap_or(false)
        })
        .map(|e| e.path())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Every record in every session beneath `base` (a resolved path), oldest
/// session first.
pub fn list_records(base: &Path) -> Result<Vec<BackupRecord>, AuthError> {
    let mut records = vec![];
    for dir in session_dirs(base)? {
        let index = dir.join(LEDGER_INDEX_FILE);
        let file = match fs::File::open(&index) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(AuthError::ledger(&index, e)),
        };
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| AuthError::ledger(&index, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BackupRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping malformed ledger entry in {}: {}", index.display(), e),
            }
        }
    }
    Ok(records)
}

/// The most recent backup of `original` across all sessions.
pub fn latest_record(base: &Path, original: &str) -> Result<Option<BackupRecord>, AuthError> {
    Ok(list_records(base)?
        .into_iter()
        .filter(|r| r.original_path == original)
        .max_by_key(|r| r.timestamp))
}

/// Removes all but the newest `keep` sessions.
pub fn prune_sessions(base: &Path, keep: usize) -> Result<Vec<PathBuf>, AuthError> {
    let dirs = session_dirs(base)?;
    let excess = dirs.len().saturating_sub(keep.max(1));
    let mut removed = vec![];
    for dir in dirs.into_iter().take(excess) {
        info!("Rotating old backup: {}", dir.display());
        fs::remove_dir_all(&dir).map_err(|e| AuthError::ledger(&dir, e))?;
        removed.push(dir);
    }
    Ok(removed)
}
