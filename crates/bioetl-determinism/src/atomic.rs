//! Crash-safe file replacement.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DeterminismError, Result};

/// Write `bytes` to `path` via `.<name>.<run_id>.tmp` in the same directory,
/// fsync, then rename. The final path either keeps its old content or holds
/// the complete new content; the temp file never outlives a failure.
pub fn atomic_write(path: &Path, bytes: &[u8], run_id: &Uuid) -> Result<()> {
    let staged = stage(path, bytes, run_id)?;
    if let Err(e) = fs::rename(&staged.tmp, path) {
        let _ = fs::remove_file(&staged.tmp);
        return Err(integrity(path, e));
    }
    sync_dir(&staged.dir);
    debug!(path = %path.display(), bytes = bytes.len(), "Artifact written");
    Ok(())
}

/// Replace several files as one unit.
///
/// Every temp file is written and fsynced before the first rename. If a
/// write or rename fails, files already replaced get their previous content
/// back (or are removed when they did not exist before) and no temp or
/// backup file is left behind. Each individual path is still replaced by a
/// single rename, so a reader never sees a half-written file.
pub fn atomic_write_all(files: &[(&Path, &[u8])], run_id: &Uuid) -> Result<()> {
    let mut staged = Vec::with_capacity(files.len());
    for (path, bytes) in files {
        match stage(path, bytes, run_id) {
            Ok(s) => staged.push(s),
            Err(e) => {
                discard(&staged);
                return Err(e);
            }
        }
    }

    let mut committed: Vec<(&Staged, Option<PathBuf>)> = Vec::with_capacity(staged.len());
    for (i, s) in staged.iter().enumerate() {
        match commit(s, run_id) {
            Ok(backup) => committed.push((s, backup)),
            Err(e) => {
                rollback(&committed);
                discard(&staged[i..]);
                return Err(integrity(&s.path, e));
            }
        }
    }

    for (_, backup) in &committed {
        if let Some(b) = backup {
            let _ = fs::remove_file(b);
        }
    }
    let mut dirs: Vec<&Path> = staged.iter().map(|s| s.dir.as_path()).collect();
    dirs.sort();
    dirs.dedup();
    for dir in dirs {
        sync_dir(dir);
    }
    debug!(files = staged.len(), "Artifact set written");
    Ok(())
}

struct Staged {
    path: PathBuf,
    tmp: PathBuf,
    dir: PathBuf,
}

fn integrity(path: &Path, source: std::io::Error) -> DeterminismError {
    DeterminismError::WriteIntegrity {
        path: path.to_path_buf(),
        source,
    }
}

/// Write and fsync the temp sibling of `path`.
fn stage(path: &Path, bytes: &[u8], run_id: &Uuid) -> Result<Staged> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    fs::create_dir_all(&dir).map_err(|e| integrity(path, e))?;

    let tmp = sibling_path(&dir, path, run_id, "tmp");
    if let Err(e) = write_synced(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(integrity(path, e));
    }
    Ok(Staged { path: path.to_path_buf(), tmp, dir })
}

/// Rename the temp into place. An existing file is first hard-linked (or
/// copied) to a `.bak` sibling so it can be restored; the final path itself
/// is never absent.
fn commit(s: &Staged, run_id: &Uuid) -> std::io::Result<Option<PathBuf>> {
    let backup = if s.path.is_file() {
        let b = sibling_path(&s.dir, &s.path, run_id, "bak");
        let _ = fs::remove_file(&b);
        if fs::hard_link(&s.path, &b).is_err() {
            fs::copy(&s.path, &b)?;
        }
        Some(b)
    } else {
        None
    };
    if let Err(e) = fs::rename(&s.tmp, &s.path) {
        if let Some(b) = &backup {
            let _ = fs::remove_file(b);
        }
        return Err(e);
    }
    Ok(backup)
}

fn rollback(committed: &[(&Staged, Option<PathBuf>)]) {
    for (s, backup) in committed.iter().rev() {
        let restored = match backup {
            Some(b) => fs::rename(b, &s.path),
            None => fs::remove_file(&s.path),
        };
        if let Err(e) = restored {
            warn!(path = %s.path.display(), error = %e, "Could not roll back artifact");
        }
    }
}

fn discard(staged: &[Staged]) {
    for s in staged {
        let _ = fs::remove_file(&s.tmp);
    }
}

fn sibling_path(dir: &Path, path: &Path, run_id: &Uuid, ext: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    dir.join(format!(".{name}.{run_id}.{ext}"))
}

fn write_synced(tmp: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
