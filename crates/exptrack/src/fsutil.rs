use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tracing::warn;

use crate::error::{Error, Result};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// True for the hidden temp files `atomic_write_bytes` leaves behind when
/// interrupted before the rename.
pub fn is_atomic_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp.")
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn pid_is_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}

#[derive(Debug, Serialize, Deserialize)]
struct LockPayload {
    pid: u32,
    acquired_at: String,
}

/// Exclusive lock held through a create-exclusive sibling file; released on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Lock path guarding `target`.
    pub fn path_for(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("target");
        target.with_file_name(format!("{}.lock", name))
    }

    /// Guard taken while breaking a stale `lock`; only its holder may remove
    /// a lock it does not own.
    pub fn breaker_path_for(lock: &Path) -> PathBuf {
        let name = lock
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("target.lock");
        lock.with_file_name(format!("{}.break", name))
    }

    pub fn try_acquire(path: &Path) -> Result<Option<LockFile>> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let payload = LockPayload {
                    pid: std::process::id(),
                    acquired_at: Utc::now().to_rfc3339(),
                };
                let _ = file.write_all(&serde_json::to_vec(&payload)?);
                let _ = file.sync_all();
                Ok(Some(LockFile {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Waits up to `timeout` for the lock. A lock left behind by a process
    /// that no longer exists is broken instead of waited on.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<LockFile> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if lock_is_stale(path, timeout) && Self::break_stale(path, timeout)? {
                continue;
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Removes `path` if it is still stale once the breaker guard is held.
    /// Two waiters that both saw the same dead holder cannot both remove:
    /// the second one re-checks and finds the first one's live lock.
    fn break_stale(path: &Path, timeout: Duration) -> Result<bool> {
        let guard_path = Self::breaker_path_for(path);
        let guard = match Self::try_acquire(&guard_path)? {
            Some(guard) => guard,
            None => {
                if lock_is_stale(&guard_path, timeout) {
                    warn!(lock = %guard_path.display(), "removing abandoned lock breaker");
                    let _ = fs::remove_file(&guard_path);
                }
                return Ok(false);
            }
        };
        let broken = lock_is_stale(path, timeout);
        if broken {
            warn!(lock = %path.display(), "breaking stale lock");
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        drop(guard);
        Ok(broken)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path, timeout: Duration) -> bool {
    let payload = fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockPayload>(&bytes).ok());
    match payload {
        Some(p) => p.pid != std::process::id() && !pid_is_alive(p.pid),
        // Holder crashed between create and write: only trust the file age.
        None => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .map(|age| age > timeout)
            .unwrap_or(false),
    }
}

/// Recursively copies `src` into `dst`, skipping entries for which `exclude`
/// returns true (matched on the path relative to `src`).
pub fn copy_dir_filtered<F>(src: &Path, dst: &Path, exclude: F) -> Result<()>
where
    F: Fn(&Path) -> bool,
{
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        if rel.as_os_str().is_empty() {
            return true; // root entry
        }
        !exclude(rel)
    });
    for entry in walker {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content_without_leftovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("doc.yml");
        atomic_write_bytes(&target, b"a: 1\n").expect("first write");
        atomic_write_bytes(&target, b"a: 2\n").expect("second write");
        assert_eq!(fs::read_to_string(&target).unwrap(), "a: 2\n");
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["doc.yml".to_string()]);
    }

    #[test]
    fn lock_file_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = LockFile::path_for(&dir.path().join("experiment.yml"));
        assert!(path.ends_with("experiment.yml.lock"));

        let first = LockFile::acquire(&path, Duration::from_secs(1)).expect("first lock");
        let err = LockFile::acquire(&path, Duration::from_millis(120)).expect_err("second lock");
        assert!(matches!(err, Error::LockTimeout { .. }), "unexpected: {}", err);
        drop(first);
        let again = LockFile::acquire(&path, Duration::from_millis(120)).expect("re-acquire");
        drop(again);
        assert!(!path.exists());
    }

    #[test]
    fn lock_left_by_dead_process_is_broken() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("experiment.yml.lock");
        let payload = LockPayload {
            pid: u32::MAX - 1,
            acquired_at: Utc::now().to_rfc3339(),
        };
        fs::write(&path, serde_json::to_vec(&payload).unwrap()).unwrap();
        let lock = LockFile::acquire(&path, Duration::from_millis(200)).expect("stale lock broken");
        drop(lock);
    }

    #[test]
    fn stale_lock_admits_one_holder_at_a_time() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("experiment.yml.lock");
        let payload = LockPayload {
            pid: u32::MAX - 1,
            acquired_at: Utc::now().to_rfc3339(),
        };
        fs::write(&path, serde_json::to_vec(&payload).unwrap()).unwrap();

        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let inside = inside.clone();
                let overlaps = overlaps.clone();
                thread::spawn(move || {
                    let lock = LockFile::acquire(&path, Duration::from_secs(10)).expect("lock");
                    if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(20));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    drop(lock);
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(!path.exists());
        assert!(!LockFile::breaker_path_for(&path).exists());
    }

    #[test]
    fn copy_dir_filtered_skips_excluded_entries() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        fs::create_dir_all(src.path().join("n1")).unwrap();
        fs::write(src.path().join("n1/a.result"), "{}").unwrap();
        fs::write(src.path().join("keep.yml"), "x").unwrap();
        fs::write(src.path().join("skip.lock"), "x").unwrap();

        copy_dir_filtered(src.path(), dst.path(), |rel| {
            rel.extension().and_then(|e| e.to_str()) == Some("lock")
        })
        .expect("copy");

        assert!(dst.path().join("n1/a.result").is_file());
        assert!(dst.path().join("keep.yml").is_file());
        assert!(!dst.path().join("skip.lock").exists());
    }
}
