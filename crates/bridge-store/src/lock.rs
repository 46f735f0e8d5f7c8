//! Sidecar exclusivity lock (§4.8): a zero-byte `<db_path>.lock` file taken with `O_EXCL`
//! semantics so a second bridge process can't open the same buffer out from under the first.
//! SQLite's own file locking only guards individual transactions, not "is another whole
//! process already driving this buffer", hence the separate marker file.

use anyhow::Context;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Held for the lifetime of a `StorePools`; removes the marker file on drop so a clean
/// shutdown releases it immediately instead of waiting for an OS-level flock to expire.
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    pub fn acquire(db_path: &Path) -> anyhow::Result<Self> {
        let path = lock_path(db_path);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| {
                format!(
                    "another bridge process already holds {} — is the bridge already running against this buffer?",
                    path.display()
                )
            })?;
        Ok(Self { path })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut os_string = db_path.as_os_str().to_owned();
    os_string.push(".lock");
    PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = std::env::temp_dir().join(format!("bridge-store-lock-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let db_path = dir.join("buffer.db");

        let first = ProcessLock::acquire(&db_path).unwrap();
        assert!(ProcessLock::acquire(&db_path).is_err());
        drop(first);
        assert!(ProcessLock::acquire(&db_path).is_ok());

        let _ = std::fs::remove_file(lock_path(&db_path));
        let _ = std::fs::remove_dir(&dir);
    }
}
