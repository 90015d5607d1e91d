//! Advisory exclusive lock serializing sync runs over one cache root.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::StorageError;

pub const LOCK_FILE: &str = "index.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Return [`StorageError::LockContention`] immediately if another holder exists.
    FailFast,
    /// Retry with backoff until the timeout elapses.
    Wait(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Held for the duration of a sync run; released on drop, including when the
/// process dies and the OS closes the descriptor.
#[derive(Debug)]
pub struct IndexLock {
    file: File,
    path: PathBuf,
}

impl IndexLock {
    pub async fn acquire(
        path: impl AsRef<Path>,
        mode: LockMode,
        backoff: BackoffPolicy,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) if is_contended(&err) => {
                    let LockMode::Wait(timeout) = mode else {
                        return Err(StorageError::LockContention { path });
                    };
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        warn!(path = %path.display(), waited_ms = elapsed.as_millis() as u64, "gave up waiting for index lock");
                        return Err(StorageError::LockContention { path });
                    }
                    let delay = backoff
                        .delay_for_attempt(attempt.min(backoff.max_retries))
                        .min(timeout - elapsed);
                    debug!(path = %path.display(), attempt, delay_ms = delay.as_millis() as u64, "index lock busy; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        let mut lock = Self { file, path };
        if let Err(err) = lock.write_holder() {
            debug!(path = %lock.path.display(), error = %err, "could not record lock holder");
        }
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_holder(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(
            self.file,
            "pid={} acquired_at={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        )?;
        self.file.flush()
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release index lock");
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
