//! Mutual exclusion helpers.
//!
//! [`FileLock`] serializes separate processes sharing a directory (an fs2
//! advisory lock on a `.lock` file); [`KeyedLocks`] serializes tasks within
//! one process by key.

use anyhow::Context;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::hash::Hash;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const LOCK_RETRY: Duration = Duration::from_millis(100);

pub const LOCK_FILE: &str = ".lock";

/// Exclusive advisory lock on `<dir>/.lock`, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: std::fs::File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FileLock {
    fn open(dir: &Path) -> anyhow::Result<std::fs::File> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let lock_path = dir.join(LOCK_FILE);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open {}", lock_path.display()))
    }

    fn try_take(file: &std::fs::File) -> anyhow::Result<bool> {
        match FileExt::try_lock_exclusive(file) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Block the current thread until the lock is held or `timeout` passes.
    pub fn acquire(dir: &Path, timeout: Duration) -> anyhow::Result<Self> {
        let file = Self::open(dir)?;
        let start = Instant::now();
        while !Self::try_take(&file)? {
            if start.elapsed() >= timeout {
                return Err(anyhow::anyhow!(
                    "Timed out waiting for lock on {} ({}s)",
                    dir.display(),
                    timeout.as_secs()
                ));
            }
            std::thread::sleep(LOCK_RETRY);
        }
        Ok(Self { file })
    }

    /// Async variant of [`FileLock::acquire`]; waits without blocking a worker.
    pub async fn acquire_async(dir: &Path, timeout: Duration) -> anyhow::Result<Self> {
        let file = Self::open(dir)?;
        let start = Instant::now();
        while !Self::try_take(&file)? {
            if start.elapsed() >= timeout {
                return Err(anyhow::anyhow!(
                    "Timed out waiting for lock on {} ({}s)",
                    dir.display(),
                    timeout.as_secs()
                ));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
        Ok(Self { file })
    }
}

/// One async mutex per key, created on first use.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Wait for exclusive use of `key`.
    pub async fn lock(&self, key: &K) -> tokio::sync::OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn second_file_lock_times_out_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let held = FileLock::acquire(dir.path(), Duration::from_secs(1)).unwrap();
        let err = FileLock::acquire(dir.path(), Duration::from_millis(250)).unwrap_err();
        assert!(err.to_string().contains("Timed out"));
        drop(held);
        assert!(FileLock::acquire(dir.path(), Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn keyed_locks_serialize_same_key_only() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let a = locks.lock(&"a".to_string()).await;
        // A different key is free.
        let _b = locks.lock(&"b".to_string()).await;

        let entered = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let locks = locks.clone();
            let entered = entered.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&"a".to_string()).await;
                entered.fetch_add(1, Ordering::SeqCst);
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 0);
        drop(a);
        waiter.await.unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }
}
