use super::EnvironmentKey;
use crate::lock::{FileLock, KeyedLocks};
use crate::sandbox::{Sandbox, SandboxHandle};
use crate::util::write_atomic;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Written into an entry directory once its build succeeded.
pub const MARKER_FILE: &str = "environment.json";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Builds each [`EnvironmentKey`] at most once and hands out exclusive leases.
///
/// Entries persist under `<root>/<key path>` until the directory is removed
/// by hand. A lease holds both an in-process lock and an fs2 lock on the
/// entry, so tasks sharing a key serialize whether they run in this process
/// or another one.
pub struct EnvironmentPool {
    root: PathBuf,
    sandbox: Arc<dyn Sandbox>,
    locks: KeyedLocks<EnvironmentKey>,
    lock_timeout: Duration,
}

/// Exclusive use of a built environment; released on drop.
pub struct EnvironmentLease {
    handle: SandboxHandle,
    fresh: bool,
    _file_lock: FileLock,
    _guard: OwnedMutexGuard<()>,
}

impl EnvironmentLease {
    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// True when this acquire performed the build.
    pub fn freshly_built(&self) -> bool {
        self.fresh
    }
}

impl EnvironmentPool {
    pub fn new(root: impl Into<PathBuf>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            root: root.into(),
            sandbox,
            locks: KeyedLocks::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    pub fn entry_dir(&self, key: &EnvironmentKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    fn cached(&self, key: &EnvironmentKey, dir: &Path) -> Option<SandboxHandle> {
        let content = std::fs::read_to_string(dir.join(MARKER_FILE)).ok()?;
        match serde_json::from_str::<SandboxHandle>(&content) {
            Ok(handle) if &handle.key == key => Some(handle),
            Ok(_) => {
                tracing::warn!(key = %key, "environment marker belongs to another key");
                None
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "unreadable environment marker");
                None
            }
        }
    }

    /// Lease the environment for `key`, building it from `source_dir` on a
    /// cache miss. The returned handle always points at `source_dir`.
    pub async fn acquire(
        &self,
        key: &EnvironmentKey,
        source_dir: &Path,
    ) -> Result<EnvironmentLease> {
        let guard = self.locks.lock(key).await;
        let dir = self.entry_dir(key);
        let file_lock = FileLock::acquire_async(&dir, self.lock_timeout)
            .await
            .with_context(|| format!("Failed to lock environment {}", key))?;

        if let Some(mut handle) = self.cached(key, &dir) {
            tracing::debug!(key = %key, "environment cache hit");
            handle.source_dir = source_dir.to_path_buf();
            return Ok(EnvironmentLease {
                handle,
                fresh: false,
                _file_lock: file_lock,
                _guard: guard,
            });
        }

        tracing::info!(key = %key, dir = %dir.display(), "building environment");
        let handle = self
            .sandbox
            .build_variant(key, source_dir, &dir)
            .await
            .with_context(|| format!("Failed to build environment {}", key))?;
        write_atomic(&dir.join(MARKER_FILE), &serde_json::to_string_pretty(&handle)?)?;

        Ok(EnvironmentLease {
            handle,
            fresh: true,
            _file_lock: file_lock,
            _guard: guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{ChallengeMode, Detection};
    use crate::environment::BuildVariant;
    use crate::outcome::{Diff, Outcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSandbox {
        builds: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Sandbox for CountingSandbox {
        async fn build_variant(
            &self,
            key: &EnvironmentKey,
            source_dir: &Path,
            artifact_dir: &Path,
        ) -> Result<SandboxHandle> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("compiler exploded");
            }
            std::fs::write(artifact_dir.join("artifact.bin"), key.variant.as_str())?;
            Ok(SandboxHandle {
                key: key.clone(),
                artifact_dir: artifact_dir.to_path_buf(),
                source_dir: source_dir.to_path_buf(),
            })
        }

        async fn classify(
            &self,
            _handle: &SandboxHandle,
            diff: &Diff,
            _detection: &Detection,
        ) -> Result<Outcome> {
            Ok(Outcome::Compilable { diff: diff.clone() })
        }

        async fn reproduce(
            &self,
            _handle: &SandboxHandle,
            _detection: &Detection,
        ) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn key(variant: BuildVariant) -> EnvironmentKey {
        EnvironmentKey::new(
            "demo",
            ChallengeMode::Full {
                base_ref: "c".repeat(40),
            },
            variant,
        )
    }

    #[tokio::test]
    async fn second_acquire_reuses_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(CountingSandbox::default());
        let pool = EnvironmentPool::new(dir.path(), sandbox.clone());
        let key = key(BuildVariant::Clean);

        let first = pool.acquire(&key, Path::new("/src/a")).await.unwrap();
        assert!(first.freshly_built());
        let first_dir = first.handle().artifact_dir.clone();
        drop(first);

        let second = pool.acquire(&key, Path::new("/src/b")).await.unwrap();
        assert!(!second.freshly_built());
        assert_eq!(second.handle().artifact_dir, first_dir);
        assert_eq!(second.handle().source_dir, PathBuf::from("/src/b"));
        assert_eq!(sandbox.builds.load(Ordering::SeqCst), 1);
        assert!(first_dir.join("artifact.bin").exists());
    }

    #[tokio::test]
    async fn cache_survives_a_new_pool_over_the_same_root() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(CountingSandbox::default());
        let key = key(BuildVariant::Debug);
        {
            let pool = EnvironmentPool::new(dir.path(), sandbox.clone());
            pool.acquire(&key, Path::new("/src")).await.unwrap();
        }
        let pool = EnvironmentPool::new(dir.path(), sandbox.clone());
        assert!(!pool.acquire(&key, Path::new("/src")).await.unwrap().freshly_built());
        assert_eq!(sandbox.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn variants_are_built_independently() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(CountingSandbox::default());
        let pool = EnvironmentPool::new(dir.path(), sandbox.clone());
        for variant in BuildVariant::all() {
            let lease = pool.acquire(&key(variant), Path::new("/src")).await.unwrap();
            assert!(lease.freshly_built());
        }
        assert_eq!(sandbox.builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_build_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(CountingSandbox {
            builds: AtomicUsize::new(0),
            fail: true,
        });
        let pool = EnvironmentPool::new(dir.path(), sandbox.clone());
        let key = key(BuildVariant::Clean);
        assert!(pool.acquire(&key, Path::new("/src")).await.is_err());
        assert!(pool.acquire(&key, Path::new("/src")).await.is_err());
        assert_eq!(sandbox.builds.load(Ordering::SeqCst), 2);
        assert!(!pool.entry_dir(&key).join(MARKER_FILE).exists());
    }

    #[tokio::test]
    async fn concurrent_acquires_of_one_key_build_once() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(CountingSandbox::default());
        let pool = Arc::new(EnvironmentPool::new(dir.path(), sandbox.clone()));
        let key = key(BuildVariant::Clean);
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    pool.acquire(&key, Path::new("/src")).await.map(|l| l.freshly_built())
                })
            })
            .collect();
        let mut fresh = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(sandbox.builds.load(Ordering::SeqCst), 1);
    }
}
