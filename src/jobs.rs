//! Periodic background jobs and the pool that runs them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ConfigStore;
use crate::server::TrustService;

#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn run(&self) -> anyhow::Result<()>;
}

/// Runs periodic jobs on its own threads of execution.
pub trait TaskPool: Send + Sync {
    fn schedule(&self, job: Arc<dyn PeriodicJob>);

    fn shutdown(&self);
}

/// Lets only one run of a job happen at a time.
#[derive(Default)]
pub struct ReentryGuard {
    running: AtomicBool,
}

impl ReentryGuard {
    /// Runs `f` unless a run is already in flight. Returns `None` when skipped.
    pub async fn run<F, T>(&self, f: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let _held = Held(&self.running);
        Some(f.await)
    }
}

/// Clears the running flag however the run ends, including a panic or the
/// future being dropped mid-run.
struct Held<'a>(&'a AtomicBool);

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One tokio task per job, ticking at the job's interval.
#[derive(Default)]
pub struct TokioTaskPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioTaskPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskPool for TokioTaskPool {
    fn schedule(&self, job: Arc<dyn PeriodicJob>) {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(job.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; jobs start one interval after boot
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = job.run().await {
                    error!("job {} failed: {e:#}", job.name());
                }
            }
        });
        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }
    }

    fn shutdown(&self) {
        if let Ok(mut handles) = self.handles.lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

/// Reloads the configuration store from its driver.
pub struct ConfigRefreshJob {
    store: Arc<ConfigStore>,
    guard: ReentryGuard,
}

impl ConfigRefreshJob {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            guard: ReentryGuard::default(),
        }
    }
}

#[async_trait]
impl PeriodicJob for ConfigRefreshJob {
    fn name(&self) -> &'static str {
        "config_refresh"
    }

    fn interval(&self) -> Duration {
        self.store.refresh_interval()
    }

    async fn run(&self) -> anyhow::Result<()> {
        match self.guard.run(self.store.load()).await {
            Some(result) => {
                result?;
                debug!("configuration refreshed");
            }
            None => debug!("configuration refresh already running, skipped"),
        }
        Ok(())
    }
}

/// Checks that the metadata store answers.
pub struct StorageHealthJob {
    trust: TrustService,
    interval: Duration,
    guard: ReentryGuard,
}

impl StorageHealthJob {
    pub fn new(trust: TrustService, interval: Duration) -> Self {
        Self {
            trust,
            interval,
            guard: ReentryGuard::default(),
        }
    }
}

#[async_trait]
impl PeriodicJob for StorageHealthJob {
    fn name(&self) -> &'static str {
        "storage_health"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> anyhow::Result<()> {
        if let Some(result) = self.guard.run(self.trust.check_health()).await {
            result?;
            debug!("metadata store is healthy");
        }
        Ok(())
    }
}

/// Schedule the standard jobs.
pub fn schedule_defaults(pool: &dyn TaskPool, config: Arc<ConfigStore>, trust: TrustService) {
    pool.schedule(Arc::new(ConfigRefreshJob::new(config)));
    pool.schedule(Arc::new(StorageHealthJob::new(trust, Duration::from_secs(60))));
    info!("periodic jobs scheduled");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{items, Driver, MemoryDriver, PasswordCipher, Registry, StaticKeyProvider};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicJob for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn pool_runs_jobs_until_shutdown() {
        let pool = TokioTaskPool::new();
        let job = Arc::new(Counter {
            runs: AtomicUsize::new(0),
        });
        pool.schedule(job.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown();
        let seen = job.runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {seen} times");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn guard_skips_overlapping_runs() {
        let guard = Arc::new(ReentryGuard::default());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let first = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.run(async { rx.await.ok() }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(guard.run(async {}).await.is_none());
        tx.send(()).unwrap();
        assert!(first.await.unwrap().is_some());
        assert!(guard.run(async {}).await.is_some());
    }

    #[tokio::test]
    async fn guard_is_released_when_a_run_is_cancelled() {
        let guard = Arc::new(ReentryGuard::default());
        let stuck = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.run(std::future::pending::<()>()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(guard.run(async {}).await.is_none());
        stuck.abort();
        assert!(stuck.await.unwrap_err().is_cancelled());
        assert!(guard.run(async {}).await.is_some());
    }

    #[tokio::test]
    async fn guard_is_released_when_a_run_panics() {
        let guard = Arc::new(ReentryGuard::default());
        let panicked = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.run(async { panic!("job blew up") }).await })
        };
        assert!(panicked.await.unwrap_err().is_panic());
        assert_eq!(guard.run(async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn refresh_job_picks_up_driver_changes() {
        let driver = Arc::new(MemoryDriver::new());
        let cipher = PasswordCipher::new(Arc::new(StaticKeyProvider(b"0123456789abcdef".to_vec())));
        let store = Arc::new(ConfigStore::new(Registry::global(), driver.clone(), cipher));
        driver
            .save(HashMap::from([(items::READ_ONLY.to_string(), "true".to_string())]))
            .await
            .unwrap();
        assert!(!store.read_only());
        ConfigRefreshJob::new(store.clone()).run().await.unwrap();
        assert!(store.read_only());
    }
}
