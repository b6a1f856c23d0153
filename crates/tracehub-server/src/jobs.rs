//! Background jobs that must run on at most one replica per trigger.
//!
//! Every replica schedules the same jobs on the same wall-clock grid:
//! trigger `n` of a job fires at `n * every` since the Unix epoch, whatever
//! the replica's start time. On each trigger a replica first claims the
//! trigger's key. The claim is never released and expires by itself, so a
//! replica that ticks late finds the trigger taken and skips it. The winner
//! then runs under the job's own lock, which keeps a slow run from
//! overlapping the next trigger's run. A job that outlives its lease may
//! briefly overlap with the next holder, so jobs must be idempotent.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracehub_coordination::{
    CoordinationError, CoordinationStore, Lock, LockOutcome, LockService, LockToken,
};
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait SingletonJob: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Fleet-wide lock guarding a run.
    fn lock_key(&self) -> Lock {
        Lock::from_parts(["job", self.name()])
    }

    /// Claim marking trigger `trigger` as taken by some replica.
    fn trigger_key(&self, trigger: u64) -> Lock {
        Lock::from_parts(["job", self.name(), "trigger", trigger.to_string().as_str()])
    }

    /// Lease covering one expected run.
    fn lease(&self) -> Duration;

    async fn run(&self) -> anyhow::Result<()>;
}

/// Run `job` once if no other replica is running it.
pub async fn run_once(
    locks: &LockService,
    job: &dyn SingletonJob,
) -> Result<LockOutcome<anyhow::Result<()>>, CoordinationError> {
    locks
        .execute_with_lock_custom_expire(&job.lock_key(), job.run(), job.lease())
        .await
}

/// Run `job` for wall-clock trigger `trigger` unless a replica already
/// claimed it.
///
/// The claim lives for `claim_ttl` and is not released after the run.
pub async fn run_for_trigger(
    locks: &LockService,
    job: &dyn SingletonJob,
    trigger: u64,
    claim_ttl: Duration,
) -> Result<LockOutcome<anyhow::Result<()>>, CoordinationError> {
    let claim = LockToken::new();
    if !locks
        .lock_using_token(&job.trigger_key(trigger), &claim, claim_ttl)
        .await?
    {
        return Ok(LockOutcome::Skipped);
    }
    run_once(locks, job).await
}

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

fn period_millis(every: Duration) -> u128 {
    every.as_millis().max(1)
}

/// Wait from `now` until the next multiple of `every` since the epoch.
fn delay_to_next_trigger(now: Duration, every: Duration) -> Duration {
    let every_ms = period_millis(every);
    let into_period = now.as_millis() % every_ms;
    Duration::from_millis(u64::try_from(every_ms - into_period).unwrap_or(u64::MAX))
}

/// Trigger nearest to `now`. Rounding absorbs a tick firing a little early
/// or late against the system clock.
fn trigger_at(now: Duration, every: Duration) -> u64 {
    let every_ms = period_millis(every);
    u64::try_from((now.as_millis() + every_ms / 2) / every_ms).unwrap_or(u64::MAX)
}

/// Spawn the trigger loop for `job`.
///
/// Ticks are anchored to the wall clock, so replicas started at different
/// times share triggers. The loop stops once `shutdown` reads `true` or its
/// sender is dropped. A panicking run is logged and the loop keeps ticking.
pub fn spawn_singleton_job(
    locks: LockService,
    job: Arc<dyn SingletonJob>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            job = job.name(),
            interval_ms = every.as_millis() as u64,
            "Singleton job scheduled"
        );

        let every = every.max(Duration::from_millis(1));
        let claim_ttl = every.saturating_mul(2);
        let start = Instant::now() + delay_to_next_trigger(since_epoch(), every);
        let mut ticker = interval_at(start, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let trigger = trigger_at(since_epoch(), every);
                    let run = AssertUnwindSafe(
                        run_for_trigger(&locks, job.as_ref(), trigger, claim_ttl),
                    )
                    .catch_unwind();
                    match run.await {
                        Ok(Ok(LockOutcome::Executed(Ok(())))) => {
                            debug!(job = job.name(), "Singleton job completed");
                        }
                        Ok(Ok(LockOutcome::Executed(Err(e)))) => {
                            error!(job = job.name(), error = %e, "Singleton job failed");
                        }
                        Ok(Ok(LockOutcome::Skipped)) => {
                            debug!(job = job.name(), trigger, "Singleton job taken elsewhere, skipped");
                        }
                        Ok(Err(e)) => {
                            warn!(job = job.name(), error = %e, "Could not take singleton job lock");
                        }
                        Err(_) => {
                            error!(job = job.name(), "Singleton job panicked");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(job = job.name(), "Singleton job stopped");
    })
}

/// Periodically drop expired entries from an in-process store.
///
/// Redis expires keys itself, so nothing is spawned for a Redis store.
pub fn spawn_store_cleanup(
    store: CoordinationStore,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if store.mode() != "local" {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = store.cleanup_expired();
                    if removed > 0 {
                        debug!(removed, "Expired local store entries removed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracehub_coordination::{LockConfig, LockToken};

    use super::*;

    /// Tracks how many runs overlap.
    struct ReportJob {
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        work: Duration,
    }

    impl ReportJob {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                work,
            })
        }
    }

    #[async_trait]
    impl SingletonJob for ReportJob {
        fn name(&self) -> &str {
            "daily_usage_report"
        }

        fn lease(&self) -> Duration {
            Duration::from_secs(30)
        }

        async fn run(&self) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingJob;

    #[async_trait]
    impl SingletonJob for FailingJob {
        fn name(&self) -> &str {
            "log_archive"
        }

        fn lease(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn run(&self) -> anyhow::Result<()> {
            anyhow::bail!("cold storage unreachable")
        }
    }

    fn replica(store: &CoordinationStore) -> LockService {
        LockService::new(store.clone(), &LockConfig::default())
    }

    #[tokio::test]
    async fn test_run_once_skips_when_locked() {
        let store = CoordinationStore::new_local();
        let locks = replica(&store);
        let job = ReportJob::new(Duration::ZERO);

        let holder = LockToken::new();
        assert!(
            locks
                .lock_using_token(&job.lock_key(), &holder, Duration::from_secs(30))
                .await
                .unwrap()
        );

        let outcome = run_once(&locks, job.as_ref()).await.unwrap();
        assert!(!outcome.is_executed());
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);

        locks.unlock_using_token(&job.lock_key(), &holder).await.unwrap();
        let outcome = run_once(&locks, job.as_ref()).await.unwrap();
        assert!(outcome.is_executed());
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_job_error_is_returned_and_lock_released() {
        let store = CoordinationStore::new_local();
        let locks = replica(&store);

        let outcome = run_once(&locks, &FailingJob).await.unwrap();
        let result = outcome.into_executed().expect("lock was free");
        assert!(result.unwrap_err().to_string().contains("cold storage"));

        let outcome = run_once(&locks, &FailingJob).await.unwrap();
        assert!(outcome.is_executed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replicas_never_overlap() {
        let store = CoordinationStore::new_local();
        let job = ReportJob::new(Duration::from_millis(40));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                spawn_singleton_job(
                    replica(&store),
                    job.clone(),
                    Duration::from_millis(10),
                    shutdown_rx.clone(),
                )
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("job loop stops on shutdown")
                .unwrap();
        }

        assert!(job.runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_triggers_follow_the_wall_clock_grid() {
        let every = Duration::from_millis(200);
        assert_eq!(
            delay_to_next_trigger(Duration::from_millis(1_050), every),
            Duration::from_millis(150)
        );
        assert_eq!(
            delay_to_next_trigger(Duration::from_millis(1_200), every),
            every
        );
        assert_eq!(trigger_at(Duration::from_millis(1_199), every), 6);
        assert_eq!(trigger_at(Duration::from_millis(1_203), every), 6);
        assert_eq!(trigger_at(Duration::from_millis(1_401), every), 7);
    }

    #[tokio::test]
    async fn test_trigger_runs_once_even_after_release() {
        let store = CoordinationStore::new_local();
        let job = ReportJob::new(Duration::ZERO);
        let first = replica(&store);
        let late = replica(&store);
        let ttl = Duration::from_secs(5);

        let outcome = run_for_trigger(&first, job.as_ref(), 42, ttl).await.unwrap();
        assert!(outcome.is_executed());

        // job lock is free again, the trigger claim is not
        let outcome = run_for_trigger(&late, job.as_ref(), 42, ttl).await.unwrap();
        assert!(!outcome.is_executed());

        let outcome = run_for_trigger(&late, job.as_ref(), 43, ttl).await.unwrap();
        assert!(outcome.is_executed());
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_staggered_replicas_share_triggers() {
        let store = CoordinationStore::new_local();
        let job = ReportJob::new(Duration::from_millis(5));
        let every = Duration::from_millis(200);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let boundary = || since_epoch().as_millis() / every.as_millis();
        let started = boundary();
        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(spawn_singleton_job(
                replica(&store),
                job.clone(),
                every,
                shutdown_rx.clone(),
            ));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let stopped = boundary();
        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("job loop stops on shutdown")
                .unwrap();
        }

        let triggers = (stopped - started) as u64;
        let runs = job.runs.load(Ordering::SeqCst) as u64;
        assert!(
            runs + 1 >= triggers && runs <= triggers + 1,
            "{runs} runs for {triggers} triggers"
        );
        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loop_stops_when_sender_dropped() {
        let store = CoordinationStore::new_local();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_singleton_job(
            replica(&store),
            Arc::new(FailingJob),
            Duration::from_millis(10),
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("job loop stops")
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_cleanup_only_for_local_store() {
        let store = CoordinationStore::new_local();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        store
            .set_if_absent("lock:transient", "token", Duration::from_millis(5))
            .await
            .unwrap();
        let handle = spawn_store_cleanup(store.clone(), Duration::from_millis(10), shutdown_rx)
            .expect("local store gets a cleanup task");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.cleanup_expired(), 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
