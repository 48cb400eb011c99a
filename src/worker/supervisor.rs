//! Worker supervisor
//!
//! A single polling loop that owns job scheduling and failure recovery:
//! stall detection (orphaned, stalled, hard-stalled), lease expiry, TTL
//! expiry, claiming queued jobs, spawning one crawl engine per claimed job,
//! and running finalization for jobs the engine left in `finalizing`.
//!
//! The supervisor is the sole author of transitions out of stuck engines;
//! the engine itself writes only `running -> finalizing` and the heartbeat
//! fields.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::crawl::{CrawlEngine, EngineConfig, EngineExit};
use crate::store::{StateUpdate, Store};
use crate::types::{EventLevel, Job, JobState};
use crate::worker::finalizer;

/// Supervisor over the store and the currently running engines
pub struct Supervisor {
    store: Arc<Store>,
    config: Arc<Config>,
    worker_id: String,
    engines: Arc<DashMap<String, JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(store: Arc<Store>, config: Arc<Config>) -> Self {
        Self {
            store,
            config,
            worker_id: format!("worker_{}", uuid::Uuid::new_v4().simple()),
            engines: Arc::new(DashMap::new()),
        }
    }

    /// Poll until the shutdown flag is raised.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        info!(
            worker = %self.worker_id,
            "Supervisor started (poll every {}s)",
            self.config.worker.poll_interval_secs
        );
        while !shutdown.load(Ordering::Relaxed) {
            self.tick(Utc::now()).await;
            tokio::time::sleep(Duration::from_secs(self.config.worker.poll_interval_secs)).await;
        }
        info!(worker = %self.worker_id, "Supervisor stopped");
    }

    /// One supervision pass. Public so tests can drive time explicitly.
    pub async fn tick(&self, now: DateTime<Utc>) {
        self.reap_finished_engines();
        self.handle_stuck_jobs(now);
        self.expire_leases(now);
        self.expire_jobs(now);
        self.claim_and_spawn();
        self.finalize_pending();
    }

    fn reap_finished_engines(&self) {
        self.engines.retain(|_, handle| !handle.is_finished());
    }

    /// Evaluate the stall rules for running jobs.
    pub fn handle_stuck_jobs(&self, now: DateTime<Utc>) {
        let worker = &self.config.worker;
        let mut handled: HashSet<String> = HashSet::new();

        match self
            .store
            .find_orphaned_jobs(now, worker.orphaned_threshold_secs)
        {
            Ok(jobs) => {
                for job in jobs {
                    if handled.insert(job.id.clone()) {
                        self.restart_or_fail(&job, "orphaned_no_heartbeat");
                    }
                }
            }
            Err(e) => error!("Orphan scan failed: {}", e),
        }

        match self
            .store
            .find_stalled_jobs(now, worker.stalled_threshold_secs)
        {
            Ok(jobs) => {
                for job in jobs {
                    if handled.insert(job.id.clone()) {
                        self.restart_or_fail(&job, "stalled_no_progress");
                    }
                }
            }
            Err(e) => error!("Stall scan failed: {}", e),
        }

        match self
            .store
            .find_hard_stalled_jobs(now, worker.hard_stalled_threshold_secs)
        {
            Ok(jobs) => {
                for job in jobs {
                    if handled.insert(job.id.clone()) {
                        // Zero pages after the threshold: no restart.
                        warn!(job = %job.id, "Hard stall, failing job");
                        self.stop_engine(&job.id);
                        self.fail_job(&job.id, "hard_stalled_zero_pages");
                    }
                }
            }
            Err(e) => error!("Hard-stall scan failed: {}", e),
        }
    }

    fn restart_or_fail(&self, job: &Job, reason: &str) {
        self.stop_engine(&job.id);
        if job.restart_count < self.config.worker.max_restarts {
            warn!(
                job = %job.id,
                reason,
                restarts = job.restart_count,
                "Stuck job, re-queueing"
            );
            if let Err(e) = self
                .store
                .set_state(&job.id, JobState::Queued, StateUpdate::default())
            {
                error!(job = %job.id, "Re-queue failed: {}", e);
                return;
            }
            let _ = self.store.increment_restart_count(&job.id);
            let _ = self.store.log_event(
                &job.id,
                EventLevel::Warn,
                "restart",
                Some(serde_json::json!({
                    "reason": reason,
                    "restart_count": job.restart_count + 1,
                })),
            );
        } else {
            warn!(job = %job.id, reason, "Stuck job out of restarts, failing");
            self.fail_job(&job.id, reason);
        }
    }

    fn fail_job(&self, job_id: &str, reason: &str) {
        if let Err(e) = self.store.set_state(
            job_id,
            JobState::Failed,
            StateUpdate {
                last_error: Some(reason.to_string()),
                ..Default::default()
            },
        ) {
            error!(job = %job_id, "Failed-state transition rejected: {}", e);
        }
    }

    /// Release frontier leases whose TTL elapsed.
    pub fn expire_leases(&self, now: DateTime<Utc>) {
        match self
            .store
            .expire_stale_leases(now, self.config.worker.max_retries)
        {
            Ok(0) => {}
            Ok(n) => info!("Released {} expired leases", n),
            Err(e) => error!("Lease expiry failed: {}", e),
        }
    }

    /// Expire jobs past their TTL, whatever their non-terminal state.
    pub fn expire_jobs(&self, now: DateTime<Utc>) {
        let jobs = match self.store.find_expired_jobs(now) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Expiry scan failed: {}", e);
                return;
            }
        };
        for job in jobs {
            warn!(job = %job.id, state = %job.state, "Job TTL elapsed, expiring");
            self.stop_engine(&job.id);
            if let Err(e) = self
                .store
                .set_state(&job.id, JobState::Expired, StateUpdate::default())
            {
                error!(job = %job.id, "Expire transition rejected: {}", e);
            }
        }
    }

    /// Claim one queued job if no engine is running, and start its engine.
    pub fn claim_and_spawn(&self) {
        if !self.engines.is_empty() {
            return;
        }
        let job = match self.store.claim_next_queued_job(&self.worker_id) {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!("Claim failed: {}", e);
                return;
            }
        };
        info!(job = %job.id, "Claimed job, starting engine");
        let handle = spawn_engine(Arc::clone(&self.store), Arc::clone(&self.config), job.clone());
        self.engines.insert(job.id, handle);
    }

    /// Run the finalizer for jobs a completed engine left in `finalizing`.
    pub fn finalize_pending(&self) {
        let jobs = match self.store.jobs_in_state(JobState::Finalizing) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Finalize scan failed: {}", e);
                return;
            }
        };
        for job in jobs {
            if self.engines.contains_key(&job.id) {
                // Engine task still winding down; pick it up next tick.
                continue;
            }
            if let Err(e) = finalizer::finalize_job(&self.store, &self.config, &job.id) {
                error!(job = %job.id, "Finalization failed: {}", e);
                self.fail_job(&job.id, &format!("finalization_failed: {}", e));
            }
        }
    }

    fn stop_engine(&self, job_id: &str) {
        if let Some((_, handle)) = self.engines.remove(job_id) {
            handle.abort();
        }
    }

    /// Currently running engine count (for tests and status surfaces).
    pub fn active_engines(&self) -> usize {
        self.engines.iter().filter(|e| !e.is_finished()).count()
    }
}

/// Run one engine to completion and translate its exit into job state.
fn spawn_engine(store: Arc<Store>, config: Arc<Config>, job: Job) -> JoinHandle<()> {
    tokio::spawn(async move {
        let job_id = job.id.clone();
        let engine_config = EngineConfig::from_config(&config, &job);
        let engine = match CrawlEngine::new(Arc::clone(&store), job, engine_config) {
            Ok(engine) => engine,
            Err(e) => {
                error!(job = %job_id, "Engine construction failed: {}", e);
                let _ = store.set_state(
                    &job_id,
                    JobState::Failed,
                    StateUpdate {
                        last_error: Some(e.to_string()),
                        ..Default::default()
                    },
                );
                return;
            }
        };
        match engine.run().await {
            // Engine has set finalizing; the supervisor tick finalizes.
            Ok(EngineExit::Finished) => {}
            Ok(EngineExit::Cancelled) => {
                // Cancel before any page: land in cancelled, but still
                // finalize so an (empty) artifact set exists.
                if let Err(e) =
                    store.set_state(&job_id, JobState::Cancelled, StateUpdate::default())
                {
                    error!(job = %job_id, "Cancel transition rejected: {}", e);
                    return;
                }
                if let Err(e) = finalizer::finalize_job(&store, &config, &job_id) {
                    warn!(job = %job_id, "Finalize after cancel failed: {}", e);
                }
            }
            Err(e) => {
                error!(job = %job_id, "Engine failed: {}", e);
                let _ = store.set_state(
                    &job_id,
                    JobState::Failed,
                    StateUpdate {
                        last_error: Some(e.to_string()),
                        ..Default::default()
                    },
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobSpec;
    use chrono::Duration as ChronoDuration;

    fn spec() -> JobSpec {
        JobSpec {
            start_url: "http://example.test/".to_string(),
            allowed_host: "example.test".to_string(),
            max_pages: 50,
            timeout_seconds: 1800,
            ignore_path_prefixes: vec![],
            use_js: false,
        }
    }

    fn supervisor() -> (Supervisor, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = Arc::new(Config::default());
        (Supervisor::new(Arc::clone(&store), config), store)
    }

    #[tokio::test]
    async fn hard_stalled_job_fails_without_restart() {
        let (supervisor, store) = supervisor();
        let job = store.create_job(spec(), "tok", 24).unwrap();
        store.claim_next_queued_job("w").unwrap();

        supervisor.handle_stuck_jobs(Utc::now() + ChronoDuration::seconds(181));

        let job = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("hard_stalled_zero_pages"));
        assert_eq!(job.restart_count, 0);
    }

    #[tokio::test]
    async fn orphaned_job_restarts_then_fails() {
        let (supervisor, store) = supervisor();
        let job = store.create_job(spec(), "tok", 24).unwrap();

        // Two restarts allowed; the third orphaning fails the job. Fetch a
        // page first so the hard-stall rule stays out of the way.
        for expected_restarts in 1..=2 {
            store.claim_next_queued_job("w").unwrap();
            store.heartbeat(&job.id, 1, 0).unwrap();
            supervisor.handle_stuck_jobs(Utc::now() + ChronoDuration::seconds(121));
            let job = store.get_job(&job.id).unwrap().unwrap();
            assert_eq!(job.state, JobState::Queued);
            assert_eq!(job.restart_count, expected_restarts);
        }

        store.claim_next_queued_job("w").unwrap();
        store.heartbeat(&job.id, 1, 0).unwrap();
        supervisor.handle_stuck_jobs(Utc::now() + ChronoDuration::seconds(121));
        let job = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("orphaned_no_heartbeat"));
    }

    #[tokio::test]
    async fn ttl_expiry_overrides_running_state() {
        let (supervisor, store) = supervisor();
        let job = store.create_job(spec(), "tok", 24).unwrap();
        store.claim_next_queued_job("w").unwrap();

        supervisor.expire_jobs(Utc::now() + ChronoDuration::hours(25));

        let job = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Expired);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn queued_job_expires_too() {
        let (supervisor, store) = supervisor();
        let job = store.create_job(spec(), "tok", 24).unwrap();
        supervisor.expire_jobs(Utc::now() + ChronoDuration::hours(25));
        assert_eq!(
            store.get_job(&job.id).unwrap().unwrap().state,
            JobState::Expired
        );
    }

    #[tokio::test]
    async fn finalize_pending_lands_jobs() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.output_dir = dir.path().to_path_buf();
        let supervisor = Supervisor::new(Arc::clone(&store), Arc::new(config));

        let job = store.create_job(spec(), "tok", 24).unwrap();
        store.claim_next_queued_job("w").unwrap();
        store
            .set_state(&job.id, JobState::Finalizing, StateUpdate::default())
            .unwrap();

        supervisor.finalize_pending();

        let job = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert!(!store.artifacts_for_job(&job.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn counters_freeze_after_supervisor_fails_job() {
        let (supervisor, store) = supervisor();
        let job = store.create_job(spec(), "tok", 24).unwrap();
        store.claim_next_queued_job("w").unwrap();
        supervisor.handle_stuck_jobs(Utc::now() + ChronoDuration::seconds(181));

        store.heartbeat(&job.id, 99, 99).unwrap();
        let job = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.pages_fetched, 0);
        assert_eq!(job.errors_count, 0);
    }
}
