//! Background job engine: a registry of named cron jobs and the timing
//! thread that fires them.
//!
//! Callbacks run on the timing thread itself, one at a time. A callback
//! that returns an error is logged by the dispatch loop and never brings
//! the thread down. `shutdown()` joins the thread, which also waits for an
//! in-flight callback to finish.

use super::cron::CronExpr;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub type JobCallback = Box<dyn Fn() -> crate::Result<()> + Send + Sync>;

struct ScheduledJob {
    expr: CronExpr,
    callback: Arc<JobCallback>,
    next_fire: Option<DateTime<Utc>>,
}

struct Registry {
    jobs: Mutex<HashMap<String, ScheduledJob>>,
    wake: Condvar,
    shutdown: AtomicBool,
}

pub struct JobScheduler {
    registry: Arc<Registry>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new() -> Self {
        let registry = Arc::new(Registry {
            jobs: Mutex::new(HashMap::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let timer_registry = Arc::clone(&registry);
        let handle = std::thread::Builder::new()
            .name("cron-timer".to_string())
            .spawn(move || run_timer(timer_registry))
            .expect("failed to spawn cron timer thread");
        Self {
            registry,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Register a job, replacing any existing job with the same id.
    pub fn schedule(&self, id: impl Into<String>, expr: CronExpr, callback: JobCallback) {
        let id = id.into();
        let job = make_job(&id, expr, callback, Utc::now());
        self.registry.jobs.lock().unwrap().insert(id, job);
        self.registry.wake.notify_all();
    }

    /// Swap the whole registry for `jobs` in one step, so there is never a
    /// window with a partially-built job set.
    pub fn replace_all(&self, jobs: Vec<(String, CronExpr, JobCallback)>) {
        let now = Utc::now();
        let new_jobs: HashMap<String, ScheduledJob> = jobs
            .into_iter()
            .map(|(id, expr, callback)| {
                let job = make_job(&id, expr, callback, now);
                (id, job)
            })
            .collect();
        *self.registry.jobs.lock().unwrap() = new_jobs;
        self.registry.wake.notify_all();
    }

    /// Remove every job.
    pub fn clear(&self) {
        self.registry.jobs.lock().unwrap().clear();
        self.registry.wake.notify_all();
    }

    /// Currently registered job ids, sorted.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.jobs.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop firing and wait for the timing thread (and any in-flight
    /// callback) to finish. Idempotent.
    pub fn shutdown(&self) {
        self.registry.shutdown.store(true, Ordering::SeqCst);
        self.registry.wake.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Insert a job with an explicit first fire time. Lets tests exercise
    /// the dispatch loop without waiting for a real cron boundary.
    #[cfg(test)]
    fn schedule_at(
        &self,
        id: impl Into<String>,
        expr: CronExpr,
        at: DateTime<Utc>,
        callback: JobCallback,
    ) {
        let job = ScheduledJob {
            expr,
            callback: Arc::new(callback),
            next_fire: Some(at),
        };
        self.registry.jobs.lock().unwrap().insert(id.into(), job);
        self.registry.wake.notify_all();
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn make_job(id: &str, expr: CronExpr, callback: JobCallback, now: DateTime<Utc>) -> ScheduledJob {
    let next_fire = expr.next_after(now);
    if next_fire.is_none() {
        tracing::warn!(job = %id, "cron expression never matches, job will not fire");
    }
    ScheduledJob {
        expr,
        callback: Arc::new(callback),
        next_fire,
    }
}

fn run_timer(registry: Arc<Registry>) {
    let mut jobs = registry.jobs.lock().unwrap();
    loop {
        if registry.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let now = Utc::now();
        let mut due: Option<(String, Arc<JobCallback>)> = None;
        let mut nearest: Option<DateTime<Utc>> = None;
        for (id, job) in jobs.iter_mut() {
            match job.next_fire {
                Some(at) if at <= now => {
                    job.next_fire = job.expr.next_after(now);
                    due = Some((id.clone(), Arc::clone(&job.callback)));
                    break;
                }
                Some(at) => {
                    nearest = Some(nearest.map_or(at, |n| n.min(at)));
                }
                None => {}
            }
        }

        if let Some((id, callback)) = due {
            // Run without holding the registry lock, so reconciliation can
            // swap the job set while a task executes.
            drop(jobs);
            tracing::debug!(job = %id, "firing scheduled job");
            if let Err(e) = callback() {
                tracing::error!(job = %id, error = %e, "scheduled job failed");
            }
            jobs = registry.jobs.lock().unwrap();
            continue;
        }

        let wait = match nearest {
            Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
            None => Duration::from_secs(60),
        };
        let (guard, _) = registry
            .wake
            .wait_timeout(jobs, wait.max(Duration::from_millis(10)))
            .unwrap();
        jobs = guard;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
