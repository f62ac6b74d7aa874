//! Deployment Coordinator
//!
//! A pool of background workers draining the deployment queue. Each worker:
//! - blocks on the queue with a short timeout
//! - takes the per-project exclusion lock (a losing worker drops the job;
//!   a concurrent worker is already deploying that project)
//! - loads the project and runs the pipeline
//! - reconciles the counters and always releases the lock
//!
//! Shutdown is cooperative: workers observe the stop flag at the next
//! timeout boundary and in-flight deployments run to completion. Detached
//! tasks the pipeline spins off (old-container retirement, post-deploy
//! migration, prunes) are registered here so shutdown can join them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::pipeline::{DeployBackend, Pipeline, StatusStore};
use crate::project_store::ProjectStore;
use crate::queue::{
    DeploymentJob, JobQueue, COUNTER_COMPLETED, COUNTER_FAILED_DEPLOYMENT, COUNTER_FAILED_LOCK,
    COUNTER_FAILED_NOT_FOUND, COUNTER_SKIPPED_LOCKED,
};

/// Hard upper bound for a wedged deployment: after this the lock expires
/// and another worker may proceed.
pub const LOCK_TTL: Duration = Duration::from_secs(30 * 60);

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Detached task registry ────────────────────────────────────────────────

/// Named background tasks spawned during deployments. Registered so the
/// coordinator can join them on shutdown instead of abandoning them
/// mid-flight.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.inner.lock().unwrap();
        tasks.retain(|(_, handle)| !handle.is_finished());
        tasks.push((name.to_string(), handle));
    }

    /// Await every registered task. New tasks may be registered while this
    /// runs; callers should have stopped the producers first.
    pub async fn join_all(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.inner.lock().unwrap());
        for (name, handle) in tasks {
            if let Err(err) = handle.await {
                warn!(task = %name, %err, "Detached task aborted");
            }
        }
    }
}

// ─── Coordinator ───────────────────────────────────────────────────────────

pub struct Coordinator {
    stop: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    tasks: TaskRegistry,
}

impl Coordinator {
    /// Spawn `count` workers (at least one) against the queue.
    pub fn start<B, S>(
        count: usize,
        queue: JobQueue,
        store: ProjectStore,
        pipeline: Arc<Pipeline<B, S>>,
        tasks: TaskRegistry,
    ) -> Self
    where
        B: DeployBackend,
        S: StatusStore,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let count = count.max(1);

        let mut workers = Vec::with_capacity(count);
        for worker_id in 0..count {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                queue.clone(),
                store.clone(),
                pipeline.clone(),
                stop_rx.clone(),
            )));
        }

        info!(count, "Deployment coordinator started");
        Self {
            stop: stop_tx,
            workers,
            tasks,
        }
    }

    /// Signal the workers, wait for in-flight jobs, then join the detached
    /// tasks the pipelines left behind.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for handle in self.workers {
            let _ = handle.await;
        }
        self.tasks.join_all().await;
        info!("Deployment coordinator stopped");
    }
}

async fn worker_loop<B, S>(
    worker_id: usize,
    queue: JobQueue,
    store: ProjectStore,
    pipeline: Arc<Pipeline<B, S>>,
    stop: watch::Receiver<bool>,
) where
    B: DeployBackend,
    S: StatusStore,
{
    info!(worker_id, "Deployment worker started");

    loop {
        if *stop.borrow() {
            break;
        }

        match queue.dequeue(DEQUEUE_TIMEOUT).await {
            Ok(Some(job)) => process_job(worker_id, &queue, &store, &pipeline, job).await,
            Ok(None) => {}
            Err(err) => {
                error!(worker_id, %err, "Error dequeuing deployment job");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }

    info!(worker_id, "Deployment worker stopped");
}

async fn process_job<B, S>(
    worker_id: usize,
    queue: &JobQueue,
    store: &ProjectStore,
    pipeline: &Pipeline<B, S>,
    job: DeploymentJob,
) where
    B: DeployBackend,
    S: StatusStore,
{
    info!(
        worker_id,
        project_id = job.project_id,
        kind = %job.kind,
        queued_for = ?(chrono::Utc::now() - job.enqueued_at).to_std().unwrap_or_default(),
        "Processing deployment job"
    );

    let locked = match queue.acquire_lock(job.project_id, LOCK_TTL).await {
        Ok(locked) => locked,
        Err(err) => {
            error!(project_id = job.project_id, %err, "Failed to acquire deployment lock");
            queue.bump(COUNTER_FAILED_LOCK).await;
            return;
        }
    };

    if !locked {
        // Lost work is fine here: holding the lock means another worker is
        // already deploying this project.
        info!(
            project_id = job.project_id,
            "Project is already being deployed, skipping"
        );
        queue.bump(COUNTER_SKIPPED_LOCKED).await;
        return;
    }

    run_deployment(queue, store, pipeline, &job).await;

    if let Err(err) = queue.release_lock(job.project_id).await {
        warn!(project_id = job.project_id, %err, "Failed to release deployment lock");
    }
}

async fn run_deployment<B, S>(
    queue: &JobQueue,
    store: &ProjectStore,
    pipeline: &Pipeline<B, S>,
    job: &DeploymentJob,
) where
    B: DeployBackend,
    S: StatusStore,
{
    let project = match store.find(job.project_id).await {
        Ok(Some(project)) => project,
        Ok(None) => {
            warn!(project_id = job.project_id, "Project vanished before deployment");
            queue.bump(COUNTER_FAILED_NOT_FOUND).await;
            return;
        }
        Err(err) => {
            error!(project_id = job.project_id, %err, "Failed to load project");
            queue.bump(COUNTER_FAILED_NOT_FOUND).await;
            return;
        }
    };

    let started = std::time::Instant::now();
    match pipeline.deploy(&project).await {
        Ok(()) => {
            info!(
                project_id = project.id,
                name = %project.name,
                elapsed = ?started.elapsed(),
                "Deployment completed"
            );
            queue.bump(COUNTER_COMPLETED).await;
        }
        Err(_) => {
            // The pipeline already wrote status and error log.
            queue.bump(COUNTER_FAILED_DEPLOYMENT).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn registry_joins_registered_tasks() {
        let registry = TaskRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            registry.spawn("count", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        registry.join_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_waits_for_slow_tasks() {
        let registry = TaskRegistry::new();
        let done = Arc::new(AtomicUsize::new(0));

        let flag = done.clone();
        registry.spawn("slow", async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            flag.store(1, Ordering::SeqCst);
        });

        registry.join_all().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
