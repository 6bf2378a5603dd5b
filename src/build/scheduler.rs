use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::store::BuildTaskStore;
use super::task::BuildStatus;

/// Invoked once a task is dispatched. Runs the actual build (C2) and
/// must honor cancellation at its own safe points; the scheduler only
/// tracks queue/slot bookkeeping, not build semantics.
pub type BuildRunner =
    Arc<dyn Fn(String, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

struct QueueState {
    queues: HashMap<String, VecDeque<(u64, String)>>,
    active: HashSet<String>,
    seq: u64,
}

/// One FIFO queue per pipeline, a global worker pool of fixed size N
/// (spec §4.4). `Scheduler` only holds bookkeeping; `runner` is the
/// actual builder invocation supplied by the wiring code in `main.rs`.
pub struct Scheduler {
    state: Mutex<QueueState>,
    semaphore: Arc<Semaphore>,
    notify: Notify,
    store: Arc<BuildTaskStore>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
    tracker: TaskTracker,
    runner: BuildRunner,
}

impl Scheduler {
    pub fn new(worker_count: usize, store: Arc<BuildTaskStore>, runner: BuildRunner) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queues: HashMap::new(),
                active: HashSet::new(),
                seq: 0,
            }),
            semaphore: Arc::new(Semaphore::new(worker_count.max(1))),
            notify: Notify::new(),
            store,
            cancels: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            runner,
        })
    }

    /// Place `task_id` at the back of `pipeline_id`'s queue and nudge the
    /// dispatcher. Call `try_dispatch` (directly, not via a background
    /// loop) so enqueue callers observe dispatch synchronously when a
    /// worker is free — the same "enqueue, then try to run" shape the
    /// teacher uses for `ServiceSupervisor` spawns.
    pub async fn enqueue(self: &Arc<Self>, pipeline_id: &str, task_id: &str) {
        {
            let mut state = self.state.lock().await;
            let seq = state.seq;
            state.seq += 1;
            state
                .queues
                .entry(pipeline_id.to_string())
                .or_default()
                .push_back((seq, task_id.to_string()));
        }
        self.notify.notify_one();
        let this = self.clone();
        tokio::spawn(async move { this.try_dispatch().await });
    }

    /// Dispatch as many eligible pipelines as there are free permits.
    /// Eligible = not already active, head of queue exists. Among
    /// eligible pipelines, pick the smallest sequence number first
    /// (oldest head-of-queue task across pipelines, per spec §4.4).
    async fn try_dispatch(self: &Arc<Self>) {
        loop {
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => return,
            };

            let next = {
                let mut state = self.state.lock().await;
                let candidate = state
                    .queues
                    .iter()
                    .filter(|(pid, q)| !state.active.contains(*pid) && !q.is_empty())
                    .min_by_key(|(_, q)| q.front().map(|(seq, _)| *seq).unwrap_or(u64::MAX))
                    .map(|(pid, _)| pid.clone());

                match candidate {
                    Some(pid) => {
                        let (_, task_id) = state.queues.get_mut(&pid).unwrap().pop_front().unwrap();
                        state.active.insert(pid.clone());
                        Some((pid, task_id))
                    }
                    None => None,
                }
            };

            let Some((pipeline_id, task_id)) = next else {
                // No eligible work; release the permit we took speculatively.
                drop(permit);
                return;
            };

            self.spawn_worker(pipeline_id, task_id, permit);
        }
    }

    fn spawn_worker(self: &Arc<Self>, pipeline_id: String, task_id: String, permit: OwnedSemaphorePermit) {
        let this = self.clone();
        self.tracker.spawn(async move {
            let cancel = CancellationToken::new();
            this.cancels.lock().await.insert(task_id.clone(), cancel.clone());

            let _ = this.store.update_with(&task_id, |t| t.transition(BuildStatus::Running));

            // A panicking runner must not take the whole scheduler down
            // with it (spec §7's panic clause) — caught here and turned
            // into a failed task, the same as any other runner error.
            if AssertUnwindSafe((this.runner)(task_id.clone(), cancel))
                .catch_unwind()
                .await
                .is_err()
            {
                let _ = this.store.update_with(&task_id, |t| {
                    t.error = Some("build runner panicked".to_string());
                    t.transition(BuildStatus::Failed)
                });
            }

            this.cancels.lock().await.remove(&task_id);
            drop(permit);
            {
                let mut state = this.state.lock().await;
                state.active.remove(&pipeline_id);
            }
            this.notify.notify_one();
            this.try_dispatch().await;
        });
    }

    /// Signal cancellation to a running task's builder. Returns false if
    /// the task isn't currently running under this scheduler.
    pub async fn cancel(&self, task_id: &str) -> bool {
        if let Some(token) = self.cancels.lock().await.get(task_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Remove a still-queued task without consuming a worker slot
    /// (`pending →(cancel)→ stopped`, spec §4.4).
    pub async fn cancel_queued(&self, pipeline_id: &str, task_id: &str) -> bool {
        let mut state = self.state.lock().await;
        if let Some(queue) = state.queues.get_mut(pipeline_id) {
            let before = queue.len();
            queue.retain(|(_, id)| id != task_id);
            return queue.len() != before;
        }
        false
    }

    pub async fn queue_length(&self, pipeline_id: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(pipeline_id).map(|q| q.len()).unwrap_or(0)
    }

    pub async fn has_queued_tasks(&self, pipeline_id: &str) -> bool {
        self.queue_length(pipeline_id).await > 0
    }

    pub async fn is_active(&self, pipeline_id: &str) -> bool {
        self.state.lock().await.active.contains(pipeline_id)
    }

    /// Await all in-flight workers, used during graceful shutdown.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::task::{BuildTask, TriggerDetails, TriggerSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn task(id: &str, pipeline_id: &str) -> BuildTask {
        BuildTask {
            task_id: id.into(),
            pipeline_id: Some(pipeline_id.into()),
            trigger_source: TriggerSource::Manual,
            trigger_info: TriggerDetails::default(),
            branch: "main".into(),
            tag: "latest".into(),
            services: vec![],
            use_project_dockerfile: true,
            dockerfile_name: Some("Dockerfile".into()),
            template: None,
            template_params: serde_json::Value::Null,
            git_url: "https://example.com/r.git".into(),
            sub_path: None,
            project_type: None,
            resource_package_configs: vec![],
            status: BuildStatus::Pending,
            created_at: chrono::Utc::now(),
            triggered_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            log_path: format!("{id}.log"),
            error: None,
        }
    }

    #[tokio::test]
    async fn at_most_one_active_per_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BuildTaskStore::load(dir.path().to_path_buf()).unwrap());
        store.insert(task("t1", "p1")).unwrap();
        store.insert(task("t2", "p1")).unwrap();

        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let c1 = concurrent.clone();
        let m1 = max_concurrent.clone();

        let runner: BuildRunner = Arc::new(move |_task_id, _cancel| {
            let c = c1.clone();
            let m = m1.clone();
            Box::pin(async move {
                let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                c.fetch_sub(1, Ordering::SeqCst);
            })
        });

        let scheduler = Scheduler::new(4, store, runner);
        scheduler.enqueue("p1", "t1").await;
        scheduler.enqueue("p1", "t2").await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.shutdown().await;

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn global_cap_limits_concurrency_across_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BuildTaskStore::load(dir.path().to_path_buf()).unwrap());
        store.insert(task("t1", "p1")).unwrap();
        store.insert(task("t2", "p2")).unwrap();
        store.insert(task("t3", "p3")).unwrap();

        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let c1 = concurrent.clone();
        let m1 = max_concurrent.clone();
        let runner: BuildRunner = Arc::new(move |_task_id, _cancel| {
            let c = c1.clone();
            let m = m1.clone();
            Box::pin(async move {
                let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                c.fetch_sub(1, Ordering::SeqCst);
            })
        });

        let scheduler = Scheduler::new(2, store, runner);
        scheduler.enqueue("p1", "t1").await;
        scheduler.enqueue("p2", "t2").await;
        scheduler.enqueue("p3", "t3").await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown().await;

        assert!(max_concurrent.load(Ordering::SeqCst) <= 2);
    }
}
