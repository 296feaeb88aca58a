//! The launcher worker: the only component that starts external builds.
//!
//! One worker runs for the life of the process. It takes job ids off the run
//! queue one at a time, spawns the job's wrapper script detached, and polls the
//! job directory for the exit-code marker. Polling the filesystem instead of
//! holding a process handle lets a restarted process pick up builds that a
//! previous instance launched.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::job::{INTERRUPTED_EXIT_CODE, JobPaths, Liveness};
use crate::queue::RunQueue;
use crate::registry::{JobRegistry, Membership};

/// Starts the external process for a job.
pub trait ProcessSpawner: Send + Sync {
    /// Spawn the job's wrapper script without waiting for it.
    /// Returns the process id when one is known.
    fn spawn(&self, paths: &JobPaths) -> io::Result<Option<u32>>;
}

/// Runs `bash launcher.bash` inside the job directory.
#[derive(Debug, Clone)]
pub struct ShellSpawner {
    shell: String,
}

impl ShellSpawner {
    pub fn new() -> Self {
        Self {
            shell: "bash".to_string(),
        }
    }
}

impl Default for ShellSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSpawner for ShellSpawner {
    fn spawn(&self, paths: &JobPaths) -> io::Result<Option<u32>> {
        // The child is not killed on drop; tokio reaps it in the background.
        let mut command = tokio::process::Command::new(&self.shell);
        command
            .arg(paths.launcher_script())
            .current_dir(paths.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group: a Ctrl-C aimed at the server does not reach the build.
        #[cfg(unix)]
        command.process_group(0);
        let child = command.spawn()?;
        Ok(child.id())
    }
}

/// Handle to the running worker task.
pub struct WorkerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop the worker and wait for it to exit.
    ///
    /// A build already running keeps running; its exit marker is picked up
    /// by the next process instance.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "launcher worker task failed");
        }
    }
}

/// The single consumer of the run queue.
pub struct LauncherWorker {
    registry: Arc<JobRegistry>,
    queue: Arc<RunQueue>,
    spawner: Arc<dyn ProcessSpawner>,
    poll_interval: Duration,
    adopted: Vec<String>,
}

impl LauncherWorker {
    pub fn new(
        registry: Arc<JobRegistry>,
        queue: Arc<RunQueue>,
        spawner: Arc<dyn ProcessSpawner>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            spawner,
            poll_interval,
            adopted: Vec::new(),
        }
    }

    /// Jobs a previous process left running; waited on before new launches.
    pub fn adopt(mut self, running: Vec<String>) -> Self {
        self.adopted = running;
        self
    }

    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(token).await });
        WorkerHandle { cancel, task }
    }

    /// Worker main loop. Returns only when cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            adopted = self.adopted.len(),
            "launcher worker started"
        );

        for id in &self.adopted {
            info!(job_id = %id, "waiting on build left running by a previous instance");
            if !self.await_completion(id, &cancel).await {
                info!("launcher worker stopped");
                return;
            }
        }

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                next = self.queue.dequeue() => next,
            };
            let Some(id) = next else {
                break;
            };

            if !self.launch(&id) {
                continue;
            }
            if !self.await_completion(&id, &cancel).await {
                break;
            }
        }
        info!("launcher worker stopped");
    }

    /// Start one job. Returns whether a process is now running for it.
    fn launch(&self, id: &str) -> bool {
        let paths = self.registry.store().paths(id);
        self.registry.place(id, Membership::Running);

        match self.registry.update(id, |job| job.mark_running()) {
            Ok(Some(job)) => debug!(job_id = %id, status = %job.status, "marked job running"),
            Ok(None) => warn!(job_id = %id, "dequeued job has no status blob"),
            Err(e) => error!(job_id = %id, error = %e, "failed to record RUNNING state"),
        }

        let pid = match self.spawner.spawn(&paths) {
            Ok(pid) => pid,
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to launch build; job left RUNNING");
                return false;
            }
        };
        info!(job_id = %id, pid = ?pid, "launched custom synthesis build");

        if let Some(pid) = pid
            && let Err(e) = self
                .registry
                .store()
                .write_job_file(&paths.pid_file(), &format!("{}\n", pid))
        {
            warn!(job_id = %id, error = %e, "failed to record pid");
        }
        true
    }

    /// Poll until the exit marker appears, then record the outcome.
    ///
    /// A build whose recorded process has died without writing the marker
    /// is finished with [`INTERRUPTED_EXIT_CODE`]. Returns `false` if
    /// cancelled first.
    async fn await_completion(&self, id: &str, cancel: &CancellationToken) -> bool {
        let paths = self.registry.store().paths(id);
        let code = loop {
            if let Some(code) = paths.read_exit_code() {
                break code;
            }
            if paths.liveness() == Liveness::Dead {
                // The marker may have landed just before the process exited.
                if let Some(code) = paths.read_exit_code() {
                    break code;
                }
                warn!(job_id = %id, pid = ?paths.recorded_pid(), "build process exited without an exit code");
                if let Err(e) = std::fs::remove_file(paths.running_marker())
                    && e.kind() != io::ErrorKind::NotFound
                {
                    warn!(job_id = %id, error = %e, "failed to remove stale liveness marker");
                }
                break INTERRUPTED_EXIT_CODE;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        };
        self.finish(id, code);
        true
    }

    /// Record the exit code. Failures are logged; the worker must keep going.
    fn finish(&self, id: &str, code: i32) {
        match self.registry.update(id, |job| job.record_exit_code(code)) {
            Ok(Some(job)) => {
                let recorded = job.exit_code.unwrap_or(code);
                let set = if recorded == 0 {
                    Membership::Completed
                } else {
                    Membership::Erred
                };
                self.registry.place(id, set);
                info!(job_id = %id, exit_code = recorded, status = %job.status, "custom synthesis build finished");
            }
            Ok(None) => {
                warn!(job_id = %id, exit_code = code, "finished job has no status blob");
            }
            Err(e) => {
                error!(job_id = %id, exit_code = code, error = %e, "failed to record build outcome");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, JobStatus, LAUNCHER_SCRIPT};
    use crate::store::StatusStore;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Finishes each job immediately with a fixed exit code.
    struct InstantSpawner {
        code: i32,
        launched: Mutex<Vec<String>>,
    }

    impl ProcessSpawner for InstantSpawner {
        fn spawn(&self, paths: &JobPaths) -> io::Result<Option<u32>> {
            self.launched.lock().unwrap().push(paths.id().to_string());
            fs::write(paths.exit_code_file(), format!("{}\n", self.code))?;
            Ok(Some(4242))
        }
    }

    struct FailingSpawner;

    /// Reports a process id that is already gone and never writes a marker.
    struct VanishingSpawner;

    impl ProcessSpawner for VanishingSpawner {
        fn spawn(&self, _paths: &JobPaths) -> io::Result<Option<u32>> {
            Ok(Some(99_999_999))
        }
    }

    impl ProcessSpawner for FailingSpawner {
        fn spawn(&self, _paths: &JobPaths) -> io::Result<Option<u32>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no bash"))
        }
    }

    fn setup() -> (Arc<JobRegistry>, Arc<RunQueue>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = StatusStore::open(dir.path().join("jobs")).unwrap();
        (
            Arc::new(JobRegistry::new(store)),
            Arc::new(RunQueue::new()),
            dir,
        )
    }

    fn queue_job(registry: &JobRegistry, queue: &RunQueue, id: &str) {
        registry.store().create_job_dir(id).unwrap();
        fs::write(registry.store().paths(id).dir().join(LAUNCHER_SCRIPT), "").unwrap();
        registry.register_queued(JobStatus::empty(id), queue).unwrap();
    }

    async fn wait_for_state(registry: &JobRegistry, id: &str, state: JobState) -> JobStatus {
        for _ in 0..200 {
            if let Some(job) = registry.get(id)
                && job.status == state
            {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, state);
    }

    #[tokio::test]
    async fn test_worker_runs_jobs_to_completion() {
        let (registry, queue, _dir) = setup();
        let spawner = Arc::new(InstantSpawner {
            code: 0,
            launched: Mutex::new(Vec::new()),
        });
        queue_job(&registry, &queue, "a_a_1");

        let handle = LauncherWorker::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            spawner.clone(),
            Duration::from_millis(10),
        )
        .spawn();

        let job = wait_for_state(&registry, "a_a_1", JobState::Completed).await;
        assert_eq!(job.exit_code, Some(0));
        assert!(job.started_at.is_some());
        assert_eq!(registry.membership_of("a_a_1"), Some(Membership::Completed));
        let pid = fs::read_to_string(registry.store().paths("a_a_1").pid_file()).unwrap();
        assert_eq!(pid.trim(), "4242");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_nonzero_exit_marks_failed() {
        let (registry, queue, _dir) = setup();
        let spawner = Arc::new(InstantSpawner {
            code: 2,
            launched: Mutex::new(Vec::new()),
        });
        queue_job(&registry, &queue, "b_b_1");
        let handle =
            LauncherWorker::new(registry.clone(), queue.clone(), spawner, Duration::from_millis(10))
                .spawn();
        let job = wait_for_state(&registry, "b_b_1", JobState::Failed).await;
        assert_eq!(job.exit_code, Some(2));
        assert_eq!(registry.membership_of("b_b_1"), Some(Membership::Erred));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_job_running_and_worker_alive() {
        let (registry, queue, _dir) = setup();
        queue_job(&registry, &queue, "c_c_1");
        let handle = LauncherWorker::new(
            registry.clone(),
            queue.clone(),
            Arc::new(FailingSpawner),
            Duration::from_millis(10),
        )
        .spawn();

        wait_for_state(&registry, "c_c_1", JobState::Running).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.get("c_c_1").unwrap().status, JobState::Running);

        // The worker keeps serving the queue.
        queue_job(&registry, &queue, "d_d_1");
        wait_for_state(&registry, "d_d_1", JobState::Running).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_adopted_jobs_finish_before_new_launches() {
        let (registry, queue, _dir) = setup();
        let store = registry.store();
        store.create_job_dir("old_o_1").unwrap();
        let mut old = JobStatus::empty("old_o_1");
        old.mark_queued(1);
        old.mark_running();
        store.write(&old).unwrap();
        fs::write(
            store.paths("old_o_1").running_marker(),
            format!("{}\n", std::process::id()),
        )
        .unwrap();
        let report = registry.reconcile(Some(&queue));
        assert_eq!(report.running, vec!["old_o_1"]);

        let spawner = Arc::new(InstantSpawner {
            code: 0,
            launched: Mutex::new(Vec::new()),
        });
        queue_job(&registry, &queue, "new_n_1");
        let handle = LauncherWorker::new(
            registry.clone(),
            queue.clone(),
            spawner.clone(),
            Duration::from_millis(10),
        )
        .adopt(report.running)
        .spawn();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(spawner.launched.lock().unwrap().is_empty());
        assert_eq!(registry.get("new_n_1").unwrap().status, JobState::Queued);

        fs::write(store.paths("old_o_1").exit_code_file(), "0\n").unwrap();
        wait_for_state(&registry, "old_o_1", JobState::Completed).await;
        wait_for_state(&registry, "new_n_1", JobState::Completed).await;
        assert_eq!(*spawner.launched.lock().unwrap(), vec!["new_n_1".to_string()]);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_adopted_job_does_not_stall_queue() {
        let (registry, queue, _dir) = setup();
        let store = registry.store();
        store.create_job_dir("gone_g_1").unwrap();
        let mut gone = JobStatus::empty("gone_g_1");
        gone.mark_queued(1);
        gone.mark_running();
        store.write(&gone).unwrap();
        fs::write(store.paths("gone_g_1").running_marker(), "99999999\n").unwrap();
        registry.place("gone_g_1", Membership::Running);

        let spawner = Arc::new(InstantSpawner {
            code: 0,
            launched: Mutex::new(Vec::new()),
        });
        queue_job(&registry, &queue, "new_n_1");
        let handle = LauncherWorker::new(
            registry.clone(),
            queue.clone(),
            spawner.clone(),
            Duration::from_millis(10),
        )
        .adopt(vec!["gone_g_1".to_string()])
        .spawn();

        let job = wait_for_state(&registry, "gone_g_1", JobState::Failed).await;
        assert_eq!(job.exit_code, Some(INTERRUPTED_EXIT_CODE));
        assert_eq!(registry.membership_of("gone_g_1"), Some(Membership::Erred));
        assert!(!store.paths("gone_g_1").running_marker().exists());
        wait_for_state(&registry, "new_n_1", JobState::Completed).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_launched_process_dying_without_marker_fails_job() {
        let (registry, queue, _dir) = setup();
        queue_job(&registry, &queue, "h_h_1");
        queue_job(&registry, &queue, "i_i_1");
        let handle = LauncherWorker::new(
            registry.clone(),
            queue.clone(),
            Arc::new(VanishingSpawner),
            Duration::from_millis(10),
        )
        .spawn();

        let job = wait_for_state(&registry, "h_h_1", JobState::Failed).await;
        assert_eq!(job.exit_code, Some(INTERRUPTED_EXIT_CODE));
        wait_for_state(&registry, "i_i_1", JobState::Failed).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_rewritten_marker_does_not_change_exit_code() {
        let (registry, queue, _dir) = setup();
        let spawner = Arc::new(InstantSpawner {
            code: 0,
            launched: Mutex::new(Vec::new()),
        });
        queue_job(&registry, &queue, "e_e_1");
        let handle =
            LauncherWorker::new(registry.clone(), queue.clone(), spawner, Duration::from_millis(10))
                .spawn();
        wait_for_state(&registry, "e_e_1", JobState::Completed).await;
        handle.shutdown().await;

        fs::write(registry.store().paths("e_e_1").exit_code_file(), "9\n").unwrap();
        let worker = LauncherWorker::new(
            registry.clone(),
            queue.clone(),
            Arc::new(FailingSpawner),
            Duration::from_millis(10),
        );
        worker.finish("e_e_1", 9);
        let job = registry.get("e_e_1").unwrap();
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.status, JobState::Completed);
        assert_eq!(registry.store().read("e_e_1").unwrap().exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_polling() {
        let (registry, queue, _dir) = setup();
        struct SilentSpawner;
        impl ProcessSpawner for SilentSpawner {
            fn spawn(&self, _paths: &JobPaths) -> io::Result<Option<u32>> {
                Ok(None)
            }
        }
        queue_job(&registry, &queue, "f_f_1");
        let handle = LauncherWorker::new(
            registry.clone(),
            queue.clone(),
            Arc::new(SilentSpawner),
            Duration::from_secs(3600),
        )
        .spawn();
        wait_for_state(&registry, "f_f_1", JobState::Running).await;
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("worker should stop promptly");
    }
}
