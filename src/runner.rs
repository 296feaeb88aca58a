//! The runner façade: the operations the web layer calls.
//!
//! A `Runner` is constructed once by the composition root. Construction
//! validates configuration and reconciles the registry with the jobs
//! directory, re-queueing builds a previous process accepted but never
//! launched. [`Runner::start_worker`] then starts the single launcher worker.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RunnerConfig, SCRATCH_DIR_KEY, Settings};
use crate::errors::{Result, RunnerError};
use crate::job::{ArchiveFormat, JobPaths, JobState, JobStatus, is_valid_job_id};
use crate::launcher::{LauncherWorker, ProcessSpawner, ShellSpawner, WorkerHandle};
use crate::queue::RunQueue;
use crate::registry::JobRegistry;
use crate::script::{self, BuildScriptParams};
use crate::store::StatusStore;
use crate::validate::{BuildParams, BuildRequest};

/// How many fresh ids to try before giving up.
const MAX_ID_ATTEMPTS: u32 = 5;

pub struct Runner {
    config: RunnerConfig,
    registry: Arc<JobRegistry>,
    queue: Arc<RunQueue>,
    spawner: Arc<dyn ProcessSpawner>,
    trigger_lock: Mutex<()>,
    /// Jobs found running at startup; taken by the worker when it starts.
    adopted: Mutex<Option<Vec<String>>>,
}

impl Runner {
    /// Runner that launches builds with `bash`.
    pub fn new(config: RunnerConfig) -> Result<Self> {
        Self::with_spawner(config, Arc::new(ShellSpawner::new()))
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(RunnerConfig::from_settings(settings)?)
    }

    pub fn with_spawner(config: RunnerConfig, spawner: Arc<dyn ProcessSpawner>) -> Result<Self> {
        let store = StatusStore::open(config.jobs_dir()).map_err(|e| {
            RunnerError::MisconfiguredSetting {
                key: SCRATCH_DIR_KEY,
                reason: format!("Could not create jobs directory: {}", e),
            }
        })?;
        let registry = Arc::new(JobRegistry::new(store));
        let queue = Arc::new(RunQueue::new());
        let report = registry.reconcile(Some(&queue));
        info!(
            jobs_dir = %config.jobs_dir().display(),
            known = report.discovered,
            requeued = report.enqueued.len(),
            running = report.running.len(),
            "runner ready"
        );
        Ok(Self {
            config,
            registry,
            queue,
            spawner,
            trigger_lock: Mutex::new(()),
            adopted: Mutex::new(Some(report.running)),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Number of jobs waiting for the launcher.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Start the launcher worker on the current tokio runtime.
    ///
    /// Returns `None` if the worker was already started; there is only ever
    /// one consumer of the run queue.
    pub fn start_worker(&self) -> Option<WorkerHandle> {
        let adopted = self
            .adopted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        let worker = LauncherWorker::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.queue),
            Arc::clone(&self.spawner),
            self.config.poll_interval,
        )
        .adopt(adopted);
        Some(worker.spawn())
    }

    /// Validate raw client parameters and trigger a build.
    pub fn trigger_params(&self, params: BuildParams) -> Result<JobStatus> {
        let request = BuildRequest::try_from(params).inspect_err(|e| {
            debug!(error = %e, "rejected build request");
        })?;
        self.trigger(&request)
    }

    /// Create and enqueue a build, or return the existing job for the same
    /// input.
    ///
    /// Single-collection requests get a deterministic id, so an identical
    /// request never launches a second build. Multi-collection requests get a
    /// fresh id every time.
    pub fn trigger(&self, request: &BuildRequest) -> Result<JobStatus> {
        let _guard = self
            .trigger_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let store = self.registry.store();

        let id = match request.collections.as_slice() {
            [only] => {
                let id = format!("{}_{}_{}", only.owner, only.name, request.root_ott_id);
                if !store.create_job_dir(&id)? {
                    debug!(job_id = %id, "build already requested; returning existing job");
                    return Ok(self.status(&id));
                }
                id
            }
            _ => self.claim_fresh_id()?,
        };

        let paths = store.paths(&id);
        if let Err(e) = self.write_job_files(&paths, request) {
            if let Err(cleanup) = std::fs::remove_dir_all(paths.dir()) {
                warn!(job_id = %id, error = %cleanup, "failed to remove incomplete job directory");
            }
            return Err(e);
        }

        let mut job = JobStatus::empty(&id);
        job.collections = request.collection_strings();
        job.root_ott_id = Some(request.root_ott_id);
        job.user_initiating_run = request.user.clone();
        self.registry.register_queued(job, &self.queue)
    }

    fn claim_fresh_id(&self) -> Result<String> {
        let store = self.registry.store();
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = format!("multi_{}", Uuid::new_v4().simple());
            if store.create_job_dir(&id)? {
                return Ok(id);
            }
            warn!(job_id = %id, "generated job id already exists; retrying");
        }
        Err(RunnerError::IdExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    fn write_job_files(&self, paths: &JobPaths, request: &BuildRequest) -> Result<()> {
        let var_config = script::render_var_config(
            &request.collection_strings(),
            request.root_ott_id,
            paths.id(),
        );
        let build_script = script::render_build_script(&BuildScriptParams {
            paths,
            root_ott_id: request.root_ott_id,
            build_tool_dir: &self.config.build_tool_dir,
            taxonomy_dir: &self.config.taxonomy_dir,
            base_config_file: &self.config.base_config_file,
            env_file: self.config.env_file.as_deref(),
        });
        let launcher = script::render_launcher_script(paths);

        for (path, contents) in [
            (paths.var_config(), var_config),
            (paths.build_script(), build_script),
            (paths.launcher_script(), launcher),
        ] {
            std::fs::write(&path, contents)
                .map_err(|source| RunnerError::WriteFailed { path, source })?;
        }
        Ok(())
    }

    /// Current status of a job, or an UNKNOWN placeholder.
    pub fn status(&self, id: &str) -> JobStatus {
        if !is_valid_job_id(id) {
            return JobStatus::empty(id);
        }
        if !self.registry.is_cached(id) {
            self.registry.reconcile(None);
        }
        self.registry
            .get(id)
            .unwrap_or_else(|| JobStatus::empty(id))
    }

    /// All known jobs. Fills in download URLs for finished jobs on the way.
    pub fn list(&self) -> BTreeMap<String, JobStatus> {
        self.registry.reconcile(None);
        let pending: Vec<String> = self
            .registry
            .snapshot()
            .into_values()
            .filter(|job| job.is_terminal() && job.download_url.is_none())
            .map(|job| job.id)
            .collect();
        for id in pending {
            if let Err(e) = self.ensure_download_url(&id) {
                warn!(job_id = %id, error = %e, "failed to record download url");
            }
        }
        self.registry.snapshot()
    }

    /// Path of a finished job's results archive.
    ///
    /// A redirected job resolves to its target's archive. Only one level of
    /// redirect is followed.
    pub fn archive_path(&self, id: &str, format: ArchiveFormat) -> Result<PathBuf> {
        let not_found = || RunnerError::JobNotFound { id: id.to_string() };
        if !is_valid_job_id(id) {
            return Err(not_found());
        }
        if !self.registry.is_cached(id) {
            self.registry.reconcile(None);
        }
        let job = self.registry.get(id).ok_or_else(not_found)?;
        if !job.is_terminal() {
            return Err(RunnerError::JobNotReady {
                id: id.to_string(),
                state: job.status.to_string(),
            });
        }
        let holder = self.resolve_redirect(id)?.unwrap_or_else(|| id.to_string());
        let path = self.registry.store().paths(&holder).archive(format);
        if path.is_file() {
            Ok(path)
        } else {
            debug!(job_id = %id, path = %path.display(), "archive missing");
            Err(not_found())
        }
    }

    /// Apply a redirect marker left in a finished job's results directory.
    ///
    /// Returns the id of the job that holds the result, if this job is (or
    /// has just become) redirected.
    pub fn resolve_redirect(&self, id: &str) -> Result<Option<String>> {
        let Some(job) = self.registry.get(id) else {
            return Ok(None);
        };
        if let Some(target) = job.redirect {
            return Ok(Some(target));
        }
        if !job.is_terminal() {
            return Ok(None);
        }

        let marker = self.registry.store().paths(id).redirect_marker();
        let target = match std::fs::read_to_string(&marker) {
            Ok(raw) => raw.trim().to_string(),
            Err(_) => return Ok(None),
        };
        if target.is_empty() || target == id || !is_valid_job_id(&target) {
            warn!(job_id = %id, target = %target, "ignoring malformed redirect marker");
            return Ok(None);
        }
        if !self.registry.is_cached(&target) {
            self.registry.reconcile(None);
        }
        let Some(target_job) = self.registry.get(&target) else {
            warn!(job_id = %id, target = %target, "redirect names an unknown job");
            return Ok(None);
        };

        let target_url = match target_job.download_url {
            Some(url) => Some(url),
            None => self.cache_own_download_url(&target)?,
        };
        self.registry
            .update(id, |job| job.mark_redirected(&target, target_url.clone()))?;
        info!(job_id = %id, target = %target, "job redirected to equivalent build");
        Ok(Some(target))
    }

    /// Compute and cache the download URL of a finished job.
    fn ensure_download_url(&self, id: &str) -> Result<Option<String>> {
        if self.resolve_redirect(id)?.is_some() {
            return Ok(self.registry.get(id).and_then(|job| job.download_url));
        }
        self.cache_own_download_url(id)
    }

    /// Set the URL of a job's own archive. Only successful builds have one.
    fn cache_own_download_url(&self, id: &str) -> Result<Option<String>> {
        let url = self.config.download_url(id);
        let updated = self.registry.update(id, |job| {
            if job.status == JobState::Completed && job.download_url.is_none() {
                job.download_url = Some(url);
                true
            } else {
                false
            }
        })?;
        Ok(updated.and_then(|job| job.download_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BASE_CONFIG_FILE_KEY, BUILD_TOOL_DIR_KEY, POLL_INTERVAL_KEY, TAXONOMY_DIR_KEY,
    };
    use crate::registry::Membership;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    /// Never starts anything; tests drive the markers by hand.
    struct NoopSpawner;

    impl ProcessSpawner for NoopSpawner {
        fn spawn(&self, _paths: &JobPaths) -> std::io::Result<Option<u32>> {
            Ok(None)
        }
    }

    fn settings(root: &Path) -> Settings {
        let tool = root.join("tool");
        let taxonomy = root.join("ott");
        fs::create_dir_all(&tool).unwrap();
        fs::create_dir_all(&taxonomy).unwrap();
        fs::write(root.join("base.ini"), "").unwrap();
        let mut s = Settings::new();
        s.insert(SCRATCH_DIR_KEY.into(), root.join("scratch").display().to_string());
        s.insert(BUILD_TOOL_DIR_KEY.into(), tool.display().to_string());
        s.insert(TAXONOMY_DIR_KEY.into(), taxonomy.display().to_string());
        s.insert(BASE_CONFIG_FILE_KEY.into(), root.join("base.ini").display().to_string());
        s.insert(POLL_INTERVAL_KEY.into(), "0.01".into());
        s
    }

    fn runner(root: &Path) -> Runner {
        let config = RunnerConfig::from_settings(&settings(root)).unwrap();
        Runner::with_spawner(config, Arc::new(NoopSpawner)).unwrap()
    }

    /// Drive a job to a terminal state the way the worker would.
    fn finish(runner: &Runner, id: &str, code: i32) {
        runner
            .registry
            .update(id, |job| {
                job.mark_running();
                job.record_exit_code(code)
            })
            .unwrap();
        let set = if code == 0 { Membership::Completed } else { Membership::Erred };
        runner.registry.place(id, set);
    }

    #[test]
    fn test_trigger_writes_job_files_and_queues() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path());
        let request = BuildRequest::single("opentree", "plants", "ott5").unwrap();
        let job = runner.trigger(&request).unwrap();

        assert_eq!(job.id, "opentree_plants_5");
        assert_eq!(job.status, JobState::Queued);
        assert_eq!(job.queue_order, Some(1));
        assert_eq!(job.collections, vec!["opentree/plants"]);
        assert_eq!(runner.queue_len(), 1);

        let paths = runner.registry.store().paths(&job.id);
        assert!(paths.status_file().is_file());
        assert!(paths.build_script().is_file());
        assert!(paths.launcher_script().is_file());
        let ini = fs::read_to_string(paths.var_config()).unwrap();
        assert!(ini.contains("collections = opentree/plants"));
    }

    #[test]
    fn test_trigger_is_idempotent() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path());
        let request = BuildRequest::single("o", "n", "42").unwrap();
        let first = runner.trigger(&request).unwrap();
        let second = runner.trigger(&request).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.queue_order, Some(1));
        assert_eq!(runner.queue_len(), 1);
    }

    #[test]
    fn test_multi_collection_jobs_get_fresh_ids() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path());
        let params = || BuildParams {
            input_collections: Some(vec!["a/one".into(), "b/two".into()]),
            root_id: Some("ott9".into()),
            ..Default::default()
        };
        let first = runner.trigger_params(params()).unwrap();
        let second = runner.trigger_params(params()).unwrap();
        assert_ne!(first.id, second.id);
        assert!(first.id.starts_with("multi_"));
        assert!(is_valid_job_id(&first.id));
        assert_eq!(runner.queue_len(), 2);
    }

    #[test]
    fn test_trigger_params_rejects_bad_input() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path());
        let err = runner
            .trigger_params(BuildParams {
                input_collection: Some("bad name!/x".into()),
                root_id: Some("ott5".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(runner.queue_len(), 0);
        assert!(runner.registry.store().job_ids().unwrap().is_empty());
    }

    #[test]
    fn test_status_of_unknown_job_is_placeholder() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path());
        let job = runner.status("nobody_x_1");
        assert_eq!(job.status, JobState::Unknown);
        assert_eq!(job.id, "nobody_x_1");
        assert_eq!(runner.status("../../etc").status, JobState::Unknown);
    }

    #[test]
    fn test_status_discovers_jobs_from_other_instances() {
        let dir = tempdir().unwrap();
        let first = runner(dir.path());
        let second = runner(dir.path());
        let job = first
            .trigger(&BuildRequest::single("o", "n", "1").unwrap())
            .unwrap();
        assert_eq!(second.status(&job.id).status, JobState::Queued);
    }

    #[test]
    fn test_list_caches_download_url_for_completed_jobs() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path());
        let ok = runner.trigger(&BuildRequest::single("o", "ok", "1").unwrap()).unwrap();
        let bad = runner.trigger(&BuildRequest::single("o", "bad", "1").unwrap()).unwrap();
        let waiting = runner.trigger(&BuildRequest::single("o", "wait", "1").unwrap()).unwrap();
        finish(&runner, &ok.id, 0);
        finish(&runner, &bad.id, 1);

        let all = runner.list();
        assert_eq!(all.len(), 3);
        assert_eq!(
            all[&ok.id].download_url.as_deref(),
            Some("/v3/tree_of_life/custom_built_tree/o_ok_1.tar.gz")
        );
        assert!(all[&bad.id].download_url.is_none());
        assert!(all[&waiting.id].download_url.is_none());

        let stored = runner.registry.store().read(&ok.id).unwrap();
        assert_eq!(stored.download_url, all[&ok.id].download_url);
    }

    #[test]
    fn test_archive_path_errors_distinguish_unknown_and_pending() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path());
        let err = runner.archive_path("nobody_x_1", ArchiveFormat::TarGz).unwrap_err();
        assert_eq!(err.status_code(), 404);

        let job = runner.trigger(&BuildRequest::single("o", "n", "1").unwrap()).unwrap();
        let err = runner.archive_path(&job.id, ArchiveFormat::TarGz).unwrap_err();
        assert_eq!(err.status_code(), 410);

        finish(&runner, &job.id, 0);
        let err = runner.archive_path(&job.id, ArchiveFormat::TarGz).unwrap_err();
        assert_eq!(err.status_code(), 404, "archive not written yet");

        let archive = runner.registry.store().paths(&job.id).archive(ArchiveFormat::TarGz);
        fs::write(&archive, b"tarball").unwrap();
        assert_eq!(runner.archive_path(&job.id, ArchiveFormat::TarGz).unwrap(), archive);
    }

    #[test]
    fn test_redirect_resolution() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path());
        let y = runner.trigger(&BuildRequest::single("o", "y", "1").unwrap()).unwrap();
        let x = runner.trigger(&BuildRequest::single("o", "x", "1").unwrap()).unwrap();
        finish(&runner, &y.id, 0);
        let y_url = runner.list()[&y.id].download_url.clone().unwrap();
        let y_archive = runner.registry.store().paths(&y.id).archive(ArchiveFormat::TarGz);
        fs::write(&y_archive, b"tarball").unwrap();

        finish(&runner, &x.id, 0);
        let x_paths = runner.registry.store().paths(&x.id);
        fs::create_dir_all(x_paths.results_dir()).unwrap();
        fs::write(x_paths.redirect_marker(), format!("{}\n", y.id)).unwrap();

        assert_eq!(runner.archive_path(&x.id, ArchiveFormat::TarGz).unwrap(), y_archive);
        let status = runner.status(&x.id);
        assert_eq!(status.status, JobState::Redirected);
        assert_eq!(status.redirect.as_deref(), Some(y.id.as_str()));
        assert_eq!(status.download_url.as_deref(), Some(y_url.as_str()));
        assert_eq!(status.exit_code, Some(0));
    }

    #[test]
    fn test_redirect_follows_one_level_only() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path());
        let ids: Vec<String> = ["a", "b", "c"]
            .iter()
            .map(|n| runner.trigger(&BuildRequest::single("o", n, "1").unwrap()).unwrap().id)
            .collect();
        for id in &ids {
            finish(&runner, id, 0);
        }
        let store = runner.registry.store();
        for (from, to) in [(&ids[0], &ids[1]), (&ids[1], &ids[2])] {
            let paths = store.paths(from);
            fs::create_dir_all(paths.results_dir()).unwrap();
            fs::write(paths.redirect_marker(), to.as_str()).unwrap();
        }
        fs::write(store.paths(&ids[1]).archive(ArchiveFormat::TarGz), b"b").unwrap();
        fs::write(store.paths(&ids[2]).archive(ArchiveFormat::TarGz), b"c").unwrap();

        let path = runner.archive_path(&ids[0], ArchiveFormat::TarGz).unwrap();
        assert_eq!(path, store.paths(&ids[1]).archive(ArchiveFormat::TarGz));
    }

    #[test]
    fn test_redirect_marker_naming_unknown_job_is_ignored() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path());
        let x = runner.trigger(&BuildRequest::single("o", "x", "1").unwrap()).unwrap();
        finish(&runner, &x.id, 0);
        let paths = runner.registry.store().paths(&x.id);
        fs::create_dir_all(paths.results_dir()).unwrap();
        fs::write(paths.redirect_marker(), "ghost_g_1").unwrap();

        assert_eq!(runner.resolve_redirect(&x.id).unwrap(), None);
        assert_eq!(runner.status(&x.id).status, JobState::Completed);
    }

    #[tokio::test]
    async fn test_start_worker_only_once() {
        let dir = tempdir().unwrap();
        let runner = runner(dir.path());
        let handle = runner.start_worker().expect("first start");
        assert!(runner.start_worker().is_none());
        handle.shutdown().await;
    }
}
