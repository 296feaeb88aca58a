//! Durable status storage: one JSON blob per job, written atomically.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::{Result, RunnerError};
use crate::job::{JobPaths, JobStatus, is_valid_job_id};

/// Filesystem-backed store of job status blobs under `<scratch>/jobs/<id>/`.
#[derive(Debug, Clone)]
pub struct StatusStore {
    jobs_dir: PathBuf,
}

impl StatusStore {
    /// Open the store, creating the jobs directory if needed.
    pub fn open(jobs_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let jobs_dir = jobs_dir.into();
        std::fs::create_dir_all(&jobs_dir)?;
        Ok(Self { jobs_dir })
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn paths(&self, id: &str) -> JobPaths {
        JobPaths::new(&self.jobs_dir, id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.paths(id).dir().is_dir()
    }

    /// Claim the directory for `id`. Returns `false` if it already exists.
    ///
    /// Uses a non-recursive create so two claimants can never both win.
    pub fn create_job_dir(&self, id: &str) -> Result<bool> {
        let paths = self.paths(id);
        match std::fs::create_dir(paths.dir()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(RunnerError::JobDirectory {
                path: paths.dir().to_path_buf(),
                source,
            }),
        }
    }

    /// Persist a blob: temp file in the job directory, fsync, rename.
    ///
    /// Readers observe either the previous blob or the new one.
    pub fn write(&self, job: &JobStatus) -> Result<()> {
        let paths = self.paths(&job.id);
        let target = paths.status_file();
        let json = serde_json::to_vec_pretty(job)?;

        let write_failed = |source: io::Error| RunnerError::WriteFailed {
            path: target.clone(),
            source,
        };

        let mut temp = tempfile::Builder::new()
            .prefix(".status-")
            .suffix(".tmp")
            .tempfile_in(paths.dir())
            .map_err(write_failed)?;
        temp.write_all(&json).map_err(write_failed)?;
        temp.as_file().sync_all().map_err(write_failed)?;
        temp.persist(&target).map_err(|e| write_failed(e.error))?;

        debug!(job_id = %job.id, status = %job.status, "wrote job status");
        Ok(())
    }

    /// Read a blob.
    ///
    /// `None` means the job has no status file. A file that cannot be read
    /// or parsed yields an empty blob so status queries never fail.
    pub fn read(&self, id: &str) -> Option<JobStatus> {
        let path = self.paths(id).status_file();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(job_id = %id, path = %path.display(), error = %e, "failed to read job status");
                return Some(JobStatus::empty(id));
            }
        };
        match serde_json::from_slice::<JobStatus>(&bytes) {
            Ok(mut job) => {
                if job.id != id {
                    warn!(job_id = %id, stored_id = %job.id, "job status names a different id");
                    job.id = id.to_string();
                }
                Some(job)
            }
            Err(e) => {
                warn!(job_id = %id, path = %path.display(), error = %e, "unparseable job status");
                Some(JobStatus::empty(id))
            }
        }
    }

    /// Ids of every job directory, sorted.
    pub fn job_ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.jobs_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if is_valid_job_id(&name) => ids.push(name),
                Ok(_) => {}
                Err(name) => {
                    warn!(name = ?name, "skipping job directory with non-UTF-8 name");
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Write a small text file inside a job directory, atomically.
    pub fn write_job_file(&self, path: &Path, contents: &str) -> Result<()> {
        let write_failed = |source: io::Error| RunnerError::WriteFailed {
            path: path.to_path_buf(),
            source,
        };
        let parent = path.parent().unwrap_or(&self.jobs_dir);
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(write_failed)?;
        temp.write_all(contents.as_bytes()).map_err(write_failed)?;
        temp.persist(path).map_err(|e| write_failed(e.error))?;
        Ok(())
    }
}
