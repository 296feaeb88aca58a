//! Job record, lifecycle state machine and per-job filesystem layout.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_FILE: &str = "status.json";
pub const LAUNCHER_SCRIPT: &str = "launcher.bash";
pub const VAR_CONFIG_FILE: &str = "var_config.ini";
pub const RUNNING_MARKER: &str = "running.txt";
pub const EXIT_CODE_FILE: &str = "exit-code.txt";
pub const PID_FILE: &str = "pid.txt";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const REDIRECT_MARKER: &str = "redirect.txt";

/// Exit code recorded for a build whose process died without writing one.
/// Shell exit codes are 0..=255, so this never collides with a real one.
pub const INTERRUPTED_EXIT_CODE: i32 = -1;

/// Whether `id` can name a job directory: ASCII alphanumerics, `-` and `_`.
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 255
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Lifecycle state of a job.
///
/// `Unknown` never appears in a blob written by the runner; it marks
/// placeholders for ids that were never seen or whose blob is unreadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Unknown,
    Queued,
    Running,
    Completed,
    Failed,
    Redirected,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Redirected => "REDIRECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Redirected)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Unknown -> Queued` covers recovered jobs whose blob was empty.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Unknown, Queued)
                | (Queued, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Completed, Redirected)
                | (Failed, Redirected)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted status blob of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(alias = "synth_id")]
    pub id: String,
    #[serde(default)]
    pub status: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_order: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_ott_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_initiating_run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    /// A blob carrying nothing but the id.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: JobState::Unknown,
            queue_order: None,
            exit_code: None,
            download_url: None,
            redirect: None,
            collections: Vec::new(),
            root_ott_id: None,
            user_initiating_run: None,
            queued_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next` if the transition is legal. Returns whether it changed.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub fn mark_queued(&mut self, queue_order: u64) -> bool {
        if self.queue_order.is_none() {
            self.queue_order = Some(queue_order);
        }
        if self.queued_at.is_none() {
            self.queued_at = Some(Utc::now());
        }
        self.advance(JobState::Queued)
    }

    pub fn mark_running(&mut self) -> bool {
        let changed = self.advance(JobState::Running);
        if changed {
            self.started_at = Some(Utc::now());
        }
        changed
    }

    /// Record the process exit code, deriving COMPLETED or FAILED.
    ///
    /// A code that is already present is never replaced. A job still in
    /// QUEUED (its RUNNING write was lost) is stepped through RUNNING so the
    /// recorded progression stays legal.
    pub fn record_exit_code(&mut self, code: i32) -> bool {
        if self.exit_code.is_some() {
            return false;
        }
        if matches!(self.status, JobState::Unknown | JobState::Queued) {
            self.status = JobState::Running;
        }
        self.exit_code = Some(code);
        self.status = if code == 0 {
            JobState::Completed
        } else {
            JobState::Failed
        };
        self.finished_at = Some(Utc::now());
        true
    }

    /// Put a job that was marked RUNNING but never got a process back in
    /// the queue. Returns whether it changed.
    pub fn requeue_unlaunched(&mut self) -> bool {
        if self.status != JobState::Running || self.exit_code.is_some() {
            return false;
        }
        self.status = JobState::Queued;
        self.started_at = None;
        true
    }

    /// Alias this job's result to `target`, copying the target's URL.
    pub fn mark_redirected(&mut self, target: &str, download_url: Option<String>) -> bool {
        if !self.advance(JobState::Redirected) && self.status != JobState::Redirected {
            return false;
        }
        self.redirect = Some(target.to_string());
        if self.download_url.is_none() {
            self.download_url = download_url;
        }
        true
    }
}

/// Paths of everything a job keeps in its working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    id: String,
    dir: PathBuf,
}

impl JobPaths {
    pub fn new(jobs_dir: &Path, id: &str) -> Self {
        Self {
            id: id.to_string(),
            dir: jobs_dir.join(id),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status_file(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    pub fn build_script(&self) -> PathBuf {
        self.dir.join(format!("{}.bash", self.id))
    }

    pub fn launcher_script(&self) -> PathBuf {
        self.dir.join(LAUNCHER_SCRIPT)
    }

    pub fn var_config(&self) -> PathBuf {
        self.dir.join(VAR_CONFIG_FILE)
    }

    pub fn running_marker(&self) -> PathBuf {
        self.dir.join(RUNNING_MARKER)
    }

    pub fn exit_code_file(&self) -> PathBuf {
        self.dir.join(EXIT_CODE_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    pub fn stdout_file(&self) -> PathBuf {
        self.dir.join(STDOUT_FILE)
    }

    pub fn stderr_file(&self) -> PathBuf {
        self.dir.join(STDERR_FILE)
    }

    /// Directory the build tool writes its outputs into.
    pub fn results_dir(&self) -> PathBuf {
        self.dir.join(format!("custom_{}", self.id))
    }

    pub fn redirect_marker(&self) -> PathBuf {
        self.results_dir().join(REDIRECT_MARKER)
    }

    pub fn archive(&self, format: ArchiveFormat) -> PathBuf {
        self.dir.join(format!("{}.{}", self.id, format.extension()))
    }

    /// Pid of the job's wrapper process: the liveness marker first, then the
    /// pid the launcher recorded at spawn time.
    pub fn recorded_pid(&self) -> Option<u32> {
        [self.running_marker(), self.pid_file()]
            .iter()
            .find_map(|path| std::fs::read_to_string(path).ok()?.trim().parse().ok())
    }

    /// Whether the job's wrapper process still exists.
    pub fn liveness(&self) -> Liveness {
        match self.recorded_pid() {
            None => Liveness::Unknown,
            Some(pid) if is_pid_alive(pid) => Liveness::Alive,
            Some(_) => Liveness::Dead,
        }
    }

    /// Exit code from the completion marker, if present and well formed.
    pub fn read_exit_code(&self) -> Option<i32> {
        let raw = std::fs::read_to_string(self.exit_code_file()).ok()?;
        raw.trim().parse().ok()
    }
}

/// What is known about a job's wrapper process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// No pid was ever recorded: the process was never spawned, or the
    /// spawner could not report one.
    Unknown,
    Alive,
    /// A pid was recorded and no such process exists any more.
    Dead,
}

/// `kill(pid, 0)` checks for existence without delivering a signal.
fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs only the existence and permission checks.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Archive formats results can be fetched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::TarGz => "tar.gz",
        }
    }
}

impl std::str::FromStr for ArchiveFormat {
    type Err = crate::errors::RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('.') {
            "tar.gz" | "tgz" => Ok(Self::TarGz),
            other => Err(crate::errors::RunnerError::UnsupportedFormat {
                ext: other.to_string(),
            }),
        }
    }
}
