//! In-memory index of known jobs, mirrored from the status store.
//!
//! Two locks guard the registry. The membership lock covers the advisory
//! queued/running/completed/erred sets and the queue-order counter; the cache
//! lock covers the blob cache and is held across every read-modify-write of a
//! blob. When both are needed the membership lock is taken first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::job::{INTERRUPTED_EXIT_CODE, JobStatus, Liveness};
use crate::queue::RunQueue;
use crate::store::StatusStore;

/// Which advisory set a job currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Queued,
    Running,
    Completed,
    Erred,
}

#[derive(Debug, Default)]
struct MembershipSets {
    queued: HashSet<String>,
    running: HashSet<String>,
    completed: HashSet<String>,
    erred: HashSet<String>,
    next_queue_order: u64,
}

impl MembershipSets {
    fn set_mut(&mut self, which: Membership) -> &mut HashSet<String> {
        match which {
            Membership::Queued => &mut self.queued,
            Membership::Running => &mut self.running,
            Membership::Completed => &mut self.completed,
            Membership::Erred => &mut self.erred,
        }
    }

    /// Put `id` into exactly one set.
    fn place(&mut self, id: &str, which: Membership) {
        self.queued.remove(id);
        self.running.remove(id);
        self.completed.remove(id);
        self.erred.remove(id);
        self.set_mut(which).insert(id.to_string());
    }

    fn of(&self, id: &str) -> Option<Membership> {
        if self.queued.contains(id) {
            Some(Membership::Queued)
        } else if self.running.contains(id) {
            Some(Membership::Running)
        } else if self.completed.contains(id) {
            Some(Membership::Completed)
        } else if self.erred.contains(id) {
            Some(Membership::Erred)
        } else {
            None
        }
    }

    fn take_order(&mut self) -> u64 {
        self.next_queue_order += 1;
        self.next_queue_order
    }

    fn observe_order(&mut self, order: u64) {
        self.next_queue_order = self.next_queue_order.max(order);
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Job directories seen for the first time.
    pub discovered: usize,
    /// Jobs pushed onto the run queue, in launch order.
    pub enqueued: Vec<String>,
    /// Jobs whose external process is alive, ready to be adopted by the worker.
    pub running: Vec<String>,
}

struct Discovered {
    job: JobStatus,
    class: Membership,
    launchable: bool,
}

/// Cache of job blobs plus membership sets, backed by a [`StatusStore`].
pub struct JobRegistry {
    store: StatusStore,
    cache: Mutex<HashMap<String, JobStatus>>,
    membership: Mutex<MembershipSets>,
}

impl JobRegistry {
    pub fn new(store: StatusStore) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
            membership: Mutex::new(MembershipSets::default()),
        }
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, JobStatus>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn membership(&self) -> MutexGuard<'_, MembershipSets> {
        self.membership
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cache-first lookup; falls back to the store without caching.
    pub fn get(&self, id: &str) -> Option<JobStatus> {
        if let Some(job) = self.cache().get(id) {
            return Some(job.clone());
        }
        self.store.read(id)
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.cache().contains_key(id)
    }

    /// Every cached job, keyed by id.
    pub fn snapshot(&self) -> BTreeMap<String, JobStatus> {
        self.cache()
            .iter()
            .map(|(id, job)| (id.clone(), job.clone()))
            .collect()
    }

    pub fn membership_of(&self, id: &str) -> Option<Membership> {
        self.membership().of(id)
    }

    pub fn place(&self, id: &str, which: Membership) {
        self.membership().place(id, which);
    }

    /// Register a freshly created job: assign its queue order, persist the
    /// QUEUED blob, cache it, and enqueue it.
    ///
    /// The membership lock is held throughout so queue position and
    /// `queue_order` always agree.
    pub fn register_queued(&self, mut job: JobStatus, queue: &RunQueue) -> Result<JobStatus> {
        let mut membership = self.membership();
        let order = membership.take_order();
        job.mark_queued(order);
        if let Err(e) = self.store.write(&job) {
            // Give the number back so orders stay dense.
            membership.next_queue_order -= 1;
            return Err(e);
        }
        self.cache().insert(job.id.clone(), job.clone());
        membership.place(&job.id, Membership::Queued);
        queue.enqueue(job.id.clone());
        info!(job_id = %job.id, queue_order = order, "queued custom synthesis job");
        Ok(job)
    }

    /// Read-modify-write of one blob.
    ///
    /// `f` returns whether it changed the job; unchanged jobs are not
    /// rewritten. Returns `None` for ids with no blob at all.
    pub fn update<F>(&self, id: &str, f: F) -> Result<Option<JobStatus>>
    where
        F: FnOnce(&mut JobStatus) -> bool,
    {
        let mut cache = self.cache();
        let mut job = match cache.get(id).cloned().or_else(|| self.store.read(id)) {
            Some(job) => job,
            None => return Ok(None),
        };
        if f(&mut job) {
            self.store.write(&job)?;
        }
        cache.insert(id.to_string(), job.clone());
        Ok(Some(job))
    }

    /// Scan the store for jobs not yet cached and merge them in.
    ///
    /// A missing exit code is recovered from the completion marker, or set to
    /// [`INTERRUPTED_EXIT_CODE`] when the recorded process is gone. With a
    /// queue (startup only), jobs that never launched are enqueued in
    /// `(queue_order, id)` order; jobs lacking an order are numbered after
    /// all restored ones.
    pub fn reconcile(&self, queue: Option<&RunQueue>) -> ReconcileReport {
        let ids = match self.store.job_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(jobs_dir = %self.store.jobs_dir().display(), error = %e, "failed to scan jobs directory");
                return ReconcileReport::default();
            }
        };
        let unseen: Vec<String> = {
            let cache = self.cache();
            ids.into_iter().filter(|id| !cache.contains_key(id)).collect()
        };
        if unseen.is_empty() {
            return ReconcileReport::default();
        }

        let discovered: Vec<Discovered> = unseen.iter().map(|id| self.inspect(id)).collect();

        let mut report = ReconcileReport {
            discovered: discovered.len(),
            ..Default::default()
        };
        let mut membership = self.membership();
        for found in &discovered {
            if let Some(order) = found.job.queue_order {
                membership.observe_order(order);
            }
        }

        let mut to_queue: Vec<JobStatus> = Vec::new();
        for found in discovered {
            match found.class {
                Membership::Queued if queue.is_some() && found.launchable => {
                    to_queue.push(found.job);
                    continue;
                }
                Membership::Queued if !found.launchable => {
                    warn!(job_id = %found.job.id, "job directory has no launcher script; not queueing");
                }
                Membership::Running => report.running.push(found.job.id.clone()),
                _ => {}
            }
            if found.launchable || found.class != Membership::Queued {
                membership.place(&found.job.id, found.class);
            }
            self.cache()
                .entry(found.job.id.clone())
                .or_insert(found.job);
        }

        if let Some(queue) = queue {
            to_queue.sort_by(|a, b| {
                let key_a = (a.queue_order.unwrap_or(u64::MAX), &a.id);
                let key_b = (b.queue_order.unwrap_or(u64::MAX), &b.id);
                key_a.cmp(&key_b)
            });
            for mut job in to_queue {
                let fresh_order = match job.queue_order {
                    Some(_) => None,
                    None => Some(membership.take_order()),
                };
                let reset = job.requeue_unlaunched();
                if reset {
                    info!(job_id = %job.id, "job was marked running but never launched; requeueing");
                }
                let changed =
                    reset | job.mark_queued(fresh_order.unwrap_or_default()) || fresh_order.is_some();
                if changed && let Err(e) = self.store.write(&job) {
                    warn!(job_id = %job.id, error = %e, "failed to persist recovered queue state");
                }
                membership.place(&job.id, Membership::Queued);
                queue.enqueue(job.id.clone());
                report.enqueued.push(job.id.clone());
                self.cache().entry(job.id.clone()).or_insert(job);
            }
        }

        if !report.enqueued.is_empty() || !report.running.is_empty() {
            info!(
                discovered = report.discovered,
                requeued = report.enqueued.len(),
                running = report.running.len(),
                "reconciled job registry"
            );
        } else {
            debug!(discovered = report.discovered, "reconciled job registry");
        }
        report
    }

    /// Load and classify one job directory.
    ///
    /// Without an exit code, the recorded wrapper pid decides: a live process
    /// is running, a dead one was interrupted and is recorded as failed, and a
    /// job that never recorded a pid never launched and goes back to the queue.
    fn inspect(&self, id: &str) -> Discovered {
        let paths = self.store.paths(id);
        let mut job = self.store.read(id).unwrap_or_else(|| JobStatus::empty(id));

        let mut liveness = Liveness::Unknown;
        if job.exit_code.is_none() {
            liveness = paths.liveness();
            // Read the marker after checking the process so a build finishing
            // in between is not mistaken for an interrupted one.
            let recovered = match (paths.read_exit_code(), liveness) {
                (Some(code), _) => Some(code),
                (None, Liveness::Dead) => {
                    warn!(job_id = %id, pid = ?paths.recorded_pid(), "build process is gone without an exit code; recording it as failed");
                    if let Err(e) = std::fs::remove_file(paths.running_marker())
                        && e.kind() != std::io::ErrorKind::NotFound
                    {
                        warn!(job_id = %id, error = %e, "failed to remove stale liveness marker");
                    }
                    Some(INTERRUPTED_EXIT_CODE)
                }
                (None, _) => None,
            };
            if let Some(code) = recovered {
                job.record_exit_code(code);
                if let Err(e) = self.store.write(&job) {
                    warn!(job_id = %id, error = %e, "failed to persist recovered exit code");
                }
            }
        }

        let class = match job.exit_code {
            Some(0) => Membership::Completed,
            Some(_) => Membership::Erred,
            None if liveness == Liveness::Alive => Membership::Running,
            None => Membership::Queued,
        };
        Discovered {
            job,
            class,
            launchable: paths.launcher_script().is_file(),
        }
    }
}
