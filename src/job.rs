//! Job data model and the in-memory job store.
//!
//! A job is born `Pending` and is only archived after reaching a terminal
//! status (`Completed` or `Failed`). While assigned, the owning device's
//! controller is the only writer of its status.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::machine::{FilamentMaterial, SlotId};

/// Lifecycle status of a job, mirroring the device's job-specific
/// sub-path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr)]
#[display(style = "SNAKE_CASE")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for an eligible device.
    Pending,
    /// Claimed; file transfer in progress.
    Uploading,
    /// Executing on a device.
    Printing,
    /// Execution done; the part is still on the plate.
    Finished,
    /// The clearing motion is running for this job's part.
    BedClearing,
    /// The part left the plate (automatically or confirmed by an
    /// operator). Terminal.
    Completed,
    /// Transfer, execution, or clearing failed. Terminal.
    Failed,
}

impl JobStatus {
    /// Whether the job will never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One filament demand of a job. Jobs on current hardware use a single
/// requirement; the list form keeps multi-material jobs representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FilamentRequirement {
    /// Required material type.
    pub material: FilamentMaterial,

    /// Required color as hex, matched exactly after normalization.
    pub color: String,
}

/// A unit of queued work: one printable file bound for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique id.
    pub id: Uuid,

    /// Reference to the base printable file in the file store.
    pub file_id: String,

    /// Serial of the device executing this job. `Some` implies that
    /// device's current job is this one.
    pub assigned_serial: Option<String>,

    /// The material slot the dispatcher chose, once assigned.
    pub assigned_slot: Option<SlotId>,

    /// Current status.
    pub status: JobStatus,

    /// Filament demands; all must be satisfiable by the device.
    pub requirements: Vec<FilamentRequirement>,

    /// Height of the tallest part on the plate, used by the eject-safety
    /// gate.
    pub part_height_mm: f64,

    /// Failure detail, set when `status == Failed`.
    pub error: Option<String>,

    /// When the job was queued.
    pub created_at: DateTime<Utc>,

    /// When execution started on a device.
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Queue a new job.
    pub fn new(file_id: &str, requirements: Vec<FilamentRequirement>, part_height_mm: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_id: file_id.to_owned(),
            assigned_serial: None,
            assigned_slot: None,
            status: JobStatus::Pending,
            requirements,
            part_height_mm,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Errors from job store operations.
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum QueueError {
    /// The referenced job does not exist.
    #[error("no such job: {0}")]
    NotFound(Uuid),

    /// A status transition was requested from the wrong starting status.
    #[error("job {id} is {actual}, expected {expected}")]
    WrongStatus {
        /// The job in question.
        id: Uuid,
        /// Status the operation requires.
        expected: JobStatus,
        /// Status the job actually has.
        actual: JobStatus,
    },
}

/// In-memory job store shared between the dispatcher and the device
/// controllers. Each entry is locked individually, so one device updating
/// its job never blocks a scheduling tick over another.
#[derive(Default)]
pub struct JobQueue {
    jobs: DashMap<Uuid, Job>,
}

impl JobQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job to the queue.
    pub fn submit(&self, job: Job) -> Uuid {
        let id = job.id;
        tracing::info!(job = id.to_string(), file = job.file_id, "job queued");
        self.jobs.insert(id, job);
        id
    }

    /// Snapshot of one job.
    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    /// Snapshot of every job.
    pub fn all(&self) -> Vec<Job> {
        self.jobs.iter().map(|j| j.clone()).collect()
    }

    /// Pending jobs, first-created first.
    pub fn pending(&self) -> Vec<Job> {
        let mut pending: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.clone())
            .collect();
        pending.sort_by_key(|j| j.created_at);
        pending
    }

    /// Claim a pending job for a device: `Pending -> Uploading`. Refuses
    /// if the job is no longer pending, so a stale tick cannot steal a
    /// job that another path already took.
    pub fn claim(&self, id: Uuid, serial: &str, slot: SlotId) -> Result<Job, QueueError> {
        let mut job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status != JobStatus::Pending {
            return Err(QueueError::WrongStatus {
                id,
                expected: JobStatus::Pending,
                actual: job.status,
            });
        }
        job.status = JobStatus::Uploading;
        job.assigned_serial = Some(serial.to_owned());
        job.assigned_slot = Some(slot);
        Ok(job.clone())
    }

    /// Return a claimed job to the queue after a failed claim or upload
    /// race. Nothing is dropped: the job is retried on a later tick.
    pub fn release(&self, id: Uuid) -> Result<(), QueueError> {
        let mut job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.status = JobStatus::Pending;
        job.assigned_serial = None;
        job.assigned_slot = None;
        Ok(())
    }

    /// Record the start of execution: `Uploading -> Printing`.
    pub fn mark_printing(&self, id: Uuid) -> Result<(), QueueError> {
        self.transition(id, JobStatus::Uploading, JobStatus::Printing, |job| {
            job.started_at = Some(Utc::now());
        })
    }

    /// Record a normal finish event: `Printing -> Finished`.
    pub fn mark_finished(&self, id: Uuid) -> Result<(), QueueError> {
        self.transition(id, JobStatus::Printing, JobStatus::Finished, |_| {})
    }

    /// Record the start of the clearing motion: `Finished -> BedClearing`.
    pub fn mark_bed_clearing(&self, id: Uuid) -> Result<(), QueueError> {
        self.transition(id, JobStatus::Finished, JobStatus::BedClearing, |_| {})
    }

    /// Record completion, from either the automatic or the manual path.
    pub fn mark_completed(&self, id: Uuid) -> Result<(), QueueError> {
        let mut job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if !matches!(job.status, JobStatus::Finished | JobStatus::BedClearing) {
            return Err(QueueError::WrongStatus {
                id,
                expected: JobStatus::Finished,
                actual: job.status,
            });
        }
        job.status = JobStatus::Completed;
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Record failure from any non-terminal status.
    pub fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let mut job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(QueueError::WrongStatus {
                id,
                expected: JobStatus::Printing,
                actual: job.status,
            });
        }
        job.status = JobStatus::Failed;
        job.error = Some(error.to_owned());
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Drop terminal jobs from the store, returning how many were
    /// archived.
    pub fn archive_terminal(&self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !job.status.is_terminal());
        before - self.jobs.len()
    }

    fn transition(
        &self,
        id: Uuid,
        expected: JobStatus,
        next: JobStatus,
        apply: impl FnOnce(&mut Job),
    ) -> Result<(), QueueError> {
        let mut job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status != expected {
            return Err(QueueError::WrongStatus {
                id,
                expected,
                actual: job.status,
            });
        }
        job.status = next;
        apply(&mut job);
        Ok(())
    }
}
