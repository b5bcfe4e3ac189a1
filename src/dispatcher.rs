//! The scheduler: a periodic tick that matches pending jobs to idle
//! devices with the right material loaded.
//!
//! Interval-driven rather than event-driven on purpose. A tick reads
//! consistent snapshots, decides, and claims; reacting to every state
//! change would race concurrent claims against in-flight transitions.

use std::sync::Arc;

use crate::fleet::Fleet;
use crate::job::{Job, JobQueue, JobStatus};
use crate::machine::{MachineSnapshot, MachineState, SlotId};

/// The scheduler over one fleet and one queue.
pub struct Dispatcher {
    fleet: Arc<Fleet>,
    queue: Arc<JobQueue>,
}

/// A dispatch decision for one job: which device, out of which slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// The chosen device serial.
    pub serial: String,
    /// The slot whose spool will feed the job.
    pub slot: SlotId,
}

impl Dispatcher {
    /// A dispatcher over a fleet and a queue.
    pub fn new(fleet: Arc<Fleet>, queue: Arc<JobQueue>) -> Self {
        Self { fleet, queue }
    }

    /// Run forever, ticking at the configured interval.
    pub async fn run(self, tick_secs: u64) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One scheduling pass: recover stuck claims, then walk the pending
    /// queue oldest-first and try to place each job. Returns how many jobs
    /// were dispatched.
    pub async fn tick(&self) -> usize {
        self.recover_stale_claims();

        let mut dispatched = 0;
        for job in self.queue.pending() {
            if self.dispatch(&job).await {
                dispatched += 1;
            }
        }
        dispatched
    }

    async fn dispatch(&self, job: &Job) -> bool {
        let snapshots = self.fleet.snapshots();
        let Some(assignment) = choose_device(job, &snapshots) else {
            tracing::debug!(job = job.id.to_string(), "no eligible device this tick");
            return false;
        };

        // Claim the job first; a concurrent path that already took it
        // makes this tick a no-op.
        let claimed = match self.queue.claim(job.id, &assignment.serial, assignment.slot) {
            Ok(job) => job,
            Err(e) => {
                tracing::debug!(job = job.id.to_string(), error = e.to_string(), "claim lost");
                return false;
            }
        };

        let Some(handle) = self.fleet.get(&assignment.serial) else {
            let _ = self.queue.release(job.id);
            return false;
        };

        match handle.claim(claimed).await {
            Ok(()) => {
                tracing::info!(
                    job = job.id.to_string(),
                    serial = assignment.serial,
                    slot = assignment.slot.to_string(),
                    "job dispatched"
                );
                true
            }
            Err(refused) => {
                // The device changed its mind between snapshot and claim.
                // The job goes back to the queue for a later tick.
                tracing::debug!(
                    job = job.id.to_string(),
                    serial = assignment.serial,
                    refused = refused.to_string(),
                    "device refused claim, releasing job"
                );
                let _ = self.queue.release(job.id);
                false
            }
        }
    }

    /// A job can be stranded in `Uploading` if its controller died between
    /// the claim and the outcome. When the assigned device is visibly idle
    /// with no knowledge of the job, the claim is stale; release it.
    fn recover_stale_claims(&self) {
        for job in self.queue.all() {
            if job.status != JobStatus::Uploading {
                continue;
            }
            let Some(serial) = &job.assigned_serial else { continue };
            let stale = match self.fleet.get(serial) {
                Some(handle) => {
                    let snap = handle.snapshot();
                    snap.state == MachineState::Idle && snap.current_job != Some(job.id)
                }
                // Device no longer registered at all.
                None => true,
            };
            if stale {
                tracing::warn!(job = job.id.to_string(), serial = serial, "recovering stale claim");
                let _ = self.queue.release(job.id);
            }
        }
    }
}

/// Pick the device for a job, or `None` when no device qualifies.
///
/// Eligible devices are idle, open for queueing, and hold a slot
/// satisfying every requirement of the job. Among them the winner is the
/// one whose matching spool has the least filament remaining, so partial
/// spools are drained before fresh ones are opened.
pub fn choose_device(job: &Job, snapshots: &[MachineSnapshot]) -> Option<Assignment> {
    let mut best: Option<(f64, Assignment)> = None;

    for snap in snapshots {
        if snap.state != MachineState::Idle || !snap.automation.queueing_enabled {
            continue;
        }

        // Every requirement must be satisfiable; the dispatched slot is
        // the one matching the first requirement, which is what the tool
        // commands get rewritten to.
        let mut slots = job
            .requirements
            .iter()
            .map(|req| snap.best_matching_slot(req.material, &req.color));
        let Some(Some(first)) = slots.next() else { continue };
        if !slots.all(|s| s.is_some()) {
            continue;
        }

        let candidate = (
            first.remaining,
            Assignment {
                serial: snap.serial.clone(),
                slot: first.id,
            },
        );
        match &best {
            Some((remaining, _)) if *remaining <= candidate.0 => {}
            _ => best = Some(candidate),
        }
    }

    best.map(|(_, assignment)| assignment)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::job::FilamentRequirement;
    use crate::machine::{AutomationConfig, FilamentMaterial, FilamentSlot, MachineMakeModel};

    fn snapshot(serial: &str, state: MachineState, slots: Vec<FilamentSlot>) -> MachineSnapshot {
        let mut snap = MachineSnapshot::new(serial, serial, MachineMakeModel::default(), AutomationConfig::default());
        snap.state = state;
        snap.slots = slots;
        snap
    }

    fn loaded(unit: usize, idx: usize, material: FilamentMaterial, color: &str, remaining: f64) -> FilamentSlot {
        FilamentSlot {
            id: SlotId { unit, slot: idx },
            material: Some(material),
            color: Some(color.to_owned()),
            remaining,
        }
    }

    fn red_pla_job() -> Job {
        Job::new(
            "whistle.gcode",
            vec![FilamentRequirement {
                material: FilamentMaterial::Pla,
                color: "FF0000".to_owned(),
            }],
            60.0,
        )
    }

    #[test]
    fn test_choose_prefers_most_depleted_spool() {
        let job = red_pla_job();
        let snapshots = vec![
            snapshot(
                "fresh",
                MachineState::Idle,
                vec![loaded(0, 0, FilamentMaterial::Pla, "FF0000", 0.9)],
            ),
            snapshot(
                "depleted",
                MachineState::Idle,
                vec![loaded(0, 2, FilamentMaterial::Pla, "FF0000", 0.2)],
            ),
        ];

        let assignment = choose_device(&job, &snapshots).unwrap();
        assert_eq!(assignment.serial, "depleted");
        assert_eq!(assignment.slot, SlotId { unit: 0, slot: 2 });
    }

    #[test]
    fn test_choose_skips_busy_and_mismatched() {
        let job = red_pla_job();
        let snapshots = vec![
            // Right material, busy.
            snapshot(
                "busy",
                MachineState::Printing,
                vec![loaded(0, 0, FilamentMaterial::Pla, "FF0000", 0.5)],
            ),
            // Idle, wrong color.
            snapshot(
                "wrong-color",
                MachineState::Idle,
                vec![loaded(0, 0, FilamentMaterial::Pla, "0000FF", 0.5)],
            ),
            // Idle, wrong material.
            snapshot(
                "wrong-material",
                MachineState::Idle,
                vec![loaded(0, 0, FilamentMaterial::Petg, "FF0000", 0.5)],
            ),
        ];
        assert_eq!(choose_device(&job, &snapshots), None);
    }

    #[test]
    fn test_choose_respects_queueing_disabled() {
        let job = red_pla_job();
        let mut snap = snapshot(
            "closed",
            MachineState::Idle,
            vec![loaded(0, 0, FilamentMaterial::Pla, "FF0000", 0.5)],
        );
        snap.automation.queueing_enabled = false;
        assert_eq!(choose_device(&job, &[snap]), None);
    }
}
