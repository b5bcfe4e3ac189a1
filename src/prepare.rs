//! The File Preparer: deterministic transform of a base printable file
//! into the exact file a device will execute.
//!
//! Three rewrites, in order: a fresh cache-busting seed (devices cache
//! uploads by content hash and would happily re-serve a stale copy of a
//! repeated job), sanitization of commands that would stall an unattended
//! run, and rewriting of tool commands to the physical slot the scheduler
//! chose. The ejection motion is appended only when the part is eligible
//! at preparation time; the decision is re-validated at finish time since
//! configuration may change mid-print.

use uuid::Uuid;

use crate::clearing;
use crate::job::Job;
use crate::kinematics;
use crate::machine::AutomationConfig;

/// A device-ready file plus what went into it.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedFile {
    /// Upload name for the file on the device.
    pub file_name: String,

    /// Full G-code content.
    pub content: String,

    /// Whether the ejection motion was appended.
    pub eject_appended: bool,
}

/// Produce the device-ready file for a job on a device with the given
/// automation policy. The job must already carry its dispatched slot.
pub fn prepare(base: &str, job: &Job, automation: &AutomationConfig) -> PreparedFile {
    let mut content = inject_seed(base);

    let (sanitized, m600_count) = sanitize_m600(&content);
    content = sanitized;
    if m600_count > 0 {
        tracing::info!(job = job.id.to_string(), count = m600_count, "removed filament-change commands");
    }

    if let Some(slot) = job.assigned_slot {
        let (rewritten, tool_count) = rewrite_tools(&content, slot.global_index());
        content = rewritten;
        if tool_count > 0 {
            tracing::info!(
                job = job.id.to_string(),
                slot = slot.to_string(),
                count = tool_count,
                "rewrote tool commands"
            );
        }
    }

    if !content.ends_with('\n') {
        content.push('\n');
    }

    let eject_appended = match clearing::eject_eligibility(automation, job.part_height_mm) {
        Ok(()) => {
            if let Some(sequence) = kinematics::clearing_sequence(
                automation.clearing_strategy,
                job.part_height_mm,
                automation.thermal_release_temp,
            ) {
                content.push_str(&sequence);
                true
            } else {
                false
            }
        }
        Err(refusal) => {
            tracing::debug!(job = job.id.to_string(), refusal = format!("{:?}", refusal), "no ejection appended");
            false
        }
    };

    PreparedFile {
        file_name: format!("job-{}.gcode", job.id),
        content,
        eject_appended,
    }
}

/// Prepend a unique marker so the device treats every upload as a new
/// file, bypassing its internal content cache.
pub fn inject_seed(gcode: &str) -> String {
    format!("; FACTORY_SEED: {}\n{}", Uuid::new_v4(), gcode)
}

/// Comment out every M600 (filament change). A manual filament change
/// would pause the device indefinitely with nobody there to feed it.
/// Lines are kept, commented, for the audit trail.
pub fn sanitize_m600(gcode: &str) -> (String, usize) {
    let mut count = 0;
    let out: Vec<String> = gcode
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if !trimmed.starts_with(';') && contains_m600(line) {
                count += 1;
                format!("; [M600 REMOVED] {}", line)
            } else {
                line.to_owned()
            }
        })
        .collect();
    (out.join("\n"), count)
}

fn contains_m600(line: &str) -> bool {
    line.to_uppercase().contains("M600")
}

/// Rewrite every active tool command (`T0`, `T1`, ...) to the slot the
/// scheduler picked, so the physical AMS slot always matches the
/// dispatch decision no matter what the slicer emitted.
pub fn rewrite_tools(gcode: &str, target_slot: usize) -> (String, usize) {
    let mut count = 0;
    let out: Vec<String> = gcode
        .lines()
        .map(|line| match split_tool_command(line) {
            Some(rest) => {
                count += 1;
                format!("T{}{}", target_slot, rest)
            }
            None => line.to_owned(),
        })
        .collect();
    (out.join("\n"), count)
}

// A tool command is `T` at the start of the line followed by at least one
// digit; returns the remainder after the digits.
fn split_tool_command(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('T')?;
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    Some(&rest[digits..])
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::job::FilamentRequirement;
    use crate::machine::{ClearingStrategy, FilamentMaterial, SlotId};

    fn job_with_slot(part_height_mm: f64, slot: usize) -> Job {
        let mut job = Job::new(
            "bracket.gcode",
            vec![FilamentRequirement {
                material: FilamentMaterial::Pla,
                color: "FF0000".to_owned(),
            }],
            part_height_mm,
        );
        job.assigned_slot = Some(SlotId { unit: 0, slot });
        job
    }

    fn eject_automation() -> AutomationConfig {
        AutomationConfig {
            queueing_enabled: true,
            auto_eject: true,
            thermal_release_temp: 28.0,
            clearing_strategy: ClearingStrategy::InertialFling,
        }
    }

    #[test]
    fn test_seed_is_unique_per_preparation() {
        let a = inject_seed("G28\n");
        let b = inject_seed("G28\n");
        assert!(a.starts_with("; FACTORY_SEED: "));
        assert_ne!(a, b);
        assert!(a.ends_with("G28\n"));
    }

    #[test]
    fn test_m600_commented_out() {
        let gcode = "G28\nM600 ; change filament\n; M600 already a comment\nm600\n";
        let (out, count) = sanitize_m600(gcode);
        assert_eq!(count, 2);
        assert!(out.contains("; [M600 REMOVED] M600 ; change filament"));
        assert!(out.contains("; [M600 REMOVED] m600"));
        assert!(out.contains("; M600 already a comment"));
    }

    #[test]
    fn test_tool_rewrite() {
        let gcode = "T0\nG1 X10\nT1 ; second tool\nT255\nM220 T1\n";
        let (out, count) = rewrite_tools(gcode, 2);
        assert_eq!(count, 3);
        assert!(out.contains("T2\nG1 X10\nT2 ; second tool\nT2\n"));
        // Not a line-leading tool command; untouched.
        assert!(out.contains("M220 T1"));
    }

    #[test]
    fn test_prepare_appends_ejection_for_eligible_job() {
        let job = job_with_slot(80.0, 1);
        let prepared = prepare("T0\nG1 X0\n", &job, &eject_automation());
        assert!(prepared.eject_appended);
        assert!(prepared.content.contains("GANTRY SWEEP"));
        assert!(prepared.content.contains("T1\n"));
        assert_eq!(prepared.file_name, format!("job-{}.gcode", job.id));
    }

    #[test]
    fn test_prepare_skips_ejection_below_safety_height() {
        let job = job_with_slot(clearing::MIN_EJECT_HEIGHT_MM - 1.0, 0);
        let prepared = prepare("G28\n", &job, &eject_automation());
        assert!(!prepared.eject_appended);
        assert!(!prepared.content.contains("AUTO-CLEAR"));
    }

    #[test]
    fn test_prepare_skips_ejection_for_manual_strategy() {
        let mut automation = eject_automation();
        automation.clearing_strategy = ClearingStrategy::Manual;
        let prepared = prepare("G28\n", &job_with_slot(80.0, 0), &automation);
        assert!(!prepared.eject_appended);
    }
}
