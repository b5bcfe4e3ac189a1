//! Decoding of HMS (Health Management System) fault codes into a typed
//! taxonomy, plus the classification the watchdog uses to decide between
//! automatic recovery and escalation.
//!
//! Codes are `XXXX-XXXX-XXXX-XXXX` hex strings. The first segment names
//! the reporting module (`0700` = AMS, `0300` = motion, ...); a handful of
//! exact codes have more specific decodes. Unknown codes still produce a
//! fault, as a warning, so nothing reported by the hardware is dropped.

use chrono::Utc;
use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::machine::{FaultRecord, MachineState};

/// Hardware module that reported a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr)]
#[display(style = "SNAKE_CASE")]
#[serde(rename_all = "snake_case")]
pub enum FaultModule {
    /// Automatic material system: feed, runout, tangle, cutter.
    Ams,
    /// Motion controller: stalls, collisions, step loss.
    Motion,
    /// Axis homing.
    Homing,
    /// Chamber conditioning.
    Chamber,
    /// Nozzle / hotend.
    Nozzle,
    /// Heated bed.
    Bed,
    /// Anything we cannot attribute.
    Unknown,
}

/// Severity of a decoded fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr)]
#[display(style = "SNAKE_CASE")]
#[serde(rename_all = "snake_case")]
pub enum FaultSeverity {
    /// Informational only.
    Info,
    /// Degraded but the run may continue or be resumed.
    Warning,
    /// The run cannot continue without intervention or recovery.
    Critical,
}

/// A decoded hardware fault.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// Normalized (uppercased) code.
    pub code: String,
    /// Reporting module.
    pub module: FaultModule,
    /// Severity.
    pub severity: FaultSeverity,
    /// Human-readable decode.
    pub description: String,
}

impl Fault {
    /// Build the persistent record for this fault, stamped now.
    pub fn record(&self) -> FaultRecord {
        FaultRecord {
            code: self.code.clone(),
            description: self.description.clone(),
            module: self.module,
            severity: self.severity,
            at: Utc::now(),
        }
    }
}

/// What the watchdog should do about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Reissue the interrupted motion, at most
    /// [crate::config::WatchdogConfig::retry_limit] times.
    Retry,
    /// Suspend; an operator can fix the cause and resume the print.
    Pause,
    /// Unrecoverable without an operator clearing the error.
    Fail,
}

// Prefix decode table, first 4 hex digits -> (module, severity, description).
const PREFIX_MAP: &[(&str, FaultModule, FaultSeverity, &str)] = &[
    ("0700", FaultModule::Ams, FaultSeverity::Warning, "AMS filament issue"),
    (
        "0300",
        FaultModule::Motion,
        FaultSeverity::Critical,
        "motion controller error (stall/collision)",
    ),
    ("0500", FaultModule::Homing, FaultSeverity::Critical, "axis homing failure"),
    (
        "0C00",
        FaultModule::Chamber,
        FaultSeverity::Warning,
        "chamber temperature issue",
    ),
    ("0200", FaultModule::Nozzle, FaultSeverity::Warning, "nozzle/hotend issue"),
    ("0400", FaultModule::Bed, FaultSeverity::Warning, "heated bed issue"),
];

// Exact-code overrides with more useful decodes than the prefix gives.
const SPECIFIC_MAP: &[(&str, FaultModule, FaultSeverity, &str)] = &[
    (
        "0700-2000-0002-0002",
        FaultModule::Ams,
        FaultSeverity::Critical,
        "AMS slot 1 empty / feed failure",
    ),
    (
        "0700-2000-0002-0003",
        FaultModule::Ams,
        FaultSeverity::Critical,
        "AMS slot 2 empty / feed failure",
    ),
    (
        "0700-2000-0002-0004",
        FaultModule::Ams,
        FaultSeverity::Critical,
        "AMS slot 3 empty / feed failure",
    ),
    (
        "0700-2000-0002-0005",
        FaultModule::Ams,
        FaultSeverity::Critical,
        "AMS slot 4 empty / feed failure",
    ),
    (
        "0700-4500-0001-0001",
        FaultModule::Ams,
        FaultSeverity::Critical,
        "AMS cutter stuck / step loss",
    ),
    (
        "0700-4500-0001-0002",
        FaultModule::Ams,
        FaultSeverity::Critical,
        "AMS cutter motor stall",
    ),
    (
        "0700-0100-0001-0001",
        FaultModule::Ams,
        FaultSeverity::Warning,
        "AMS filament runout detected",
    ),
    (
        "0700-0200-0001-0001",
        FaultModule::Ams,
        FaultSeverity::Warning,
        "AMS filament tangle detected",
    ),
    (
        "0300-0100-0001-0001",
        FaultModule::Motion,
        FaultSeverity::Critical,
        "X-axis motor stall",
    ),
    (
        "0300-0100-0001-0002",
        FaultModule::Motion,
        FaultSeverity::Critical,
        "Y-axis motor stall",
    ),
    (
        "0300-0100-0001-0003",
        FaultModule::Motion,
        FaultSeverity::Critical,
        "Z-axis motor stall",
    ),
    (
        "0300-0200-0001-0001",
        FaultModule::Motion,
        FaultSeverity::Critical,
        "gantry collision detected",
    ),
    (
        "0300-0300-0001-0001",
        FaultModule::Motion,
        FaultSeverity::Critical,
        "motor step loss detected",
    ),
    (
        "0500-0100-0001-0001",
        FaultModule::Homing,
        FaultSeverity::Critical,
        "X-axis homing timeout",
    ),
    (
        "0500-0100-0001-0002",
        FaultModule::Homing,
        FaultSeverity::Critical,
        "Y-axis homing timeout",
    ),
    (
        "0500-0100-0001-0003",
        FaultModule::Homing,
        FaultSeverity::Critical,
        "Z-axis homing timeout",
    ),
];

/// Decode a single raw code. Never fails: unknown codes come back as
/// [FaultModule::Unknown] warnings.
pub fn decode(raw: &str) -> Fault {
    let code = raw.trim().to_uppercase();

    if let Some((_, module, severity, description)) = SPECIFIC_MAP.iter().find(|(c, ..)| *c == code) {
        return Fault {
            code,
            module: *module,
            severity: *severity,
            description: (*description).to_owned(),
        };
    }

    // Codes come off the wire; a garbled frame must still decode, so no
    // byte slicing that could land inside a multi-byte character.
    let prefix = code.get(..4).unwrap_or(code.as_str());
    if let Some((_, module, severity, description)) = PREFIX_MAP.iter().find(|(p, ..)| *p == prefix) {
        return Fault {
            description: format!("{} ({})", description, code),
            code,
            module: *module,
            severity: *severity,
        };
    }

    tracing::warn!(code = code.as_str(), "unknown HMS code");
    Fault {
        description: format!("unknown hardware error ({})", code),
        code,
        module: FaultModule::Unknown,
        severity: FaultSeverity::Warning,
    }
}

/// Decode a batch of raw codes, in order.
pub fn decode_all<S: AsRef<str>>(raw: &[S]) -> Vec<Fault> {
    raw.iter().map(|code| decode(code.as_ref())).collect()
}

/// The most severe fault in a batch, if any.
pub fn most_severe(faults: &[Fault]) -> Option<&Fault> {
    faults.iter().max_by_key(|fault| fault.severity)
}

/// Decide what the watchdog does about a fault, given what the device was
/// doing when it arrived.
///
/// Step-loss, stall, and collision faults while executing motion (a print
/// or a clearing move) are the expected failure mode of the ejection
/// mechanism and get a bounded retry; the retry budget lives in the
/// controller. Filament-side faults suspend the run so an operator can
/// fix the spool and resume. Critical thermal faults end the run
/// immediately, no retry.
pub fn disposition(fault: &Fault, state: MachineState) -> FaultDisposition {
    let in_motion = matches!(state, MachineState::Printing | MachineState::ClearingBed);

    match (fault.module, fault.severity) {
        (FaultModule::Motion | FaultModule::Homing, _) if in_motion => FaultDisposition::Retry,
        (FaultModule::Motion | FaultModule::Homing, _) => FaultDisposition::Fail,
        (FaultModule::Ams, _) => FaultDisposition::Pause,
        (FaultModule::Chamber, _) => FaultDisposition::Pause,
        (FaultModule::Nozzle | FaultModule::Bed, FaultSeverity::Critical) => FaultDisposition::Fail,
        (FaultModule::Nozzle | FaultModule::Bed, _) => FaultDisposition::Pause,
        (FaultModule::Unknown, FaultSeverity::Critical) => FaultDisposition::Fail,
        (FaultModule::Unknown, _) => FaultDisposition::Pause,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_decode_specific_code() {
        let fault = decode("0700-4500-0001-0002");
        assert_eq!(fault.module, FaultModule::Ams);
        assert_eq!(fault.severity, FaultSeverity::Critical);
        assert_eq!(fault.description, "AMS cutter motor stall");
    }

    #[test]
    fn test_decode_prefix_fallback() {
        let fault = decode("0300-9999-0000-0001");
        assert_eq!(fault.module, FaultModule::Motion);
        assert_eq!(fault.severity, FaultSeverity::Critical);
        assert!(fault.description.contains("0300-9999-0000-0001"));
    }

    #[test]
    fn test_decode_unknown_is_warning() {
        let fault = decode("ffff-0000-0000-0000");
        assert_eq!(fault.module, FaultModule::Unknown);
        assert_eq!(fault.severity, FaultSeverity::Warning);
        // Input is normalized to uppercase.
        assert_eq!(fault.code, "FFFF-0000-0000-0000");
    }

    #[test]
    fn test_decode_survives_arbitrary_bytes() {
        // A garbled frame where byte 4 is mid-character: still a fault,
        // never a panic.
        let fault = decode("एएए");
        assert_eq!(fault.module, FaultModule::Unknown);
        assert_eq!(fault.severity, FaultSeverity::Warning);
    }

    #[test]
    fn test_most_severe() {
        let faults = decode_all(&["0700-0100-0001-0001", "0300-0200-0001-0001"]);
        let worst = most_severe(&faults).unwrap();
        assert_eq!(worst.module, FaultModule::Motion);
        assert_eq!(worst.severity, FaultSeverity::Critical);
    }

    #[test]
    fn test_motion_fault_retryable_only_in_motion() {
        let fault = decode("0300-0300-0001-0001");
        assert_eq!(disposition(&fault, MachineState::ClearingBed), FaultDisposition::Retry);
        assert_eq!(disposition(&fault, MachineState::Printing), FaultDisposition::Retry);
        assert_eq!(disposition(&fault, MachineState::Idle), FaultDisposition::Fail);
    }

    #[test]
    fn test_runout_pauses() {
        let fault = decode("0700-0100-0001-0001");
        assert_eq!(disposition(&fault, MachineState::Printing), FaultDisposition::Pause);
    }
}
