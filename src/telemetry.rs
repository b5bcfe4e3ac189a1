//! Telemetry ingest payloads: the per-device stream of status,
//! temperature, progress, and fault codes consumed by the controllers.
//!
//! A [Report] is one frame as delivered by the wire-protocol collaborator.
//! Fields are optional because devices push partial updates; the
//! controller merges each frame into its running view.

use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};

use crate::machine::{normalize_color, FilamentSlot, SlotId};

/// Execution state as the device itself reports it. This is the device's
/// vocabulary, not ours; the controller maps it onto
/// [crate::machine::MachineState] together with everything else it knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, FromStr)]
#[display(style = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportedState {
    /// No job running.
    Idle,
    /// Executing.
    Running,
    /// Normal end of the current job.
    Finish,
    /// Suspended.
    Pause,
    /// The device announced it is going away.
    Offline,
}

/// One material slot as reported by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotReading {
    /// AMS unit index.
    pub unit: usize,

    /// Slot index within the unit.
    pub slot: usize,

    /// Raw material string (e.g. "PLA"), empty when the slot is
    /// unloaded.
    pub material: Option<String>,

    /// Raw color, typically 8-digit `RRGGBBAA` hex.
    pub color: Option<String>,

    /// Remaining filament percent, `0..=100`.
    pub remaining_percent: Option<u8>,
}

impl SlotReading {
    /// Normalize into the fleet's slot model. Unparseable materials are
    /// treated as an unloaded slot rather than a hard error; one garbled
    /// tray must not poison the device.
    pub fn to_slot(&self) -> FilamentSlot {
        let id = SlotId {
            unit: self.unit,
            slot: self.slot,
        };
        let material = self
            .material
            .as_deref()
            .filter(|m| !m.is_empty())
            .and_then(|m| m.parse().ok());
        FilamentSlot {
            id,
            material,
            color: self.color.as_deref().map(normalize_color),
            remaining: self.remaining_percent.map(|p| f64::from(p.min(100)) / 100.0).unwrap_or(0.0),
        }
    }
}

/// One telemetry frame from one device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Report {
    /// Device-reported execution state.
    pub state: Option<ReportedState>,

    /// Bed temperature, celsius.
    pub bed_temp: Option<f64>,

    /// Nozzle temperature, celsius.
    pub nozzle_temp: Option<f64>,

    /// Progress percent of the running job.
    pub progress: Option<u8>,

    /// Remaining time estimate, minutes.
    pub remaining_time_min: Option<u32>,

    /// Active HMS fault codes, raw.
    #[serde(default)]
    pub hms: Vec<String>,

    /// Material slot inventory, when the frame includes it.
    pub slots: Option<Vec<SlotReading>>,
}

impl Report {
    /// Parse one frame from the JSON the wire-protocol collaborator
    /// delivers.
    pub fn from_json(frame: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// A frame carrying only an execution state.
    pub fn state(state: ReportedState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    /// A frame carrying only a bed temperature.
    pub fn bed_temp(temp: f64) -> Self {
        Self {
            bed_temp: Some(temp),
            ..Default::default()
        }
    }

    /// A frame carrying only HMS codes.
    pub fn faults<S: Into<String>>(codes: Vec<S>) -> Self {
        Self {
            hms: codes.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::machine::FilamentMaterial;

    #[test]
    fn test_slot_reading_normalizes() {
        let reading = SlotReading {
            unit: 1,
            slot: 2,
            material: Some("pla".to_owned()),
            color: Some("ff0000ff".to_owned()),
            remaining_percent: Some(80),
        };
        let slot = reading.to_slot();
        assert_eq!(slot.id.global_index(), 6);
        assert_eq!(slot.material, Some(FilamentMaterial::Pla));
        assert_eq!(slot.color.as_deref(), Some("FF0000"));
        assert_eq!(slot.remaining, 0.8);
    }

    #[test]
    fn test_garbled_material_reads_as_unloaded() {
        let reading = SlotReading {
            unit: 0,
            slot: 0,
            material: Some("???".to_owned()),
            color: None,
            remaining_percent: None,
        };
        let slot = reading.to_slot();
        assert_eq!(slot.material, None);
        assert_eq!(slot.remaining, 0.0);
    }

    #[test]
    fn test_report_from_json() -> anyhow::Result<()> {
        let frame = r#"{
            "state": "RUNNING",
            "bed_temp": 55.0,
            "progress": 42,
            "hms": ["0700-0100-0001-0001"],
            "slots": [{"unit": 0, "slot": 1, "material": "PLA", "color": "FF0000FF", "remaining_percent": 60}]
        }"#;
        let report = Report::from_json(frame)?;
        assert_eq!(report.state, Some(ReportedState::Running));
        assert_eq!(report.bed_temp, Some(55.0));
        assert_eq!(report.hms, vec!["0700-0100-0001-0001".to_owned()]);
        assert_eq!(report.slots.unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn test_reported_state_parse() -> testresult::TestResult {
        assert_eq!("FINISH".parse::<ReportedState>()?, ReportedState::Finish);
        assert_eq!(ReportedState::Running.to_string(), "RUNNING");
        Ok(())
    }
}
