//! Core data model for a single fleet device: lifecycle states, material
//! slots, automation configuration, and the snapshot published to
//! collaborators.

use chrono::{DateTime, Utc};
use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::hms::{FaultModule, FaultSeverity};

/// Lifecycle state of one device. The controller owning the device is the
/// only writer; everyone else observes these through [MachineSnapshot].
///
/// No state is terminal for the device itself -- `Error` and
/// `AwaitingClearance` are exited through operator commands or watchdog
/// recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr)]
#[display(style = "SNAKE_CASE")]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    /// Ready to accept a job from the scheduler.
    Idle,

    /// A prepared file is being transferred to the device.
    Uploading,

    /// Actively executing a job.
    Printing,

    /// Finished a job; waiting for the bed to reach the thermal-release
    /// threshold before automatic clearing.
    Cooldown,

    /// Executing the physical clearing motion.
    ClearingBed,

    /// The build surface holds a finished part and an operator must
    /// confirm it has been removed.
    AwaitingClearance,

    /// Execution suspended; resumable by an operator.
    Paused,

    /// A fault the watchdog could not recover from. Requires an explicit
    /// clear-error command.
    Error,

    /// Unreachable. Restored to `Idle` once telemetry resumes and the
    /// device reports no active job.
    Offline,
}

/// The mechanical method used to remove a finished part from the build
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, FromStr)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClearingStrategy {
    /// An operator removes the part and confirms clearance.
    Manual,

    /// Bed-slinger fling: sweep the part off with the gantry beam (tall
    /// parts) or push it with the toolhead (short parts).
    InertialFling,

    /// CoreXY sweep: drop to a safe Z and sweep the full plate with the
    /// toolhead.
    MechanicalSweep,
}

/// Filament material loaded in a slot or demanded by a job. Parsing is
/// case-insensitive; matching between jobs and slots is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display)]
#[display(style = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum FilamentMaterial {
    /// Polylactic acid, the workhorse.
    Pla,
    /// Polyethylene terephthalate glycol.
    Petg,
    /// Acrylonitrile butadiene styrene.
    Abs,
    /// Acrylonitrile styrene acrylate.
    Asa,
    /// Thermoplastic polyurethane (flexible).
    Tpu,
    /// Polycarbonate.
    Pc,
    /// Polyvinyl alcohol (soluble support).
    Pva,
}

impl std::str::FromStr for FilamentMaterial {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PLA" => Ok(Self::Pla),
            "PETG" | "PET-G" => Ok(Self::Petg),
            "ABS" => Ok(Self::Abs),
            "ASA" => Ok(Self::Asa),
            "TPU" => Ok(Self::Tpu),
            "PC" => Ok(Self::Pc),
            "PVA" => Ok(Self::Pva),
            other => anyhow::bail!("unknown filament material: {}", other),
        }
    }
}

/// Identity of a material slot: AMS unit index plus slot index within the
/// unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct SlotId {
    /// Which AMS unit the slot belongs to.
    pub unit: usize,

    /// Slot index within the unit (0..4 on current hardware).
    pub slot: usize,
}

impl SlotId {
    /// Number of slots per AMS unit on supported hardware.
    pub const SLOTS_PER_UNIT: usize = 4;

    /// The flat index used in tool commands (`T<n>`) and AMS mappings.
    pub fn global_index(&self) -> usize {
        self.unit * Self::SLOTS_PER_UNIT + self.slot
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.unit, self.slot)
    }
}

/// One loaded spool of filament.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FilamentSlot {
    /// Where the spool is loaded.
    pub id: SlotId,

    /// Material type, if the slot is occupied.
    pub material: Option<FilamentMaterial>,

    /// Normalized `RRGGBB` hex color, uppercase, no leading `#`.
    pub color: Option<String>,

    /// Remaining quantity as a fraction in `0.0..=1.0`.
    pub remaining: f64,
}

impl FilamentSlot {
    /// An empty slot at the given position.
    pub fn empty(id: SlotId) -> Self {
        Self {
            id,
            material: None,
            color: None,
            remaining: 0.0,
        }
    }

    /// Whether this slot satisfies a (material, color) demand. Both must
    /// match; color matching is exact, not nearest.
    pub fn satisfies(&self, material: FilamentMaterial, color: &str) -> bool {
        self.material == Some(material) && self.color.as_deref() == Some(normalize_color(color).as_str())
    }
}

/// Normalize a hex color for exact comparison: strip any leading `#`,
/// uppercase, and drop an alpha suffix (devices report 8-digit `RRGGBBAA`
/// values).
pub fn normalize_color(color: &str) -> String {
    let trimmed = color.trim().trim_start_matches('#');
    // Byte-indexed slicing would panic on multi-byte input, and these
    // strings come straight out of telemetry frames.
    let base = match trimmed.get(..6) {
        Some(rgb) if trimmed.len() == 8 => rgb,
        _ => trimmed,
    };
    base.to_uppercase()
}

/// Per-device automation policy. Updates take effect on the next relevant
/// transition, never retroactively on an in-flight decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AutomationConfig {
    /// Whether the scheduler may assign queued jobs to this device.
    pub queueing_enabled: bool,

    /// Whether finished parts may be removed without an operator.
    pub auto_eject: bool,

    /// Maximum bed temperature (celsius) at which ejection is considered
    /// safe.
    pub thermal_release_temp: f64,

    /// How finished parts come off the plate.
    pub clearing_strategy: ClearingStrategy,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            queueing_enabled: true,
            auto_eject: false,
            thermal_release_temp: crate::clearing::DEFAULT_THERMAL_RELEASE_TEMP,
            clearing_strategy: ClearingStrategy::Manual,
        }
    }
}

/// Make and model of a device, for display purposes only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct MachineMakeModel {
    /// The manufacturer.
    pub manufacturer: Option<String>,

    /// The model line (e.g. "A1", "X1C").
    pub model: Option<String>,
}

/// The last hardware fault observed on a device, recovered or not. Kept
/// current even when the watchdog handled the fault silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FaultRecord {
    /// The raw reported code (`XXXX-XXXX-XXXX-XXXX`).
    pub code: String,

    /// Human-readable decode of the code.
    pub description: String,

    /// Which hardware module reported it.
    pub module: FaultModule,

    /// How bad it was.
    pub severity: FaultSeverity,

    /// When it was observed.
    pub at: DateTime<Utc>,
}

/// Point-in-time view of one device, published by its controller after
/// every transition and telemetry frame. This is the authoritative state;
/// collaborators must never invent intermediate states of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MachineSnapshot {
    /// Immutable device key.
    pub serial: String,

    /// Operator-facing name.
    pub name: String,

    /// Make/model information.
    pub make_model: MachineMakeModel,

    /// Current lifecycle state.
    pub state: MachineState,

    /// Id of the in-flight job, if any. At most one at any time.
    pub current_job: Option<uuid::Uuid>,

    /// Print progress percent, `0..=100`.
    pub progress: u8,

    /// Remaining time estimate, minutes.
    pub remaining_time_min: u32,

    /// Latest nozzle temperature, celsius.
    pub nozzle_temp: f64,

    /// Latest bed temperature, celsius.
    pub bed_temp: f64,

    /// Loaded material slots, ordered by (unit, slot).
    pub slots: Vec<FilamentSlot>,

    /// Automation policy in effect.
    pub automation: AutomationConfig,

    /// Most recent fault, recovered or not.
    pub last_fault: Option<FaultRecord>,
}

impl MachineSnapshot {
    /// A fresh snapshot for a device that has not yet reported telemetry.
    pub fn new(serial: &str, name: &str, make_model: MachineMakeModel, automation: AutomationConfig) -> Self {
        Self {
            serial: serial.to_owned(),
            name: name.to_owned(),
            make_model,
            state: MachineState::Offline,
            current_job: None,
            progress: 0,
            remaining_time_min: 0,
            nozzle_temp: 0.0,
            bed_temp: 0.0,
            slots: Vec::new(),
            automation,
            last_fault: None,
        }
    }

    /// Find the slot satisfying a (material, color) demand with the least
    /// filament remaining. Partially depleted spools are preferred so they
    /// get used up first.
    pub fn best_matching_slot(&self, material: FilamentMaterial, color: &str) -> Option<&FilamentSlot> {
        self.slots
            .iter()
            .filter(|slot| slot.satisfies(material, color))
            .min_by(|a, b| a.remaining.partial_cmp(&b.remaining).unwrap_or(std::cmp::Ordering::Equal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(unit: usize, idx: usize, material: FilamentMaterial, color: &str, remaining: f64) -> FilamentSlot {
        FilamentSlot {
            id: SlotId { unit, slot: idx },
            material: Some(material),
            color: Some(color.to_owned()),
            remaining,
        }
    }

    #[test]
    fn test_normalize_color() {
        assert_eq!(normalize_color("#ff0000"), "FF0000");
        assert_eq!(normalize_color("FF0000FF"), "FF0000");
        assert_eq!(normalize_color(" 00ff00 "), "00FF00");
        // 8 bytes but not 8 ASCII characters: not a color, but it must
        // come back unharmed rather than panic.
        assert_eq!(normalize_color("aaaaaéa"), "AAAAAÉA");
    }

    #[test]
    fn test_slot_satisfies_exact_only() {
        let s = slot(0, 0, FilamentMaterial::Pla, "FF0000", 0.8);
        assert!(s.satisfies(FilamentMaterial::Pla, "#ff0000"));
        assert!(!s.satisfies(FilamentMaterial::Petg, "#ff0000"));
        // Close is not a match.
        assert!(!s.satisfies(FilamentMaterial::Pla, "#fe0000"));
    }

    #[test]
    fn test_best_matching_slot_prefers_depleted() {
        let mut snap = MachineSnapshot::new(
            "01S00C123",
            "printer-1",
            MachineMakeModel::default(),
            AutomationConfig::default(),
        );
        snap.slots = vec![
            slot(0, 0, FilamentMaterial::Pla, "FF0000", 0.8),
            slot(0, 1, FilamentMaterial::Pla, "FF0000", 0.25),
            slot(0, 2, FilamentMaterial::Petg, "000000", 0.5),
        ];

        let best = snap.best_matching_slot(FilamentMaterial::Pla, "FF0000").unwrap();
        assert_eq!(best.id, SlotId { unit: 0, slot: 1 });
        assert!(snap.best_matching_slot(FilamentMaterial::Abs, "FF0000").is_none());
    }

    #[test]
    fn test_material_from_str() {
        assert_eq!("pla".parse::<FilamentMaterial>().unwrap(), FilamentMaterial::Pla);
        assert_eq!("PET-G".parse::<FilamentMaterial>().unwrap(), FilamentMaterial::Petg);
        assert!("wood".parse::<FilamentMaterial>().is_err());
    }

    #[test]
    fn test_state_display_round_trip() {
        assert_eq!(MachineState::AwaitingClearance.to_string(), "AWAITING_CLEARANCE");
        assert_eq!(
            "CLEARING_BED".parse::<MachineState>().unwrap(),
            MachineState::ClearingBed
        );
        assert_eq!(
            "inertial_fling".parse::<ClearingStrategy>().unwrap(),
            ClearingStrategy::InertialFling
        );
    }
}
