//! Bed-clearing policy: when a finished part may be removed without a
//! human, and when the bed is cold enough to try.
//!
//! The execution of the clearing motion lives in the per-device
//! controller; this module is the pure decision logic so the gates can be
//! tested exhaustively.

use crate::kinematics;
use crate::machine::{AutomationConfig, ClearingStrategy};

/// Default bed temperature (celsius) at or below which a part releases
/// from the build surface. A still-soft part risks detachment failure or
/// adhesion damage.
pub const DEFAULT_THERMAL_RELEASE_TEMP: f64 = 28.0;

/// Minimum part height for automatic ejection, millimeters. The clearing
/// mechanism cannot safely engage parts shorter than its gantry clearance.
pub const MIN_EJECT_HEIGHT_MM: f64 = kinematics::GANTRY_THRESHOLD;

/// Why automatic ejection was refused for a finished part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EjectRefusal {
    /// Automatic ejection is disabled on the device.
    AutomationDisabled,
    /// The device is configured for manual clearing.
    ManualStrategy,
    /// The part is too short to engage safely.
    PartTooShort,
}

/// Decide whether a finished part may be ejected automatically. Refusal
/// forces the manual path (`AWAITING_CLEARANCE`); it is a policy outcome,
/// not an error.
///
/// The height gate is checked against the physical limit regardless of
/// configuration: toggling `auto_eject` mid-flight can never authorize
/// sweeping a part below [MIN_EJECT_HEIGHT_MM].
pub fn eject_eligibility(automation: &AutomationConfig, part_height_mm: f64) -> Result<(), EjectRefusal> {
    if part_height_mm < MIN_EJECT_HEIGHT_MM {
        return Err(EjectRefusal::PartTooShort);
    }
    if automation.clearing_strategy == ClearingStrategy::Manual {
        return Err(EjectRefusal::ManualStrategy);
    }
    if !automation.auto_eject {
        return Err(EjectRefusal::AutomationDisabled);
    }
    Ok(())
}

/// Whether the bed has cooled enough to clear. `<=` on purpose: the
/// threshold itself is a safe temperature.
pub fn thermally_released(bed_temp: f64, threshold: f64) -> bool {
    bed_temp <= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn automation(auto_eject: bool, strategy: ClearingStrategy) -> AutomationConfig {
        AutomationConfig {
            queueing_enabled: true,
            auto_eject,
            thermal_release_temp: DEFAULT_THERMAL_RELEASE_TEMP,
            clearing_strategy: strategy,
        }
    }

    #[test]
    fn test_eligible_tall_part() {
        let cfg = automation(true, ClearingStrategy::InertialFling);
        assert_eq!(eject_eligibility(&cfg, MIN_EJECT_HEIGHT_MM), Ok(()));
        assert_eq!(eject_eligibility(&cfg, 120.0), Ok(()));
    }

    #[test]
    fn test_short_part_refused_even_with_auto_eject() {
        let cfg = automation(true, ClearingStrategy::InertialFling);
        assert_eq!(
            eject_eligibility(&cfg, MIN_EJECT_HEIGHT_MM - 1.0),
            Err(EjectRefusal::PartTooShort)
        );
        assert_eq!(eject_eligibility(&cfg, 0.0), Err(EjectRefusal::PartTooShort));
    }

    #[test]
    fn test_manual_strategy_refused() {
        let cfg = automation(true, ClearingStrategy::Manual);
        assert_eq!(eject_eligibility(&cfg, 80.0), Err(EjectRefusal::ManualStrategy));
    }

    #[test]
    fn test_auto_eject_off_refused() {
        let cfg = automation(false, ClearingStrategy::MechanicalSweep);
        assert_eq!(eject_eligibility(&cfg, 80.0), Err(EjectRefusal::AutomationDisabled));
    }

    #[test]
    fn test_thermal_release_boundary() {
        assert!(thermally_released(27.9, 28.0));
        assert!(thermally_released(28.0, 28.0));
        assert!(!thermally_released(28.1, 28.0));
    }
}
