//! Generation of the strategy-specific clearing motion sequences.
//!
//! All constants here were validated on hardware; do not tune them without
//! re-running the physical tests.

use crate::machine::ClearingStrategy;

/// Absolute minimum Z for any clearing move, millimeters.
pub const SAFE_Z_FLOOR: f64 = 2.0;

/// Height of the gantry beam bottom above the nozzle tip, millimeters.
pub const BEAM_OFFSET: f64 = 33.0;

/// Minimum part height for using the gantry beam instead of the toolhead,
/// millimeters.
pub const GANTRY_THRESHOLD: f64 = 50.0;

/// Prefix prepended to a retried motion: raise motor current so the same
/// move has more authority against whatever stalled it the first time.
pub const RECOVERY_CURRENT_BOOST: &str = "M17 X1.5 Y1.5 Z1.5 ; raise motor current for retry\n";

/// The Z height at which the gantry beam contacts a part of the given
/// height: 60% up the part for leverage, clamped to the safe floor.
pub fn sweep_z(part_height_mm: f64) -> f64 {
    let target_beam_z = part_height_mm * 0.6;
    (target_beam_z - BEAM_OFFSET).max(SAFE_Z_FLOOR)
}

/// The Z height for a toolhead push on a short part: just above the part,
/// never below 5 mm.
pub fn push_z(part_height_mm: f64) -> f64 {
    (part_height_mm + 1.0).max(5.0)
}

/// Generate the clearing G-code for a strategy and part height. Returns
/// `None` for [ClearingStrategy::Manual]: no motion is ever generated for
/// a manually cleared device.
pub fn clearing_sequence(strategy: ClearingStrategy, part_height_mm: f64, thermal_release_temp: f64) -> Option<String> {
    match strategy {
        ClearingStrategy::Manual => None,
        ClearingStrategy::InertialFling => {
            if part_height_mm >= GANTRY_THRESHOLD {
                Some(gantry_sweep(part_height_mm, thermal_release_temp))
            } else {
                Some(toolhead_push(part_height_mm, thermal_release_temp))
            }
        }
        ClearingStrategy::MechanicalSweep => Some(mechanical_sweep(thermal_release_temp)),
    }
}

// Bed-slinger sweep with the gantry beam. Setup at Y256 (bed forward, so
// the nozzle sits at the back of the part), then drive the bed backward so
// the beam shoves the part off the front.
fn gantry_sweep(part_height_mm: f64, thermal_release_temp: f64) -> String {
    let z = sweep_z(part_height_mm);
    format!(
        "\
; --- AUTO-CLEAR: GANTRY SWEEP ---
; part height: {part_height_mm:.1}mm | sweep z: {z:.2}mm
M84 S0           ; disable idle hold
M140 S0          ; bed off
M104 S0          ; nozzle off
M106 P1 S255     ; part fan max
M190 R{temp:.0}         ; wait for thermal release
G90              ; absolute mode
G28              ; home all
G1 Z100 F3000    ; safe lift
G1 X-13.5 F12000 ; park toolhead clear of the plate
G1 Y256 F12000   ; setup: bed forward
G1 Z{z:.2} F3000  ; lower beam to contact zone
M400             ; wait for move
G1 Y0 F2000      ; the sweep
G1 Z100 F3000    ; recovery lift
G28              ; re-home
; --- END AUTO-CLEAR ---
",
        temp = thermal_release_temp,
    )
}

// Short parts never meet the beam; push them with the toolhead instead.
fn toolhead_push(part_height_mm: f64, thermal_release_temp: f64) -> String {
    let z = push_z(part_height_mm);
    format!(
        "\
; --- AUTO-CLEAR: TOOLHEAD PUSH ---
; part height: {part_height_mm:.1}mm | push z: {z:.2}mm
M140 S0
M104 S0
M106 P1 S255
M190 R{temp:.0}
G90
G28
G1 Z100 F3000
G1 X128 Y256 F12000 ; setup: center back
G1 Z{z:.2} F3000
G1 Y0 F2000         ; push forward
G28
; --- END AUTO-CLEAR ---
",
        temp = thermal_release_temp,
    )
}

// CoreXY plate sweep: safe Z, then cover the plate in a U pattern while
// staying clear of the rear belt path.
fn mechanical_sweep(thermal_release_temp: f64) -> String {
    format!(
        "\
; --- AUTO-CLEAR: MECHANICAL SWEEP ---
M140 S0
M104 S0
M106 P1 S255
M190 R{temp:.0}
G90
M83
G1 Z10 F600       ; safe z height
G1 X240 Y240 F12000 ; rear far corner
M400
G1 X30 Y240 F12000  ; sweep across the back
G1 X30 Y30 F12000   ; sweep forward
G1 X240 Y30 F12000  ; sweep across the front
M400
G1 X240 Y240 F12000 ; back to safety
M400
; --- END AUTO-CLEAR ---
",
        temp = thermal_release_temp,
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_sweep_z_clamps_to_floor() {
        // 50mm part: 30 - 33 < floor.
        assert_eq!(sweep_z(50.0), SAFE_Z_FLOOR);
        // 100mm part: 60 - 33 = 27.
        assert_eq!(sweep_z(100.0), 27.0);
    }

    #[test]
    fn test_push_z_minimum() {
        assert_eq!(push_z(2.0), 5.0);
        assert_eq!(push_z(20.0), 21.0);
    }

    #[test]
    fn test_manual_generates_nothing() {
        assert!(clearing_sequence(ClearingStrategy::Manual, 80.0, 28.0).is_none());
    }

    #[test]
    fn test_fling_splits_on_gantry_threshold() {
        let tall = clearing_sequence(ClearingStrategy::InertialFling, 80.0, 28.0).unwrap();
        assert!(tall.contains("GANTRY SWEEP"));
        assert!(tall.contains("G1 X-13.5"));

        let short = clearing_sequence(ClearingStrategy::InertialFling, 20.0, 28.0).unwrap();
        assert!(short.contains("TOOLHEAD PUSH"));
        assert!(short.contains("G1 Z21.00"));
    }

    #[test]
    fn test_thermal_release_temp_in_sequence() {
        let gcode = clearing_sequence(ClearingStrategy::MechanicalSweep, 10.0, 35.0).unwrap();
        assert!(gcode.contains("M190 R35"));
    }
}
