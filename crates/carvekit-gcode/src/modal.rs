//! Modal group bookkeeping
//!
//! Every recognised G word belongs to a modal group; a line may carry at
//! most one word per group. Unrecognised G numbers have no group and are
//! passed through untouched.

use carvekit_core::{DistanceMode, MotionMode, Plane, Units, WcsSlot};
use serde::{Deserialize, Serialize};

/// Modal group of a recognised G word
///
/// Returns `None` for G numbers this dialect does not interpret.
/// Group 0 is the non-modal group (one-shot commands).
pub fn modal_group(whole: u16, decimal: u8) -> Option<u8> {
    match (whole, decimal) {
        (4, 0) | (10, 0) | (28, 0) | (30, 0) | (53, 0) | (92, 0) => Some(0),
        (0, 0) | (1, 0) | (2, 0) | (3, 0) => Some(1),
        (80, 0) | (81, 0) | (82, 0) | (83, 0) | (85, 0) | (86, 0) | (89, 0) => Some(1),
        (17, 0) | (18, 0) | (19, 0) => Some(2),
        (90, 0) | (91, 0) => Some(3),
        (90, 1) | (91, 1) => Some(4),
        (93, 0) | (94, 0) | (95, 0) => Some(5),
        (20, 0) | (21, 0) => Some(6),
        (43, 0) | (49, 0) => Some(8),
        (98, 0) | (99, 0) => Some(10),
        (54..=59, 0) => Some(12),
        _ => None,
    }
}

/// Resolved modal state after a line executes
///
/// Attached to every [`crate::ParsedLine`] so callers can see the state
/// the machine will be in once the line runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModalSnapshot {
    /// Motion modal group
    pub motion: MotionMode,
    /// Active plane
    pub plane: Plane,
    /// Input units
    pub units: Units,
    /// Absolute/relative input
    pub distance: DistanceMode,
    /// Active work coordinate system
    pub wcs: WcsSlot,
    /// Tool length compensation in effect
    pub tool_length_comp: bool,
    /// Feed rate, mm/min
    pub feed_rate: f64,
    /// Spindle speed, RPM
    pub spindle_rpm: f64,
    /// Selected tool
    pub tool: u16,
}
