//! Machine state
//!
//! `CncState` is the single mutable picture of the machine shared by the
//! G-code interpreter (which writes positions and modal groups during a
//! parse) and the session controller's status-line handler (which writes
//! reported positions and rates). Both writers synchronise through one
//! session-wide lock owned by the caller; nothing in here is global.

use crate::units::Units;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Six-axis position in millimetres / degrees
///
/// `a` is the rotary axis; `b` and `c` are carried for status reports
/// from machines that have them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Position {
    /// Create a position from the three linear axes plus rotary
    pub fn new(x: f64, y: f64, z: f64, a: f64) -> Self {
        Self {
            x,
            y,
            z,
            a,
            b: 0.0,
            c: 0.0,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X{:.4} Y{:.4} Z{:.4} A{:.4}",
            self.x, self.y, self.z, self.a
        )
    }
}

/// Motion modal group (group 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionMode {
    /// G0 straight-line rapid
    Rapid,
    /// G1 straight-line feed
    Linear,
    /// G2 clockwise arc
    ArcCw,
    /// G3 counter-clockwise arc
    ArcCcw,
    /// G4 dwell
    Dwell,
}

impl Default for MotionMode {
    fn default() -> Self {
        MotionMode::Rapid
    }
}

/// Kind of an emitted path point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionKind {
    /// Traverse at the seek rate
    Rapid,
    /// Cutting move at the feed rate
    Feed,
}

/// Active plane (G17/G18/G19)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plane {
    /// G17
    Xy,
    /// G18
    Xz,
    /// G19
    Yz,
}

impl Default for Plane {
    fn default() -> Self {
        Plane::Xy
    }
}

/// Distance modal group (G90/G91)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMode {
    /// G90
    Absolute,
    /// G91
    Relative,
}

impl Default for DistanceMode {
    fn default() -> Self {
        DistanceMode::Absolute
    }
}

/// Machine execution state as reported in status lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Idle,
    Run,
    Hold,
    Alarm,
    Home,
    Probe,
    Tool,
}

impl MachineState {
    /// Parse the leading state word of a status report
    pub fn parse(s: &str) -> Option<Self> {
        // Firmware may suffix a sub-state ("Hold:0"); match on the prefix.
        let word = s.split(':').next().unwrap_or(s);
        match word {
            "Idle" => Some(MachineState::Idle),
            "Run" => Some(MachineState::Run),
            "Hold" => Some(MachineState::Hold),
            "Alarm" => Some(MachineState::Alarm),
            "Home" => Some(MachineState::Home),
            "Probe" => Some(MachineState::Probe),
            "Tool" => Some(MachineState::Tool),
            _ => None,
        }
    }
}

impl Default for MachineState {
    fn default() -> Self {
        MachineState::Idle
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::Idle => "Idle",
            MachineState::Run => "Run",
            MachineState::Hold => "Hold",
            MachineState::Alarm => "Alarm",
            MachineState::Home => "Home",
            MachineState::Probe => "Probe",
            MachineState::Tool => "Tool",
        };
        write!(f, "{}", s)
    }
}

/// Work coordinate system slot (G54..G59)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WcsSlot {
    G54,
    G55,
    G56,
    G57,
    G58,
    G59,
}

impl WcsSlot {
    /// All slots, in G-number order
    pub const ALL: [WcsSlot; 6] = [
        WcsSlot::G54,
        WcsSlot::G55,
        WcsSlot::G56,
        WcsSlot::G57,
        WcsSlot::G58,
        WcsSlot::G59,
    ];

    /// Zero-based table index
    pub fn index(self) -> usize {
        match self {
            WcsSlot::G54 => 0,
            WcsSlot::G55 => 1,
            WcsSlot::G56 => 2,
            WcsSlot::G57 => 3,
            WcsSlot::G58 => 4,
            WcsSlot::G59 => 5,
        }
    }

    /// From a G word number (54..=59)
    pub fn from_g_number(g: u16) -> Option<Self> {
        match g {
            54 => Some(WcsSlot::G54),
            55 => Some(WcsSlot::G55),
            56 => Some(WcsSlot::G56),
            57 => Some(WcsSlot::G57),
            58 => Some(WcsSlot::G58),
            59 => Some(WcsSlot::G59),
            _ => None,
        }
    }

    /// From the P parameter of `G10 L2` (1..=6)
    pub fn from_p_number(p: u16) -> Option<Self> {
        if (1..=6).contains(&p) {
            Self::from_g_number(p + 53)
        } else {
            None
        }
    }
}

impl Default for WcsSlot {
    fn default() -> Self {
        WcsSlot::G54
    }
}

impl fmt::Display for WcsSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{}", self.index() + 54)
    }
}

/// Offset and planar rotation of one work coordinate system
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkOffset {
    /// X offset of the work origin, machine coordinates
    pub x: f64,
    /// Y offset of the work origin, machine coordinates
    pub y: f64,
    /// Z offset of the work origin, machine coordinates
    pub z: f64,
    /// Rotation about Z applied to work-coordinate motion, degrees
    pub rotation_deg: f64,
}

/// Per-tool geometry offset
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolOffset {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Axis-aligned bounding box over every emitted path coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Margins {
    pub xmin: f64,
    pub ymin: f64,
    pub zmin: f64,
    pub xmax: f64,
    pub ymax: f64,
    pub zmax: f64,
}

impl Margins {
    const SENTINEL: f64 = 1_000_000.0;

    /// Empty box that any point will overwrite
    pub fn empty() -> Self {
        Self {
            xmin: Self::SENTINEL,
            ymin: Self::SENTINEL,
            zmin: Self::SENTINEL,
            xmax: -Self::SENTINEL,
            ymax: -Self::SENTINEL,
            zmax: -Self::SENTINEL,
        }
    }

    /// True until the first point is recorded
    pub fn is_empty(&self) -> bool {
        self.xmin > self.xmax
    }

    /// Grow the box to contain a point
    pub fn expand(&mut self, x: f64, y: f64, z: f64) {
        self.xmin = self.xmin.min(x);
        self.xmax = self.xmax.max(x);
        self.ymin = self.ymin.min(y);
        self.ymax = self.ymax.max(y);
        self.zmin = self.zmin.min(z);
        self.zmax = self.zmax.max(z);
    }
}

impl Default for Margins {
    fn default() -> Self {
        Self::empty()
    }
}

/// One interpolated point of the tool path, machine coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub a: f64,
    /// Source line that produced the point
    pub line_no: u32,
    /// Rapid or cutting move
    pub kind: MotionKind,
}

/// A change to one or more modal groups
///
/// Absent fields leave the corresponding group untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModalDelta {
    pub motion: Option<MotionMode>,
    pub plane: Option<Plane>,
    pub units: Option<Units>,
    pub distance: Option<DistanceMode>,
    pub wcs: Option<WcsSlot>,
    pub feed_rate: Option<f64>,
    pub spindle_rpm: Option<f64>,
    pub tool: Option<u16>,
}

/// Fields decoded from one status report line
///
/// Every field is optional: a report only overwrites what it carries,
/// leaving the previous value of everything else intact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: Option<MachineState>,
    pub machine_pos: Option<Position>,
    pub work_pos: Option<Position>,
    pub feed_rate: Option<f64>,
    pub seek_rate: Option<f64>,
    pub spindle_rpm: Option<f64>,
    pub tool: Option<u16>,
    pub tool_length_offset: Option<f64>,
}

/// CNC machine state
///
/// Owned by the caller (typically via the session) and lent to the
/// parser for the duration of one `parse_line` call. The parser is the
/// only writer during a parse; the status handler is the only other
/// writer, and both take the owning session's lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CncState {
    /// Last commanded position, machine coordinates
    pub position: Position,
    /// Last commanded position, work coordinates of the active WCS
    pub work_position: Position,
    /// Position reported by the machine, machine coordinates
    pub reported_position: Position,
    /// Position reported by the machine, work coordinates
    pub reported_work_position: Position,

    /// Motion modal group
    pub motion: MotionMode,
    /// Active plane
    pub plane: Plane,
    /// Input units
    pub units: Units,
    /// Absolute/relative input
    pub distance: DistanceMode,

    /// Active feed rate, mm/min
    pub feed_rate: f64,
    /// Rapid traverse rate, mm/min
    pub seek_rate: f64,
    /// Commanded spindle speed, RPM
    pub spindle_rpm: f64,
    /// Feed override percentage
    pub feed_override: u16,
    /// Spindle override percentage
    pub spindle_override: u16,

    /// Active work coordinate system
    pub active_wcs: WcsSlot,
    /// Offsets for G54..G59, indexed by `WcsSlot::index`
    pub wcs_offsets: [WorkOffset; 6],

    /// Tool geometry table
    pub tool_offsets: HashMap<u16, ToolOffset>,
    /// Tool in the spindle
    pub current_tool: u16,
    /// Active tool length offset, applied to Z under compensation
    pub tool_length_offset: f64,
    /// G43 in effect
    pub tool_length_comp: bool,

    /// Machine execution state from the last status report
    pub machine_state: MachineState,

    margins: Margins,
    /// Points produced by the most recent parsed line
    pub path: Vec<PathPoint>,
}

impl Default for CncState {
    fn default() -> Self {
        Self::new()
    }
}

impl CncState {
    /// Default rapid traverse rate, mm/min
    pub const DEFAULT_SEEK_RATE: f64 = 3000.0;

    /// Fresh state: origin position, G54, absolute millimetre input
    pub fn new() -> Self {
        Self {
            position: Position::default(),
            work_position: Position::default(),
            reported_position: Position::default(),
            reported_work_position: Position::default(),
            motion: MotionMode::default(),
            plane: Plane::default(),
            units: Units::default(),
            distance: DistanceMode::default(),
            feed_rate: 0.0,
            seek_rate: Self::DEFAULT_SEEK_RATE,
            spindle_rpm: 0.0,
            feed_override: 100,
            spindle_override: 100,
            active_wcs: WcsSlot::default(),
            wcs_offsets: [WorkOffset::default(); 6],
            tool_offsets: HashMap::new(),
            current_tool: 0,
            tool_length_offset: 0.0,
            tool_length_comp: false,
            machine_state: MachineState::default(),
            margins: Margins::empty(),
            path: Vec::new(),
        }
    }

    /// Reset path tracking to a known work-coordinate position
    ///
    /// Marks a new-job boundary: the path buffer is cleared and both the
    /// commanded work and machine positions jump to the given point
    /// (without emitting motion).
    pub fn init_path(&mut self, x: f64, y: f64, z: f64, a: f64) {
        self.work_position = Position::new(x, y, z, a);
        self.position = self.resolve_work(x, y, z, a);
        self.path.clear();
    }

    /// Clear the bounding box
    pub fn reset_margins(&mut self) {
        self.margins = Margins::empty();
    }

    /// Current bounding box over all emitted coordinates
    pub fn get_margins(&self) -> Margins {
        self.margins
    }

    /// Grow the bounding box to contain a point
    pub fn expand_margins(&mut self, x: f64, y: f64, z: f64) {
        self.margins.expand(x, y, z);
    }

    /// Offset record of the active work coordinate system
    pub fn active_offset(&self) -> WorkOffset {
        self.wcs_offsets[self.active_wcs.index()]
    }

    /// Set the offset (and optionally rotation) of one WCS
    pub fn set_wcs_offset(&mut self, slot: WcsSlot, offset: WorkOffset) {
        self.wcs_offsets[slot.index()] = offset;
    }

    /// Map a work coordinate through the active WCS to machine coordinates
    ///
    /// Applies the WCS rotation about its origin in the XY plane, adds
    /// the WCS offset, and applies the tool length offset to Z when
    /// compensation is on. The rotary axis passes through unchanged.
    pub fn resolve_work(&self, wx: f64, wy: f64, wz: f64, wa: f64) -> Position {
        let off = self.active_offset();
        let (mx, my) = if off.rotation_deg != 0.0 {
            let (sin, cos) = off.rotation_deg.to_radians().sin_cos();
            (off.x + wx * cos - wy * sin, off.y + wx * sin + wy * cos)
        } else {
            (off.x + wx, off.y + wy)
        };
        let mut mz = off.z + wz;
        if self.tool_length_comp {
            mz += self.tool_length_offset;
        }
        Position::new(mx, my, mz, wa)
    }

    /// Map a machine coordinate back into work coordinates
    ///
    /// Inverse of [`CncState::resolve_work`]. Used to re-derive the
    /// tracked work position whenever the active WCS, its offset, or the
    /// tool length compensation changes while the machine stands still.
    pub fn machine_to_work(&self, p: Position) -> Position {
        let off = self.active_offset();
        let mut wz = p.z - off.z;
        if self.tool_length_comp {
            wz -= self.tool_length_offset;
        }
        let dx = p.x - off.x;
        let dy = p.y - off.y;
        let (wx, wy) = if off.rotation_deg != 0.0 {
            let (sin, cos) = (-off.rotation_deg).to_radians().sin_cos();
            (dx * cos - dy * sin, dx * sin + dy * cos)
        } else {
            (dx, dy)
        };
        Position::new(wx, wy, wz, p.a)
    }

    /// Re-derive the work position from the current machine position
    pub fn resync_work_position(&mut self) {
        self.work_position = self.machine_to_work(self.position);
    }

    /// Apply a modal-group change
    ///
    /// Selecting a different WCS re-derives the work position from the
    /// unchanged machine position.
    pub fn apply_modal_delta(&mut self, delta: &ModalDelta) {
        if let Some(motion) = delta.motion {
            self.motion = motion;
        }
        if let Some(plane) = delta.plane {
            self.plane = plane;
        }
        if let Some(units) = delta.units {
            self.units = units;
        }
        if let Some(distance) = delta.distance {
            self.distance = distance;
        }
        if let Some(wcs) = delta.wcs {
            if wcs != self.active_wcs {
                self.active_wcs = wcs;
                self.resync_work_position();
            }
        }
        if let Some(feed) = delta.feed_rate {
            self.feed_rate = feed;
        }
        if let Some(rpm) = delta.spindle_rpm {
            self.spindle_rpm = rpm;
        }
        if let Some(tool) = delta.tool {
            self.current_tool = tool;
        }
    }

    /// Fold one status report into the state
    ///
    /// Only the fields present in the snapshot are written; missing
    /// fields keep their previous values.
    pub fn apply_status(&mut self, snapshot: &StatusSnapshot) {
        if let Some(state) = snapshot.state {
            self.machine_state = state;
        }
        if let Some(mpos) = snapshot.machine_pos {
            self.reported_position = mpos;
        }
        if let Some(wpos) = snapshot.work_pos {
            self.reported_work_position = wpos;
        }
        if let Some(feed) = snapshot.feed_rate {
            self.feed_rate = feed;
        }
        if let Some(seek) = snapshot.seek_rate {
            self.seek_rate = seek;
        }
        if let Some(rpm) = snapshot.spindle_rpm {
            self.spindle_rpm = rpm;
        }
        if let Some(tool) = snapshot.tool {
            self.current_tool = tool;
        }
        if let Some(tlo) = snapshot.tool_length_offset {
            self.tool_length_offset = tlo;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margins_track_every_point() {
        let mut m = Margins::empty();
        assert!(m.is_empty());
        m.expand(1.0, -2.0, 3.0);
        m.expand(-1.0, 2.0, 0.0);
        assert_eq!((m.xmin, m.xmax), (-1.0, 1.0));
        assert_eq!((m.ymin, m.ymax), (-2.0, 2.0));
        assert_eq!((m.zmin, m.zmax), (0.0, 3.0));
    }

    #[test]
    fn resolve_applies_offset_and_rotation() {
        let mut state = CncState::new();
        state.set_wcs_offset(
            WcsSlot::G55,
            WorkOffset {
                x: 100.0,
                y: 50.0,
                z: 0.0,
                rotation_deg: 90.0,
            },
        );
        state.active_wcs = WcsSlot::G55;
        let p = state.resolve_work(10.0, 0.0, 0.0, 0.0);
        assert!((p.x - 100.0).abs() < 1e-9);
        assert!((p.y - 60.0).abs() < 1e-9);
    }

    #[test]
    fn tool_length_applies_to_z_only_under_comp() {
        let mut state = CncState::new();
        state.tool_length_offset = -2.5;
        let p = state.resolve_work(0.0, 0.0, 10.0, 0.0);
        assert_eq!(p.z, 10.0);
        state.tool_length_comp = true;
        let p = state.resolve_work(0.0, 0.0, 10.0, 0.0);
        assert_eq!(p.z, 7.5);
    }

    #[test]
    fn status_leaves_missing_fields_intact() {
        let mut state = CncState::new();
        state.apply_status(&StatusSnapshot {
            feed_rate: Some(1200.0),
            ..Default::default()
        });
        state.apply_status(&StatusSnapshot {
            spindle_rpm: Some(9000.0),
            ..Default::default()
        });
        assert_eq!(state.feed_rate, 1200.0);
        assert_eq!(state.spindle_rpm, 9000.0);
    }

    #[test]
    fn modal_delta_only_touches_present_fields() {
        let mut state = CncState::new();
        state.feed_rate = 800.0;
        state.apply_modal_delta(&ModalDelta {
            motion: Some(MotionMode::Linear),
            units: Some(crate::units::Units::Inch),
            ..Default::default()
        });
        assert_eq!(state.motion, MotionMode::Linear);
        assert_eq!(state.units, crate::units::Units::Inch);
        assert_eq!(state.feed_rate, 800.0);
        assert_eq!(state.distance, DistanceMode::Absolute);
    }

    #[test]
    fn modal_delta_wcs_switch_keeps_machine_position() {
        let mut state = CncState::new();
        state.set_wcs_offset(
            WcsSlot::G55,
            WorkOffset {
                x: 10.0,
                y: 0.0,
                z: 0.0,
                rotation_deg: 0.0,
            },
        );
        state.position = Position::new(4.0, 0.0, 0.0, 0.0);
        state.apply_modal_delta(&ModalDelta {
            wcs: Some(WcsSlot::G55),
            ..Default::default()
        });
        assert_eq!(state.position.x, 4.0);
        assert_eq!(state.work_position.x, -6.0);
    }

    #[test]
    fn wcs_slot_numbering() {
        assert_eq!(WcsSlot::from_g_number(54), Some(WcsSlot::G54));
        assert_eq!(WcsSlot::from_p_number(6), Some(WcsSlot::G59));
        assert_eq!(WcsSlot::from_p_number(0), None);
        assert_eq!(WcsSlot::from_g_number(60), None);
    }
}
