//! Modal streaming G-code interpreter
//!
//! `GcodeParser::parse_line` turns one source line into machine-state
//! deltas and, for motion words, an interpolated point sequence in
//! machine coordinates (work-coordinate offsets, WCS rotation and tool
//! length already applied). The parser borrows the caller's `CncState`
//! for the duration of the call and is its only writer while parsing.

use crate::modal::{modal_group, ModalSnapshot};
use crate::token::{tokenize, Word};
use carvekit_core::{
    CncState, DistanceMode, GCodeParseError, MotionKind, MotionMode, Plane, Position, Units,
    WcsSlot,
};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

/// Maximum chord deviation of an interpolated arc, millimetres
const ARC_CHORD_TOLERANCE: f64 = 0.025;
/// Tolerance for the declared arc end point lying on the circle, millimetres
const ARC_ENDPOINT_TOLERANCE: f64 = 0.001;
/// Segment-count clamp, expressed per full revolution
const ARC_SEGMENTS_MIN_PER_REV: f64 = 8.0;
const ARC_SEGMENTS_MAX_PER_REV: f64 = 2048.0;

/// Result of parsing one line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedLine {
    /// One-based source line number
    pub line_no: u32,
    /// Every recognised word on the line, in source order
    pub words: Vec<Word>,
    /// Modal state after the line executes
    pub state: ModalSnapshot,
    /// Interpolated machine-coordinate points; empty for non-motion lines
    pub coordinates: Vec<carvekit_core::PathPoint>,
    /// Dwell duration commanded by the line, seconds
    pub dwell_secs: Option<f64>,
}

impl ParsedLine {
    /// True if the line produced motion
    pub fn is_motion(&self) -> bool {
        !self.coordinates.is_empty()
    }
}

/// Scalar words collected from one line
#[derive(Debug, Default)]
struct LineWords {
    g: Vec<(u16, u8)>,
    m: Vec<u16>,
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    a: Option<f64>,
    i: Option<f64>,
    j: Option<f64>,
    k: Option<f64>,
    r: Option<f64>,
    p: Option<f64>,
    q: Option<f64>,
    f: Option<f64>,
    s: Option<f64>,
    t: Option<u16>,
    l: Option<u16>,
    h: Option<u16>,
}

impl LineWords {
    fn collect(words: &[Word]) -> Self {
        let mut lw = LineWords::default();
        for w in words {
            match w.letter {
                'G' => lw.g.push((w.whole(), w.decimal())),
                'M' => lw.m.push(w.whole()),
                'X' => lw.x = Some(w.value),
                'Y' => lw.y = Some(w.value),
                'Z' => lw.z = Some(w.value),
                'A' => lw.a = Some(w.value),
                'I' => lw.i = Some(w.value),
                'J' => lw.j = Some(w.value),
                'K' => lw.k = Some(w.value),
                'R' => lw.r = Some(w.value),
                'P' => lw.p = Some(w.value),
                'Q' => lw.q = Some(w.value),
                'F' => lw.f = Some(w.value),
                'S' => lw.s = Some(w.value),
                'T' => lw.t = Some(w.int().max(0) as u16),
                'L' => lw.l = Some(w.int().max(0) as u16),
                'H' => lw.h = Some(w.int().max(0) as u16),
                // N line numbers and E values are recognised but inert.
                _ => {}
            }
        }
        lw
    }

    fn has_g(&self, whole: u16) -> bool {
        self.g.iter().any(|&(w, d)| w == whole && d == 0)
    }

    fn has_endpoint_words(&self) -> bool {
        self.x.is_some() || self.y.is_some() || self.z.is_some() || self.a.is_some()
    }
}

/// Modal streaming G-code parser
///
/// Holds the modal context that is not part of the shared machine state:
/// arc-centre mode, canned-cycle retract mode and sticky cycle
/// parameters, and the tool selected but not yet loaded.
#[derive(Debug)]
pub struct GcodeParser {
    arc_absolute: bool,
    retract_to_initial: bool,
    pending_tool: Option<u16>,
    active_gcode: Option<u16>,
    cycle_r: Option<f64>,
    cycle_bottom: Option<f64>,
    cycle_q: f64,
    cycle_p: f64,
}

impl Default for GcodeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl GcodeParser {
    /// New parser with default modal context (rapid motion, R-plane retract)
    pub fn new() -> Self {
        Self {
            arc_absolute: false,
            retract_to_initial: false,
            pending_tool: None,
            active_gcode: Some(0),
            cycle_r: None,
            cycle_bottom: None,
            cycle_q: 0.0,
            cycle_p: 0.0,
        }
    }

    /// Reset modal context at a new-job boundary
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Parse one line, mutating `state` and emitting its path points
    ///
    /// Empty, comment-only and marker lines parse to an empty
    /// `ParsedLine`. The state's path buffer is replaced by this line's
    /// points.
    pub fn parse_line(
        &mut self,
        state: &mut CncState,
        line: &str,
        line_no: u32,
    ) -> Result<ParsedLine, GCodeParseError> {
        let words = tokenize(line, line_no)?;
        state.path.clear();

        if words.is_empty() {
            return Ok(self.finish(state, line_no, words, None));
        }

        check_modal_conflicts(&words, line_no)?;
        let lw = LineWords::collect(&words);

        // Settings pass: modal groups other than motion take effect
        // before any coordinate on the line is interpreted.
        let mut explicit_motion = false;
        for &(whole, decimal) in &lw.g {
            match (whole, decimal) {
                (17, 0) => state.plane = Plane::Xy,
                (18, 0) => state.plane = Plane::Xz,
                (19, 0) => state.plane = Plane::Yz,
                (20, 0) => state.units = Units::Inch,
                (21, 0) => state.units = Units::Mm,
                (90, 0) => state.distance = DistanceMode::Absolute,
                (91, 0) => state.distance = DistanceMode::Relative,
                (90, 1) => self.arc_absolute = true,
                (91, 1) => self.arc_absolute = false,
                (98, 0) => self.retract_to_initial = true,
                (99, 0) => self.retract_to_initial = false,
                (43, 0) => {
                    let tool = lw.h.unwrap_or(state.current_tool);
                    state.tool_length_comp = true;
                    state.tool_length_offset =
                        state.tool_offsets.get(&tool).map(|o| o.z).unwrap_or(0.0);
                    state.resync_work_position();
                }
                (49, 0) => {
                    state.tool_length_comp = false;
                    state.resync_work_position();
                }
                (80, 0) => {
                    self.active_gcode = None;
                    self.cycle_r = None;
                    self.cycle_bottom = None;
                }
                (54..=59, 0) => {
                    if let Some(slot) = WcsSlot::from_g_number(whole) {
                        state.active_wcs = slot;
                        state.resync_work_position();
                    }
                }
                (0, 0) | (1, 0) | (2, 0) | (3, 0) => {
                    self.active_gcode = Some(whole);
                    explicit_motion = true;
                    state.motion = match whole {
                        0 => MotionMode::Rapid,
                        1 => MotionMode::Linear,
                        2 => MotionMode::ArcCw,
                        _ => MotionMode::ArcCcw,
                    };
                }
                (81..=83, 0) | (85, 0) | (86, 0) | (89, 0) => {
                    self.active_gcode = Some(whole);
                    explicit_motion = true;
                    state.motion = MotionMode::Linear;
                }
                // G4, G10, G28/G30, G53, G92 and feed-rate modes are
                // handled below or deliberately inert.
                _ => {}
            }
        }

        let scale = state.units.to_mm();

        if let Some(f) = lw.f {
            state.feed_rate = f * scale;
        }
        if let Some(s) = lw.s {
            state.spindle_rpm = s;
        }
        if let Some(t) = lw.t {
            self.pending_tool = Some(t);
        }
        if lw.m.contains(&6) {
            if let Some(t) = self.pending_tool.take() {
                state.current_tool = t;
            }
            if let Some(off) = state.tool_offsets.get(&state.current_tool) {
                state.tool_length_offset = off.z;
                if state.tool_length_comp {
                    state.resync_work_position();
                }
            }
        }

        // One-shot commands consume the line's coordinates.
        if lw.has_g(10) {
            self.apply_g10(state, &lw, scale, line_no)?;
            return Ok(self.finish(state, line_no, words, None));
        }
        if lw.has_g(4) {
            let secs = lw.p.ok_or(GCodeParseError::MissingWord { line_no, word: 'P' })?;
            state.motion = MotionMode::Dwell;
            return Ok(self.finish(state, line_no, words, Some(secs)));
        }
        if lw.has_g(28) || lw.has_g(30) || lw.has_g(92) {
            state.work_position = Position::default();
            state.position = Position::default();
            return Ok(self.finish(state, line_no, words, None));
        }

        let dwell = match self.active_gcode {
            Some(code @ (0 | 1)) => {
                self.linear_move(state, line_no, code, &lw, scale)?;
                None
            }
            Some(code @ (2 | 3)) => {
                self.arc_move(state, line_no, code, &lw, scale)?;
                None
            }
            Some(code @ (81..=83 | 85 | 86 | 89)) => {
                if lw.has_endpoint_words() || explicit_motion {
                    self.canned_cycle(state, line_no, code, &lw, scale)?
                } else {
                    None
                }
            }
            _ => None,
        };

        Ok(self.finish(state, line_no, words, dwell))
    }

    fn finish(
        &self,
        state: &mut CncState,
        line_no: u32,
        words: Vec<Word>,
        dwell_secs: Option<f64>,
    ) -> ParsedLine {
        ParsedLine {
            line_no,
            words,
            state: ModalSnapshot {
                motion: state.motion,
                plane: state.plane,
                units: state.units,
                distance: state.distance,
                wcs: state.active_wcs,
                tool_length_comp: state.tool_length_comp,
                feed_rate: state.feed_rate,
                spindle_rpm: state.spindle_rpm,
                tool: state.current_tool,
            },
            coordinates: state.path.clone(),
            dwell_secs,
        }
    }

    /// Resolve one axis word against the distance mode
    fn axis_target(word: Option<f64>, current: f64, scale: f64, relative: bool) -> f64 {
        match word {
            Some(v) => {
                let v = v * scale;
                if relative {
                    current + v
                } else {
                    v
                }
            }
            None => current,
        }
    }

    /// Emit one work-coordinate point through the WCS pipeline
    fn emit(
        state: &mut CncState,
        line_no: u32,
        kind: MotionKind,
        wx: f64,
        wy: f64,
        wz: f64,
        wa: f64,
    ) {
        let p = state.resolve_work(wx, wy, wz, wa);
        state.expand_margins(p.x, p.y, p.z);
        state.path.push(carvekit_core::PathPoint {
            x: p.x,
            y: p.y,
            z: p.z,
            a: p.a,
            line_no,
            kind,
        });
    }

    /// Record the motion start so the bounding box covers both segment ends
    fn mark_motion_start(state: &mut CncState) {
        let p = state.position;
        state.expand_margins(p.x, p.y, p.z);
    }

    fn commit_position(state: &mut CncState, wx: f64, wy: f64, wz: f64, wa: f64) {
        state.work_position = Position::new(wx, wy, wz, wa);
        state.position = match state.path.last() {
            Some(last) => Position::new(last.x, last.y, last.z, last.a),
            None => state.resolve_work(wx, wy, wz, wa),
        };
    }

    fn linear_move(
        &mut self,
        state: &mut CncState,
        line_no: u32,
        code: u16,
        lw: &LineWords,
        scale: f64,
    ) -> Result<(), GCodeParseError> {
        if !lw.has_endpoint_words() {
            return Ok(());
        }
        let relative = state.distance == DistanceMode::Relative;
        let cur = state.work_position;
        let tx = Self::axis_target(lw.x, cur.x, scale, relative);
        let ty = Self::axis_target(lw.y, cur.y, scale, relative);
        let tz = Self::axis_target(lw.z, cur.z, scale, relative);
        // Degrees are unit-independent; the rotary axis never scales.
        let ta = Self::axis_target(lw.a, cur.a, 1.0, relative);

        if tx == cur.x && ty == cur.y && tz == cur.z && ta == cur.a {
            return Ok(());
        }

        let kind = if code == 0 {
            MotionKind::Rapid
        } else {
            if state.feed_rate <= 0.0 {
                return Err(GCodeParseError::MissingFeed { line_no });
            }
            MotionKind::Feed
        };

        Self::mark_motion_start(state);
        Self::emit(state, line_no, kind, tx, ty, tz, ta);
        Self::commit_position(state, tx, ty, tz, ta);
        Ok(())
    }

    fn arc_move(
        &mut self,
        state: &mut CncState,
        line_no: u32,
        code: u16,
        lw: &LineWords,
        scale: f64,
    ) -> Result<(), GCodeParseError> {
        let has_centre = lw.i.is_some() || lw.j.is_some() || lw.k.is_some() || lw.r.is_some();
        if !lw.has_endpoint_words() && !has_centre {
            // A bare G2/G3 sets the modal group and nothing else.
            return Ok(());
        }
        if state.feed_rate <= 0.0 {
            return Err(GCodeParseError::MissingFeed { line_no });
        }

        let relative = state.distance == DistanceMode::Relative;
        let cur = state.work_position;
        let tx = Self::axis_target(lw.x, cur.x, scale, relative);
        let ty = Self::axis_target(lw.y, cur.y, scale, relative);
        let tz = Self::axis_target(lw.z, cur.z, scale, relative);
        let ta = Self::axis_target(lw.a, cur.a, 1.0, relative);

        // Arc-centre offsets: relative to the start point unless G90.1
        // declared them absolute.
        let off = |word: Option<f64>, axis: f64| -> Option<f64> {
            word.map(|v| {
                let v = v * scale;
                if self.arc_absolute {
                    v - axis
                } else {
                    v
                }
            })
        };
        let iv = off(lw.i, cur.x);
        let jv = off(lw.j, cur.y);
        let kv = off(lw.k, cur.z);

        // Map onto the active plane: (u, v) is the arc plane, w the
        // linear (helix) axis. The XZ plane mirrors arc direction.
        let plane = state.plane;
        let (u0, v0, w0) = match plane {
            Plane::Xy => (cur.x, cur.y, cur.z),
            Plane::Xz => (cur.x, cur.z, cur.y),
            Plane::Yz => (cur.y, cur.z, cur.x),
        };
        let (u1, v1, w1) = match plane {
            Plane::Xy => (tx, ty, tz),
            Plane::Xz => (tx, tz, ty),
            Plane::Yz => (ty, tz, tx),
        };
        let cw = if plane == Plane::Xz { code == 3 } else { code == 2 };

        let (uc, vc, radius) = if let Some(r) = lw.r.map(|r| r * scale) {
            let ab_u = u1 - u0;
            let ab_v = v1 - v0;
            let d = (ab_u * ab_u + ab_v * ab_v).sqrt();
            if d < 1e-9 {
                return Err(GCodeParseError::InvalidValue {
                    line_no,
                    word: 'R',
                    reason: "arc start and end coincide".to_string(),
                });
            }
            if d > 2.0 * r.abs() + 1e-6 {
                return Err(GCodeParseError::InvalidValue {
                    line_no,
                    word: 'R',
                    reason: format!("radius {} too small for chord {}", r.abs(), d),
                });
            }
            let h = (r * r - d * d / 4.0).max(0.0).sqrt();
            // Left perpendicular of the chord; the sign of R picks the
            // minor or major arc, the direction picks the side.
            let lp_u = -ab_v / d;
            let lp_v = ab_u / d;
            let side = if cw == (r > 0.0) { -1.0 } else { 1.0 };
            (
                (u0 + u1) / 2.0 + side * h * lp_u,
                (v0 + v1) / 2.0 + side * h * lp_v,
                r.abs(),
            )
        } else {
            let (du, dv) = match plane {
                Plane::Xy => (iv, jv),
                Plane::Xz => (iv, kv),
                Plane::Yz => (jv, kv),
            };
            if du.is_none() && dv.is_none() {
                return Err(GCodeParseError::MissingWord { line_no, word: 'I' });
            }
            let du = du.unwrap_or(0.0);
            let dv = dv.unwrap_or(0.0);
            let radius = (du * du + dv * dv).sqrt();
            if radius < 1e-9 {
                return Err(GCodeParseError::InvalidValue {
                    line_no,
                    word: 'I',
                    reason: "zero arc radius".to_string(),
                });
            }
            (u0 + du, v0 + dv, radius)
        };

        // The declared end point must lie on the circle.
        let end_r = ((u1 - uc).powi(2) + (v1 - vc).powi(2)).sqrt();
        let deviation = (end_r - radius).abs();
        if deviation > ARC_ENDPOINT_TOLERANCE {
            return Err(GCodeParseError::ArcEndpoint {
                line_no,
                deviation_mm: deviation,
            });
        }

        let phi0 = (v0 - vc).atan2(u0 - uc);
        let mut phi1 = (v1 - vc).atan2(u1 - uc);
        if cw {
            if phi1 >= phi0 - 1e-10 {
                phi1 -= TAU;
            }
        } else if phi1 <= phi0 + 1e-10 {
            phi1 += TAU;
        }
        let sweep = phi1 - phi0;

        // Segment length bound by chord error, clamped per revolution.
        let dphi = if ARC_CHORD_TOLERANCE < radius {
            2.0 * (1.0 - ARC_CHORD_TOLERANCE / radius).acos()
        } else {
            PI / 4.0
        }
        .clamp(TAU / ARC_SEGMENTS_MAX_PER_REV, TAU / ARC_SEGMENTS_MIN_PER_REV);
        let segments = ((sweep.abs() / dphi).ceil() as usize).max(1);

        Self::mark_motion_start(state);
        for step in 1..=segments {
            let t = step as f64 / segments as f64;
            let (wx, wy, wz, wa) = if step == segments {
                (tx, ty, tz, ta)
            } else {
                let phi = phi0 + sweep * t;
                let u = uc + radius * phi.cos();
                let v = vc + radius * phi.sin();
                let w = w0 + (w1 - w0) * t;
                let a = cur.a + (ta - cur.a) * t;
                match plane {
                    Plane::Xy => (u, v, w, a),
                    Plane::Xz => (u, w, v, a),
                    Plane::Yz => (w, u, v, a),
                }
            };
            Self::emit(state, line_no, MotionKind::Feed, wx, wy, wz, wa);
        }
        Self::commit_position(state, tx, ty, tz, ta);
        Ok(())
    }

    fn canned_cycle(
        &mut self,
        state: &mut CncState,
        line_no: u32,
        code: u16,
        lw: &LineWords,
        scale: f64,
    ) -> Result<Option<f64>, GCodeParseError> {
        if state.feed_rate <= 0.0 {
            return Err(GCodeParseError::MissingFeed { line_no });
        }

        let relative = state.distance == DistanceMode::Relative;
        let cur = state.work_position;
        let initial_z = cur.z;

        let r_plane = match lw.r {
            Some(r) => {
                let rp = if relative {
                    cur.z + r * scale
                } else {
                    r * scale
                };
                self.cycle_r = Some(rp);
                rp
            }
            None => self
                .cycle_r
                .ok_or(GCodeParseError::MissingWord { line_no, word: 'R' })?,
        };
        let bottom = match lw.z {
            Some(z) => {
                let b = if relative {
                    r_plane + z * scale
                } else {
                    z * scale
                };
                self.cycle_bottom = Some(b);
                b
            }
            None => self
                .cycle_bottom
                .ok_or(GCodeParseError::MissingWord { line_no, word: 'Z' })?,
        };
        if let Some(q) = lw.q {
            self.cycle_q = q.abs() * scale;
        }
        if let Some(p) = lw.p {
            self.cycle_p = p.max(0.0);
        }
        if code == 83 && self.cycle_q <= 0.0 {
            return Err(GCodeParseError::MissingWord { line_no, word: 'Q' });
        }

        let repeats = if relative {
            lw.l.unwrap_or(1).max(1)
        } else {
            1
        };
        let retract_z = if self.retract_to_initial {
            initial_z.max(r_plane)
        } else {
            r_plane
        };
        let dx = lw.x.map(|v| v * scale).unwrap_or(0.0);
        let dy = lw.y.map(|v| v * scale).unwrap_or(0.0);

        Self::mark_motion_start(state);
        let mut hx = cur.x;
        let mut hy = cur.y;
        let mut z_now = cur.z;
        for _ in 0..repeats {
            if relative {
                hx += dx;
                hy += dy;
            } else {
                hx = Self::axis_target(lw.x, cur.x, scale, false);
                hy = Self::axis_target(lw.y, cur.y, scale, false);
            }

            // Position over the hole, then drop to the retract plane.
            Self::emit(state, line_no, MotionKind::Rapid, hx, hy, z_now, cur.a);
            if (z_now - r_plane).abs() > 1e-12 {
                Self::emit(state, line_no, MotionKind::Rapid, hx, hy, r_plane, cur.a);
            }

            if code == 83 {
                let mut depth = r_plane;
                loop {
                    depth = (depth - self.cycle_q).max(bottom);
                    Self::emit(state, line_no, MotionKind::Feed, hx, hy, depth, cur.a);
                    if depth <= bottom + 1e-12 {
                        break;
                    }
                    Self::emit(state, line_no, MotionKind::Rapid, hx, hy, r_plane, cur.a);
                }
            } else {
                Self::emit(state, line_no, MotionKind::Feed, hx, hy, bottom, cur.a);
            }

            // Boring cycles feed back out; drilling retracts at the
            // seek rate.
            let out = match code {
                85 | 89 => MotionKind::Feed,
                _ => MotionKind::Rapid,
            };
            Self::emit(state, line_no, out, hx, hy, retract_z, cur.a);
            z_now = retract_z;
        }
        Self::commit_position(state, hx, hy, retract_z, cur.a);

        let dwell = match code {
            82 | 86 | 89 if self.cycle_p > 0.0 => Some(self.cycle_p),
            _ => None,
        };
        Ok(dwell)
    }

    fn apply_g10(
        &mut self,
        state: &mut CncState,
        lw: &LineWords,
        scale: f64,
        line_no: u32,
    ) -> Result<(), GCodeParseError> {
        let l = lw
            .l
            .ok_or(GCodeParseError::MissingWord { line_no, word: 'L' })?;
        if l != 2 {
            return Err(GCodeParseError::InvalidValue {
                line_no,
                word: 'L',
                reason: format!("unsupported G10 mode L{}", l),
            });
        }
        let p = lw
            .p
            .ok_or(GCodeParseError::MissingWord { line_no, word: 'P' })?
            .round() as u16;
        let slot = WcsSlot::from_p_number(p).ok_or(GCodeParseError::InvalidValue {
            line_no,
            word: 'P',
            reason: format!("no work coordinate system P{}", p),
        })?;

        let mut offset = state.wcs_offsets[slot.index()];
        if let Some(x) = lw.x {
            offset.x = x * scale;
        }
        if let Some(y) = lw.y {
            offset.y = y * scale;
        }
        if let Some(z) = lw.z {
            offset.z = z * scale;
        }
        if let Some(r) = lw.r {
            offset.rotation_deg = r;
        }
        state.set_wcs_offset(slot, offset);
        if slot == state.active_wcs {
            state.resync_work_position();
        }
        tracing::debug!(slot = %slot, ?offset, "work offset updated");
        Ok(())
    }
}

/// Reject lines carrying two words of the same modal group
fn check_modal_conflicts(words: &[Word], line_no: u32) -> Result<(), GCodeParseError> {
    let mut seen: [Option<(u16, u8)>; 16] = [None; 16];
    for w in words {
        if w.letter != 'G' {
            continue;
        }
        let (whole, decimal) = (w.whole(), w.decimal());
        if let Some(group) = modal_group(whole, decimal) {
            let slot = &mut seen[group as usize];
            if let Some((pw, pd)) = *slot {
                return Err(GCodeParseError::ModalConflict {
                    line_no,
                    reason: format!(
                        "G{} and G{} are both in modal group {}",
                        format_g(pw, pd),
                        format_g(whole, decimal),
                        group
                    ),
                });
            }
            *slot = Some((whole, decimal));
        }
    }
    Ok(())
}

fn format_g(whole: u16, decimal: u8) -> String {
    if decimal == 0 {
        whole.to_string()
    } else {
        format!("{}.{}", whole, decimal)
    }
}

/// One-call helper: parse a whole program, line by line
///
/// Stops at the first error. Returns the parsed lines in order.
pub fn parse_program(
    parser: &mut GcodeParser,
    state: &mut CncState,
    text: &str,
) -> Result<Vec<ParsedLine>, GCodeParseError> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        out.push(parser.parse_line(state, line, idx as u32 + 1)?);
    }
    Ok(out)
}
