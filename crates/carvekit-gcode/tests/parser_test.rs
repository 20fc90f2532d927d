//! Interpreter tests: linear motion, arcs, work coordinate systems,
//! canned cycles and the bounding box.

use carvekit_core::{CncState, GCodeParseError, MotionKind, Units};
use carvekit_gcode::GcodeParser;

fn parse_all(parser: &mut GcodeParser, state: &mut CncState, lines: &[&str]) {
    for (i, line) in lines.iter().enumerate() {
        parser
            .parse_line(state, line, i as u32 + 1)
            .unwrap_or_else(|e| panic!("line {:?} failed: {}", line, e));
    }
}

#[test]
fn absolute_linear_move() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    parse_all(&mut parser, &mut state, &["G21", "G90"]);

    let parsed = parser
        .parse_line(&mut state, "G1 X10 Y0 Z0 F1000", 3)
        .unwrap();

    assert_eq!(parsed.coordinates.len(), 1);
    let p = parsed.coordinates[0];
    assert!((p.x - 10.0).abs() < 1e-9);
    assert_eq!(p.y, 0.0);
    assert_eq!(p.z, 0.0);
    assert_eq!(p.kind, MotionKind::Feed);
    assert_eq!(state.feed_rate, 1000.0);

    let m = state.get_margins();
    assert_eq!((m.xmin, m.xmax), (0.0, 10.0));
    assert_eq!((m.ymin, m.ymax), (0.0, 0.0));
    assert_eq!((m.zmin, m.zmax), (0.0, 0.0));
}

#[test]
fn feed_move_without_feed_rate_fails() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    let err = parser.parse_line(&mut state, "G1 X10", 1).unwrap_err();
    assert!(matches!(err, GCodeParseError::MissingFeed { line_no: 1 }));
}

#[test]
fn rapid_needs_no_feed_rate() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    let parsed = parser.parse_line(&mut state, "G0 X10", 1).unwrap();
    assert_eq!(parsed.coordinates.len(), 1);
    assert_eq!(parsed.coordinates[0].kind, MotionKind::Rapid);
}

#[test]
fn arc_with_centre_offsets() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    state.init_path(10.0, 0.0, 0.0, 0.0);

    let parsed = parser
        .parse_line(&mut state, "G2 X0 Y10 I-10 J0 F500", 1)
        .unwrap();

    assert!(parsed.coordinates.len() >= 8);
    for p in &parsed.coordinates {
        let r = (p.x * p.x + p.y * p.y).sqrt();
        assert!(
            (r - 10.0).abs() <= 0.025,
            "point ({}, {}) is {}mm off the circle",
            p.x,
            p.y,
            (r - 10.0).abs()
        );
    }
    let last = parsed.coordinates.last().unwrap();
    assert!((last.x - 0.0).abs() < 1e-3);
    assert!((last.y - 10.0).abs() < 1e-3);
    assert_eq!(last.z, 0.0);

    // Final position is the last emitted coordinate.
    assert_eq!(state.position.x, last.x);
    assert_eq!(state.position.y, last.y);
}

#[test]
fn arc_by_radius_minor_and_major() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    state.init_path(10.0, 0.0, 0.0, 0.0);
    let minor = parser
        .parse_line(&mut state, "G3 X0 Y10 R10 F500", 1)
        .unwrap();

    let mut state2 = CncState::new();
    state2.init_path(10.0, 0.0, 0.0, 0.0);
    let major = parser
        .parse_line(&mut state2, "G3 X0 Y10 R-10 F500", 1)
        .unwrap();

    // The negative radius selects the long way round.
    assert!(major.coordinates.len() > minor.coordinates.len());
    for p in minor.coordinates.iter().chain(major.coordinates.iter()) {
        assert!(p.z == 0.0);
    }
    let end = minor.coordinates.last().unwrap();
    assert!((end.x - 0.0).abs() < 1e-3 && (end.y - 10.0).abs() < 1e-3);
}

#[test]
fn arc_endpoint_off_circle_is_rejected() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    state.init_path(10.0, 0.0, 0.0, 0.0);
    let err = parser
        .parse_line(&mut state, "G2 X0 Y12 I-10 J0 F500", 1)
        .unwrap_err();
    assert!(matches!(err, GCodeParseError::ArcEndpoint { .. }));
}

#[test]
fn helical_arc_interpolates_z() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    state.init_path(10.0, 0.0, 0.0, 0.0);
    let parsed = parser
        .parse_line(&mut state, "G3 X-10 Y0 Z-2 I-10 J0 F500", 1)
        .unwrap();
    let last = parsed.coordinates.last().unwrap();
    assert!((last.z + 2.0).abs() < 1e-9);
    // Z must descend monotonically along the helix.
    let mut prev = 0.0;
    for p in &parsed.coordinates {
        assert!(p.z <= prev + 1e-9);
        prev = p.z;
    }
}

#[test]
fn wcs_offset_resolution() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    parse_all(
        &mut parser,
        &mut state,
        &["G10 L2 P1 X100 Y50", "G54", "G0 X0 Y0"],
    );
    assert!((state.position.x - 100.0).abs() < 1e-9);
    assert!((state.position.y - 50.0).abs() < 1e-9);
    assert_eq!(state.position.z, 0.0);
}

#[test]
fn wcs_rotation_about_origin() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    parse_all(
        &mut parser,
        &mut state,
        &["G10 L2 P2 X10 Y0 R90", "G55", "G0 X5 Y0"],
    );
    assert!((state.position.x - 10.0).abs() < 1e-9);
    assert!((state.position.y - 5.0).abs() < 1e-9);
}

#[test]
fn returning_to_origin_of_offset_wcs_lands_on_the_offset() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    parse_all(
        &mut parser,
        &mut state,
        &["G10 L2 P3 X-20 Y30 Z5", "G56", "G0 X0 Y0 Z0", "G54"],
    );
    // Deactivating the WCS does not move the machine.
    assert!((state.position.x + 20.0).abs() < 1e-9);
    assert!((state.position.y - 30.0).abs() < 1e-9);
    assert!((state.position.z - 5.0).abs() < 1e-9);
}

#[test]
fn relative_moves_accumulate_across_units() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    parse_all(
        &mut parser,
        &mut state,
        &["G21", "G91 X5", "G20", "G91 X1", "G21", "G91 X4.6"],
    );
    // 5mm + 1in + 4.6mm = 35mm.
    assert!((state.position.x - 35.0).abs() < 1e-9);
    assert_eq!(state.units, Units::Mm);
}

#[test]
fn drilling_cycle_expansion() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    state.init_path(5.0, 5.0, 5.0, 0.0);

    let parsed = parser
        .parse_line(&mut state, "G81 X20 Y20 Z-3 R2 F100", 1)
        .unwrap();

    let pts: Vec<(f64, f64, f64, MotionKind)> = parsed
        .coordinates
        .iter()
        .map(|p| (p.x, p.y, p.z, p.kind))
        .collect();
    assert_eq!(
        pts,
        vec![
            (20.0, 20.0, 5.0, MotionKind::Rapid),
            (20.0, 20.0, 2.0, MotionKind::Rapid),
            (20.0, 20.0, -3.0, MotionKind::Feed),
            (20.0, 20.0, 2.0, MotionKind::Rapid),
        ]
    );
    assert_eq!(state.position.z, 2.0);
}

#[test]
fn peck_drilling_returns_to_r_plane_between_pecks() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    state.init_path(0.0, 0.0, 5.0, 0.0);

    let parsed = parser
        .parse_line(&mut state, "G83 X0 Y0 Z-3 R2 Q2 F100", 1)
        .unwrap();

    let depths: Vec<f64> = parsed
        .coordinates
        .iter()
        .filter(|p| p.kind == MotionKind::Feed)
        .map(|p| p.z)
        .collect();
    assert_eq!(depths, vec![0.0, -2.0, -3.0]);
    // Every peck retracts to the R plane before the next plunge.
    let rapids_at_r = parsed
        .coordinates
        .iter()
        .filter(|p| p.kind == MotionKind::Rapid && p.z == 2.0)
        .count();
    assert!(rapids_at_r >= 3);
}

#[test]
fn g98_retracts_to_initial_z() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    state.init_path(0.0, 0.0, 5.0, 0.0);
    let parsed = parser
        .parse_line(&mut state, "G98 G81 X10 Y0 Z-3 R2 F100", 1)
        .unwrap();
    let last = parsed.coordinates.last().unwrap();
    assert_eq!(last.z, 5.0);
    assert_eq!(state.position.z, 5.0);
}

#[test]
fn boring_cycle_feeds_back_out() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    state.init_path(0.0, 0.0, 5.0, 0.0);
    let parsed = parser
        .parse_line(&mut state, "G85 X10 Y0 Z-3 R2 F100", 1)
        .unwrap();
    let last = parsed.coordinates.last().unwrap();
    assert_eq!(last.kind, MotionKind::Feed);
    assert_eq!(last.z, 2.0);
}

#[test]
fn dwell_emits_no_coordinates() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    let parsed = parser.parse_line(&mut state, "G4 P2.5", 1).unwrap();
    assert!(parsed.coordinates.is_empty());
    assert_eq!(parsed.dwell_secs, Some(2.5));
}

#[test]
fn dwell_with_pause_in_cycle() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    state.init_path(0.0, 0.0, 5.0, 0.0);
    let parsed = parser
        .parse_line(&mut state, "G82 X1 Y1 Z-1 R2 P0.5 F100", 1)
        .unwrap();
    assert_eq!(parsed.dwell_secs, Some(0.5));
    assert!(!parsed.coordinates.is_empty());
}

#[test]
fn modal_motion_reuse() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    parse_all(&mut parser, &mut state, &["G1 X10 F500", "X20", "Y5"]);
    assert_eq!(state.position.x, 20.0);
    assert_eq!(state.position.y, 5.0);
}

#[test]
fn modal_conflict_is_rejected() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    let err = parser.parse_line(&mut state, "G1 G0 X10", 7).unwrap_err();
    match err {
        GCodeParseError::ModalConflict { line_no, .. } => assert_eq!(line_no, 7),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn unknown_words_are_preserved_but_inert() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    let before = state.clone();
    let parsed = parser.parse_line(&mut state, "G64 M7", 1).unwrap();
    assert_eq!(parsed.words.len(), 2);
    assert_eq!(state.position, before.position);
    assert_eq!(state.motion, before.motion);
}

#[test]
fn tool_length_compensation_applies_to_z() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    state
        .tool_offsets
        .insert(3, carvekit_core::ToolOffset { x: 0.0, y: 0.0, z: -1.5 });
    parse_all(&mut parser, &mut state, &["T3 M6", "G43 H3", "G0 Z10"]);
    assert_eq!(state.current_tool, 3);
    assert!((state.position.z - 8.5).abs() < 1e-9);

    parse_all(&mut parser, &mut state, &["G49", "G0 Z10"]);
    assert!((state.position.z - 10.0).abs() < 1e-9);
}

#[test]
fn bounding_box_covers_every_emitted_point() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    let mut all_points = Vec::new();
    let program = ["G0 X10 Y10", "G1 Z-2 F200", "G2 X-10 Y10 I-10 J-10", "G0 Z5"];
    for (i, line) in program.iter().enumerate() {
        let parsed = parser.parse_line(&mut state, line, i as u32 + 1).unwrap();
        all_points.extend(parsed.coordinates);
    }
    let m = state.get_margins();
    for p in &all_points {
        assert!(p.x >= m.xmin - 1e-9 && p.x <= m.xmax + 1e-9);
        assert!(p.y >= m.ymin - 1e-9 && p.y <= m.ymax + 1e-9);
        assert!(p.z >= m.zmin - 1e-9 && p.z <= m.zmax + 1e-9);
    }

    state.reset_margins();
    assert!(state.get_margins().is_empty());
}

#[test]
fn comment_and_marker_lines_parse_to_nothing() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    for line in ["", "; note", "(setup block)", "% start", "#100=1"] {
        let parsed = parser.parse_line(&mut state, line, 1).unwrap();
        assert!(parsed.words.is_empty());
        assert!(parsed.coordinates.is_empty());
    }
}

#[test]
fn g80_cancels_cycle_modality() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    state.init_path(0.0, 0.0, 5.0, 0.0);
    parse_all(&mut parser, &mut state, &["G81 X10 Y0 Z-3 R2 F100", "G80"]);
    // A bare coordinate word after G80 no longer re-drills.
    let parsed = parser.parse_line(&mut state, "X20", 3).unwrap();
    assert!(parsed.coordinates.is_empty());
}

#[test]
fn final_position_matches_last_emitted_coordinate() {
    let mut state = CncState::new();
    let mut parser = GcodeParser::new();
    let program = [
        "G21 G90",
        "G0 X5 Y5",
        "G1 Z-1 F300",
        "G3 X-5 Y5 I-5 J0",
        "G81 X0 Y0 Z-2 R1 F100",
    ];
    for (i, line) in program.iter().enumerate() {
        let parsed = parser.parse_line(&mut state, line, i as u32 + 1).unwrap();
        if let Some(last) = parsed.coordinates.last() {
            assert_eq!(state.position.x, last.x);
            assert_eq!(state.position.y, last.y);
            assert_eq!(state.position.z, last.z);
        }
    }
}
