//! Machine reply parsing
//!
//! Status reports arrive as `<State|MPos:..|WPos:..|F:..|S:..|T:..|H:..>`
//! with fields in any order; informational lines arrive as `[...]`
//! records. Missing fields leave previous state untouched, so every
//! parsed field is optional.

use carvekit_core::{MachineState, Position, StatusSnapshot, WcsSlot};

/// Parse the axis list of a position field (`x,y,z[,a[,b[,c]]]`)
fn parse_axes(s: &str) -> Option<Position> {
    let values: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if values.len() < 3 {
        return None;
    }
    Some(Position {
        x: values[0],
        y: values[1],
        z: values[2],
        a: values.get(3).copied().unwrap_or(0.0),
        b: values.get(4).copied().unwrap_or(0.0),
        c: values.get(5).copied().unwrap_or(0.0),
    })
}

/// Parse one `<...>` status report into a snapshot
///
/// Unknown fields are skipped; a line that is not a status report at
/// all returns `None`.
pub fn parse_status_line(line: &str) -> Option<StatusSnapshot> {
    let line = line.trim();
    if !line.starts_with('<') || !line.ends_with('>') {
        return None;
    }
    let inner = &line[1..line.len() - 1];

    let mut snapshot = StatusSnapshot::default();
    for (idx, field) in inner.split('|').enumerate() {
        if idx == 0 && !field.contains(':') {
            snapshot.state = MachineState::parse(field);
            continue;
        }
        let Some((key, value)) = field.split_once(':') else {
            continue;
        };
        match key {
            "MPos" => snapshot.machine_pos = parse_axes(value),
            "WPos" => snapshot.work_pos = parse_axes(value),
            "F" => {
                // Feed field may carry "feed" or "feed,seek".
                let mut parts = value.split(',');
                snapshot.feed_rate = parts.next().and_then(|p| p.trim().parse().ok());
                snapshot.seek_rate = parts.next().and_then(|p| p.trim().parse().ok());
            }
            "S" => snapshot.spindle_rpm = value.trim().parse().ok(),
            "T" => snapshot.tool = value.trim().parse().ok(),
            "H" => snapshot.tool_length_offset = value.trim().parse().ok(),
            _ => {}
        }
    }
    Some(snapshot)
}

/// Informational `[...]` reply
#[derive(Debug, Clone, PartialEq)]
pub enum InfoLine {
    /// `[G5x:x,y,z]` work coordinate offset report
    WcsOffset {
        slot: WcsSlot,
        x: f64,
        y: f64,
        z: f64,
    },
    /// `[TLO:v]` tool length offset report
    ToolLengthOffset(f64),
    /// `[PRB:x,y,z:ok]` probe result
    Probe { position: Position, success: bool },
    /// Anything else inside brackets, passed through verbatim
    Other(String),
}

/// Parse one `[...]` informational line
pub fn parse_info_line(line: &str) -> Option<InfoLine> {
    let line = line.trim();
    if !line.starts_with('[') || !line.ends_with(']') {
        return None;
    }
    let inner = &line[1..line.len() - 1];
    let Some((key, rest)) = inner.split_once(':') else {
        return Some(InfoLine::Other(inner.to_string()));
    };

    if let Some(g_num) = key.strip_prefix('G').and_then(|n| n.parse::<u16>().ok()) {
        if let Some(slot) = WcsSlot::from_g_number(g_num) {
            if let Some(p) = parse_axes(rest) {
                return Some(InfoLine::WcsOffset {
                    slot,
                    x: p.x,
                    y: p.y,
                    z: p.z,
                });
            }
        }
    }

    match key {
        "TLO" => rest
            .trim()
            .parse()
            .ok()
            .map(InfoLine::ToolLengthOffset)
            .or(Some(InfoLine::Other(inner.to_string()))),
        "PRB" => {
            let (coords, flag) = rest.rsplit_once(':').unwrap_or((rest, "1"));
            parse_axes(coords)
                .map(|position| InfoLine::Probe {
                    position,
                    success: flag.trim() == "1",
                })
                .or(Some(InfoLine::Other(inner.to_string())))
        }
        _ => Some(InfoLine::Other(inner.to_string())),
    }
}

/// Error code of an `error:<n>` reply
pub fn parse_error_line(line: &str) -> Option<u32> {
    line.trim()
        .strip_prefix("error:")
        .and_then(|n| n.trim().parse().ok())
}

/// Alarm code of an `ALARM:<n>` reply
pub fn parse_alarm_line(line: &str) -> Option<u32> {
    line.trim()
        .strip_prefix("ALARM:")
        .and_then(|n| n.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_status_line() {
        let snap = parse_status_line(
            "<Idle|MPos:1.000,2.000,3.000,4.000|WPos:0.000,0.000,0.000,0.000|F:1000.0,3000.0|S:12000|T:2|H:-1.250>",
        )
        .unwrap();
        assert_eq!(snap.state, Some(MachineState::Idle));
        let m = snap.machine_pos.unwrap();
        assert_eq!((m.x, m.y, m.z, m.a), (1.0, 2.0, 3.0, 4.0));
        assert_eq!(snap.feed_rate, Some(1000.0));
        assert_eq!(snap.seek_rate, Some(3000.0));
        assert_eq!(snap.spindle_rpm, Some(12000.0));
        assert_eq!(snap.tool, Some(2));
        assert_eq!(snap.tool_length_offset, Some(-1.25));
    }

    #[test]
    fn fields_in_any_order_and_missing() {
        let snap = parse_status_line("<Run|S:5000|MPos:0.0,0.0,-2.5,0.0>").unwrap();
        assert_eq!(snap.state, Some(MachineState::Run));
        assert_eq!(snap.spindle_rpm, Some(5000.0));
        assert!(snap.work_pos.is_none());
        assert!(snap.feed_rate.is_none());
    }

    #[test]
    fn sub_state_suffix() {
        let snap = parse_status_line("<Hold:0|MPos:0.0,0.0,0.0>").unwrap();
        assert_eq!(snap.state, Some(MachineState::Hold));
    }

    #[test]
    fn non_status_lines_are_rejected() {
        assert!(parse_status_line("ok").is_none());
        assert!(parse_status_line("[G54:0,0,0]").is_none());
        assert!(parse_status_line("<unterminated").is_none());
    }

    #[test]
    fn wcs_offset_info() {
        let info = parse_info_line("[G55:10.000,20.000,-5.000]").unwrap();
        assert_eq!(
            info,
            InfoLine::WcsOffset {
                slot: WcsSlot::G55,
                x: 10.0,
                y: 20.0,
                z: -5.0
            }
        );
    }

    #[test]
    fn tlo_and_probe_info() {
        assert_eq!(
            parse_info_line("[TLO:-1.500]").unwrap(),
            InfoLine::ToolLengthOffset(-1.5)
        );
        match parse_info_line("[PRB:1.0,2.0,3.0:1]").unwrap() {
            InfoLine::Probe { position, success } => {
                assert_eq!((position.x, position.y, position.z), (1.0, 2.0, 3.0));
                assert!(success);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn error_and_alarm_codes() {
        assert_eq!(parse_error_line("error:9"), Some(9));
        assert_eq!(parse_alarm_line("ALARM:2"), Some(2));
        assert_eq!(parse_error_line("ok"), None);
    }
}
