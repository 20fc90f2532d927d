//! # Carvekit
//!
//! A headless control library for desktop CNC machines (spindle/laser
//! with three linear axes plus a rotary axis):
//!
//! - G-code parsing and kinematic interpretation: modal state, work
//!   coordinate systems, tool offsets, arc and canned-cycle expansion
//! - A session controller over serial or TCP with reply demultiplexing
//!   and a keep-alive prober for the firmware's 5-second idle watchdog
//! - XMODEM-1K file transfer with CRC-16, an MD5 integrity footer and
//!   optional LZ compression
//! - UDP broadcast discovery of machines on the local network
//!
//! ## Architecture
//!
//! Carvekit is organised as a workspace with three crates:
//!
//! 1. **carvekit-core** - machine state, error taxonomy, units, utilities
//! 2. **carvekit-gcode** - tokeniser, modal interpreter, path expansion
//! 3. **carvekit-communication** - transport, discovery, file transfer,
//!    session controller
//!
//! The UI, visualiser and CAM layers sit above this crate and consume
//! the coordinate streams and state snapshots it produces.

pub use carvekit_core::{
    utils, CncState, CommandError, DiscoveryError, DistanceMode, Error, FileTransferError,
    GCodeParseError, MachineState, Margins, ModalDelta, MotionKind, MotionMode, PathPoint, Plane,
    Position, Result, StateError, StatusSnapshot, ToolOffset, TransportError, Units, WcsSlot,
    WorkOffset,
};

pub use carvekit_gcode::{
    modal_group, parse_program, tokenize, validate_gcode_line, GcodeParser, ModalSnapshot,
    ParsedLine, Word,
};

pub use carvekit_communication::{
    list_ports, open, realtime, ConnectionKind, LinkStatus, MachineDetector, MachineInfo,
    NamedPosition, ReceivedFile, SerialPortInfo, SerialTransport, Session, SessionConfig,
    SessionEvent, TcpTransport, TransferKind, TransferStats, Transport, Xmodem, XmodemConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with the default configuration
///
/// Sets up structured console logging with `RUST_LOG` support. Library
/// code only emits `tracing` events; embedding applications that bring
/// their own subscriber should skip this.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}
