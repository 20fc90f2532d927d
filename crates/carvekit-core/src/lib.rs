//! # Carvekit Core
//!
//! Core types for the carvekit CNC control library: the machine state
//! model, the error taxonomy shared by every layer, units, and small
//! utilities. No I/O lives here.

pub mod error;
pub mod state;
pub mod units;
pub mod utils;

pub use error::{
    CommandError, DiscoveryError, Error, FileTransferError, GCodeParseError, Result, StateError,
    TransportError,
};

pub use state::{
    CncState, DistanceMode, MachineState, Margins, ModalDelta, MotionKind, MotionMode, PathPoint,
    Plane, Position, StatusSnapshot, ToolOffset, WcsSlot, WorkOffset,
};

pub use units::Units;
