//! Byte-stream transport abstraction
//!
//! One trait over the serial and TCP links. Reads are non-greedy: they
//! return whatever arrived before the deadline, possibly nothing. Writes
//! hand the whole buffer to the OS or fail.

pub mod serial;
pub mod tcp;

use carvekit_core::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use serial::{list_ports, SerialPortInfo, SerialTransport};
pub use tcp::TcpTransport;

/// Kind of link a session runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// USB/RS-232 serial device
    Serial,
    /// TCP socket (WiFi/Ethernet)
    Tcp,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKind::Serial => write!(f, "serial"),
            ConnectionKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Framing-free byte stream with deadlines
pub trait Transport: Send {
    /// Read whatever is available, up to `max_bytes`, waiting at most
    /// `deadline`. An empty vector means nothing arrived in time.
    fn read_available(
        &mut self,
        max_bytes: usize,
        deadline: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Write the whole buffer, waiting at most `deadline` for the OS to
    /// accept it. Partial writes are a failure.
    fn write_all(&mut self, data: &[u8], deadline: Duration) -> Result<(), TransportError>;

    /// Set the default timeout used by subsequent operations that do
    /// not carry their own deadline.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Close the stream. Further operations fail with `Closed`.
    fn close(&mut self);

    /// Whether the stream is usable
    fn is_open(&self) -> bool;
}

/// Open a transport of the given kind
///
/// Addresses are `"host:port"` (port optional) for TCP and an OS device
/// path for serial.
pub fn open(address: &str, kind: ConnectionKind) -> Result<Box<dyn Transport>, TransportError> {
    match kind {
        ConnectionKind::Serial => Ok(Box::new(SerialTransport::open(address)?)),
        ConnectionKind::Tcp => Ok(Box::new(TcpTransport::open(address)?)),
    }
}
