//! # Carvekit Communication
//!
//! Everything that touches the wire: the serial/TCP transport
//! abstraction, UDP machine discovery, the XMODEM-1K file-transfer
//! engine and the session controller with its keep-alive prober.

pub mod controller;
pub mod discovery;
pub mod transport;
pub mod xmodem;

pub use controller::{
    realtime, LinkStatus, NamedPosition, Session, SessionConfig, SessionEvent,
};
pub use discovery::{MachineDetector, MachineInfo, DEFAULT_WINDOW, DISCOVERY_PORT};
pub use transport::{
    list_ports, open, ConnectionKind, SerialPortInfo, SerialTransport, TcpTransport, Transport,
};
pub use xmodem::{
    ProgressFn, ReceivedFile, TransferKind, TransferStats, Xmodem, XmodemConfig,
};
