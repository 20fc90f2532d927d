//! Error handling for carvekit
//!
//! Provides the error types for all layers of the library:
//! - Transport errors (serial/TCP byte stream)
//! - Command errors (machine-side `error:n` / `ALARM:n` replies)
//! - G-code errors (tokenisation/interpretation)
//! - File-transfer errors (block protocol)
//! - Discovery errors (UDP broadcast)
//! - State errors (operation invalid for the current link state)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Transport error type
///
/// Represents failures of the raw byte stream underneath the session,
/// independent of which protocol is being spoken over it.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// I/O failure reported by the OS
    #[error("Transport I/O error: {reason}")]
    Io {
        /// Description of the underlying I/O failure.
        reason: String,
    },

    /// A write did not complete before its deadline
    #[error("Transport timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The stream is closed (or was never opened)
    #[error("Transport is closed")]
    Closed,

    /// Address could not be understood for the requested connection kind
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The offending address string.
        address: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io {
            reason: e.to_string(),
        }
    }
}

/// Command error type
///
/// Represents machine-side rejection of a command, or a failure to get
/// the command onto the wire.
#[derive(Error, Debug, Clone)]
pub enum CommandError {
    /// The machine answered `error:<n>`
    #[error("Machine error {code}: {line}")]
    Firmware {
        /// The numeric error code.
        code: u32,
        /// The raw reply line as received.
        line: String,
    },

    /// The machine answered `ALARM:<n>`
    #[error("Machine alarm {code}: {line}")]
    Alarm {
        /// The numeric alarm code.
        code: u32,
        /// The raw reply line as received.
        line: String,
    },

    /// The command was rejected before transmission
    #[error("Command rejected: {reason}")]
    Rejected {
        /// Why the command was not sent.
        reason: String,
    },

    /// The command could not be written to the transport
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// G-code parse error type
///
/// Every variant carries the one-based source line number; syntax errors
/// additionally carry the one-based column of the offending character.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GCodeParseError {
    /// The line could not be tokenised
    #[error("Syntax error at line {line_no}, column {column}: {reason}")]
    Syntax {
        /// One-based source line number.
        line_no: u32,
        /// One-based column of the offending character.
        column: usize,
        /// What was wrong.
        reason: String,
    },

    /// Two words of the same modal group appeared on one line
    #[error("Modal conflict at line {line_no}: {reason}")]
    ModalConflict {
        /// One-based source line number.
        line_no: u32,
        /// Which words collided.
        reason: String,
    },

    /// An arc's declared end point does not lie on the computed circle
    #[error("Arc end point off circle by {deviation_mm}mm at line {line_no}")]
    ArcEndpoint {
        /// One-based source line number.
        line_no: u32,
        /// Distance between the end point and the circle, in millimetres.
        deviation_mm: f64,
    },

    /// A feed move was commanded with no feed rate in effect
    #[error("No feed rate in effect for feed move at line {line_no}")]
    MissingFeed {
        /// One-based source line number.
        line_no: u32,
    },

    /// A word required by the active command is absent
    #[error("Missing word '{word}' at line {line_no}")]
    MissingWord {
        /// One-based source line number.
        line_no: u32,
        /// The absent word letter.
        word: char,
    },

    /// A word value is out of the range the command accepts
    #[error("Invalid value for '{word}' at line {line_no}: {reason}")]
    InvalidValue {
        /// One-based source line number.
        line_no: u32,
        /// The offending word letter.
        word: char,
        /// Why the value was rejected.
        reason: String,
    },
}

impl GCodeParseError {
    /// Source line the error was raised for
    pub fn line_no(&self) -> u32 {
        match self {
            GCodeParseError::Syntax { line_no, .. }
            | GCodeParseError::ModalConflict { line_no, .. }
            | GCodeParseError::ArcEndpoint { line_no, .. }
            | GCodeParseError::MissingFeed { line_no }
            | GCodeParseError::MissingWord { line_no, .. }
            | GCodeParseError::InvalidValue { line_no, .. } => *line_no,
        }
    }
}

/// File-transfer error type
///
/// The block-protocol failure taxonomy. Everything except the two
/// cancellation variants and `Transport` is recoverable by retrying the
/// whole transfer.
#[derive(Error, Debug, Clone)]
pub enum FileTransferError {
    /// The peer stopped answering within the block timeout
    #[error("File transfer timed out after {timeout_ms}ms (block {block})")]
    Timeout {
        /// The block timeout, in milliseconds.
        timeout_ms: u64,
        /// The sequence number in flight when the timeout struck.
        block: u8,
    },

    /// A block was rejected repeatedly on checksum grounds
    #[error("Checksum rejected {retries} times for block {block}")]
    ChecksumMismatch {
        /// The sequence number that never got through.
        block: u8,
        /// How many attempts were made.
        retries: u32,
    },

    /// The MD5 footer did not match the transferred content
    #[error("MD5 mismatch: expected {expected}, computed {computed}")]
    Md5Mismatch {
        /// The digest carried in the footer.
        expected: String,
        /// The digest computed over the received content.
        computed: String,
    },

    /// The peer aborted the transfer with CAN
    #[error("Transfer cancelled by peer")]
    PeerCancelled,

    /// The local cancel flag was set
    #[error("Transfer cancelled locally")]
    LocalCancelled,

    /// The byte stream failed underneath the transfer
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl FileTransferError {
    /// Whether retrying the whole transfer can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FileTransferError::LocalCancelled | FileTransferError::Transport(_)
        )
    }
}

/// Discovery error type
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    /// The broadcast socket could not be created or configured
    #[error("Discovery socket error: {reason}")]
    Socket {
        /// Description of the socket failure.
        reason: String,
    },

    /// The query payload could not be broadcast
    #[error("Discovery broadcast failed: {reason}")]
    Broadcast {
        /// Description of the send failure.
        reason: String,
    },
}

/// State error type
///
/// Raised when an operation is invalid for the session's current link
/// state, before any bytes are written.
#[derive(Error, Debug, Clone)]
pub enum StateError {
    /// Operation requires a different link state
    #[error("Cannot {operation} while link is {status}")]
    InvalidState {
        /// The operation that was attempted.
        operation: String,
        /// The link state it was attempted in.
        status: String,
    },
}

/// Main error type for carvekit
///
/// A unified error that can represent any failure from any layer. This
/// is the error type used by the public session-level APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Command error
    #[error(transparent)]
    Command(#[from] CommandError),

    /// G-code error
    #[error(transparent)]
    Gcode(#[from] GCodeParseError),

    /// File-transfer error
    #[error(transparent)]
    FileTransfer(#[from] FileTransferError),

    /// Discovery error
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// State error
    #[error(transparent)]
    State(#[from] StateError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout of some layer
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::Timeout { .. })
                | Error::FileTransfer(FileTransferError::Timeout { .. })
        )
    }

    /// Check if this is a machine-side alarm
    pub fn is_alarm(&self) -> bool {
        matches!(self, Error::Command(CommandError::Alarm { .. }))
    }

    /// Check if this is a G-code error
    pub fn is_gcode_error(&self) -> bool {
        matches!(self, Error::Gcode(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
