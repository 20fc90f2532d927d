//! Machine discovery over UDP broadcast
//!
//! Machines on the local network answer a single `?` datagram on port
//! 3333 with an ASCII record `name,ip,port,busy`. Discovery is usable
//! before any connection exists and never blocks longer than the
//! configured window.

use carvekit_core::DiscoveryError;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

/// Port machines listen for discovery queries on
pub const DISCOVERY_PORT: u16 = 3333;

/// Default listening window after a query
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3);

/// Receive poll granularity inside the window
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// One discovered machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Machine name as broadcast by the firmware
    pub name: String,
    /// IPv4 address, dotted-quad text
    pub ip: String,
    /// Command port
    pub port: u16,
    /// True if another client is connected
    pub busy: bool,
}

/// Broadcast-based machine detector
pub struct MachineDetector {
    window: Duration,
    socket: Option<UdpSocket>,
    started: Option<Instant>,
    seen: Vec<MachineInfo>,
}

impl Default for MachineDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineDetector {
    /// Detector with the default 3 s window
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Detector with a custom listening window
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            socket: None,
            started: None,
            seen: Vec::new(),
        }
    }

    /// Broadcast a query and start a fresh listening window
    pub fn query(&mut self) -> Result<(), DiscoveryError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT)).map_err(|e| {
            DiscoveryError::Socket {
                reason: format!("failed to bind UDP port {}: {}", DISCOVERY_PORT, e),
            }
        })?;
        socket
            .set_broadcast(true)
            .and_then(|_| socket.set_read_timeout(Some(RECV_TIMEOUT)))
            .map_err(|e| DiscoveryError::Socket {
                reason: e.to_string(),
            })?;
        socket
            .send_to(b"?", (Ipv4Addr::BROADCAST, DISCOVERY_PORT))
            .map_err(|e| DiscoveryError::Broadcast {
                reason: e.to_string(),
            })?;

        tracing::info!("Machine discovery query broadcast on port {}", DISCOVERY_PORT);
        self.socket = Some(socket);
        self.started = Some(Instant::now());
        self.seen.clear();
        Ok(())
    }

    /// Collect responses until the window closes
    ///
    /// Blocks for whatever remains of the window, then returns every
    /// unique machine seen since the last `query`, de-duplicated by
    /// `(ip, port)`. Malformed records are dropped silently.
    pub fn collect(&mut self) -> Result<Vec<MachineInfo>, DiscoveryError> {
        let (socket, started) = match (&self.socket, self.started) {
            (Some(s), Some(t)) => (s, t),
            _ => {
                return Err(DiscoveryError::Socket {
                    reason: "collect called before query".to_string(),
                })
            }
        };

        let mut buf = [0u8; 128];
        while started.elapsed() < self.window {
            match socket.recv_from(&mut buf) {
                Ok((n, _addr)) => {
                    if let Some(info) = parse_record(&buf[..n]) {
                        if !self
                            .seen
                            .iter()
                            .any(|m| m.ip == info.ip && m.port == info.port)
                        {
                            tracing::info!(
                                "Discovered machine '{}' at {}:{}",
                                info.name,
                                info.ip,
                                info.port
                            );
                            self.seen.push(info);
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::debug!("Discovery receive error: {}", e);
                }
            }
        }

        self.socket = None;
        self.started = None;
        Ok(self.seen.clone())
    }
}

/// Parse one `name,ip,port,busy` record
fn parse_record(data: &[u8]) -> Option<MachineInfo> {
    let text = std::str::from_utf8(data).ok()?;
    let fields: Vec<&str> = text.trim().split(',').collect();
    if fields.len() < 4 || fields[0].is_empty() {
        return None;
    }
    let port: u16 = fields[2].parse().ok()?;
    fields[1].parse::<Ipv4Addr>().ok()?;
    Some(MachineInfo {
        name: fields[0].to_string(),
        ip: fields[1].to_string(),
        port,
        busy: fields[3] == "1",
    })
}
