//! TCP transport
//!
//! WiFi/Ethernet connection to the machine's command port. Addresses
//! are `"ip:port"`, or just `"ip"` for the firmware's default port.

use super::Transport;
use carvekit_core::TransportError;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Command port the firmware listens on
pub const DEFAULT_TCP_PORT: u16 = 2222;

/// Connect-phase timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// TCP implementation of [`Transport`]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connect to `"host:port"` or `"host"` (default port)
    pub fn open(address: &str) -> Result<Self, TransportError> {
        let with_port = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, DEFAULT_TCP_PORT)
        };
        let peer = with_port
            .to_socket_addrs()
            .map_err(|e| TransportError::InvalidAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress {
                address: address.to_string(),
                reason: "no addresses resolved".to_string(),
            })?;

        let stream = TcpStream::connect_timeout(&peer, CONNECT_TIMEOUT).map_err(|e| {
            tracing::warn!("TCP connection to {} failed: {}", peer, e);
            TransportError::Io {
                reason: format!("failed to connect to {}: {}", peer, e),
            }
        })?;
        stream.set_nodelay(true).ok();
        tracing::info!("TCP connection established to {}", peer);
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for TcpTransport {
    fn read_available(
        &mut self,
        max_bytes: usize,
        deadline: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream_mut()?;
        stream
            .set_read_timeout(Some(deadline.max(Duration::from_millis(1))))
            .map_err(|e| TransportError::Io {
                reason: e.to_string(),
            })?;
        let mut buf = vec![0u8; max_bytes.max(1)];
        match stream.read(&mut buf) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(TransportError::Io {
                reason: e.to_string(),
            }),
        }
    }

    fn write_all(&mut self, data: &[u8], deadline: Duration) -> Result<(), TransportError> {
        let stream = self.stream_mut()?;
        stream
            .set_write_timeout(Some(deadline.max(Duration::from_millis(1))))
            .map_err(|e| TransportError::Io {
                reason: e.to_string(),
            })?;
        match stream.write_all(data) {
            Ok(()) => Ok(()),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Err(TransportError::Timeout {
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
            Err(e) => Err(TransportError::Io {
                reason: e.to_string(),
            }),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let stream = self.stream_mut()?;
        let t = Some(timeout.max(Duration::from_millis(1)));
        stream
            .set_read_timeout(t)
            .and_then(|_| stream.set_write_timeout(t))
            .map_err(|e| TransportError::Io {
                reason: e.to_string(),
            })
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            tracing::info!("TCP connection to {} closed", self.peer);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
