//! Serial transport
//!
//! Direct USB/RS-232 connection to the machine: 115200 baud, 8-N-1, no
//! flow control. Also provides port enumeration filtered to device
//! names CNC controllers actually show up under.

use super::Transport;
use carvekit_core::TransportError;
use std::io::{Read, Write};
use std::time::Duration;

/// Fixed line settings of the machine's USB port
pub const DEFAULT_BAUD: u32 = 115_200;

/// Poll granularity for reads when no explicit deadline applies
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3")
    pub port_name: String,
    /// Human-readable description
    pub description: String,
    /// Manufacturer name if available
    pub manufacturer: Option<String>,
    /// USB serial number if available
    pub serial_number: Option<String>,
}

/// List serial ports that look like CNC controllers
///
/// Filters to the patterns machines enumerate under:
/// - Windows: `COM*`
/// - Linux: `/dev/ttyUSB*`, `/dev/ttyACM*`
/// - macOS: `/dev/cu.usbserial-*`, `/dev/cu.usbmodem*`
pub fn list_ports() -> Result<Vec<SerialPortInfo>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        TransportError::Io {
            reason: format!("failed to enumerate ports: {}", e),
        }
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_cnc_port(&port.port_name))
        .map(|port| {
            let (description, manufacturer, serial_number) = match &port.port_type {
                serialport::SerialPortType::UsbPort(usb) => (
                    format!(
                        "USB {} {}",
                        usb.manufacturer.as_deref().unwrap_or("Device"),
                        usb.product.as_deref().unwrap_or("Serial Port")
                    ),
                    usb.manufacturer.clone(),
                    usb.serial_number.clone(),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth Serial".to_string(), None, None)
                }
                _ => ("Serial Port".to_string(), None, None),
            };
            SerialPortInfo {
                port_name: port.port_name.clone(),
                description,
                manufacturer,
                serial_number,
            }
        })
        .collect())
}

fn is_cnc_port(port_name: &str) -> bool {
    if port_name.starts_with("COM") && port_name[3..].chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if port_name.starts_with("/dev/ttyUSB") || port_name.starts_with("/dev/ttyACM") {
        return true;
    }
    if port_name.starts_with("/dev/cu.usbserial-") || port_name.starts_with("/dev/cu.usbmodem") {
        return true;
    }
    false
}

/// Serial implementation of [`Transport`]
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
}

impl SerialTransport {
    /// Open a device path with the machine's fixed line settings
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let port = serialport::new(path, DEFAULT_BAUD)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .timeout(POLL_TIMEOUT)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", path, e);
                TransportError::Io {
                    reason: format!("failed to open {}: {}", path, e),
                }
            })?;
        tracing::info!("Serial connection established on {}", path);
        Ok(Self {
            port: Some(port),
            name: path.to_string(),
        })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    fn read_available(
        &mut self,
        max_bytes: usize,
        deadline: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let port = self.port_mut()?;
        port.set_timeout(deadline.max(Duration::from_millis(1)))
            .map_err(|e| TransportError::Io {
                reason: e.to_string(),
            })?;
        let mut buf = vec![0u8; max_bytes.max(1)];
        match port.read(&mut buf) {
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
        let port = self.port_mut()?;
        port.set_timeout(deadline.max(Duration::from_millis(1)))
            .map_err(|e| TransportError::Io {
                reason: e.to_string(),
            })?;
        match port.write_all(data).and_then(|_| port.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(TransportError::Timeout {
                timeout_ms: deadline.as_millis() as u64,
            }),
            Err(e) => Err(TransportError::Io {
                reason: e.to_string(),
            }),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        port.set_timeout(timeout).map_err(|e| TransportError::Io {
            reason: e.to_string(),
        })
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::info!("Serial connection on {} closed", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}
