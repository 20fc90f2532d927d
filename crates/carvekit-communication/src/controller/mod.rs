//! Session controller
//!
//! Owns the transport, the shared machine state and the background
//! keep-alive prober. Commands go down as CR-LF terminated ASCII lines;
//! real-time control bytes bypass the line protocol; machine output is
//! demultiplexed into status reports, informational records and command
//! replies.

pub mod status;

use crate::transport::{self, ConnectionKind, Transport};
use crate::xmodem::{ProgressFn, TransferStats, Xmodem, XmodemConfig};
use carvekit_core::{
    CncState, CommandError, Error, Result, StateError, TransportError, WorkOffset,
};
use carvekit_gcode::GcodeParser;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use status::InfoLine;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Real-time control bytes, written outside the line protocol
pub mod realtime {
    /// Status query
    pub const STATUS_QUERY: u8 = b'?';
    /// Feed hold
    pub const FEED_HOLD: u8 = b'!';
    /// Resume from hold
    pub const RESUME: u8 = b'~';
    /// Soft reset (Ctrl-X)
    pub const SOFT_RESET: u8 = 0x18;

    /// Feed override to 100%
    pub const FEED_OVR_RESET: u8 = 0x90;
    /// Feed override +10%
    pub const FEED_OVR_COARSE_PLUS: u8 = 0x91;
    /// Feed override -10%
    pub const FEED_OVR_COARSE_MINUS: u8 = 0x92;
    /// Feed override +1%
    pub const FEED_OVR_FINE_PLUS: u8 = 0x93;
    /// Feed override -1%
    pub const FEED_OVR_FINE_MINUS: u8 = 0x94;

    /// Spindle override to 100%
    pub const SPINDLE_OVR_RESET: u8 = 0x99;
    /// Spindle override +10%
    pub const SPINDLE_OVR_COARSE_PLUS: u8 = 0x9a;
    /// Spindle override -10%
    pub const SPINDLE_OVR_COARSE_MINUS: u8 = 0x9b;
    /// Spindle override +1%
    pub const SPINDLE_OVR_FINE_PLUS: u8 = 0x9c;
    /// Spindle override -1%
    pub const SPINDLE_OVR_FINE_MINUS: u8 = 0x9d;
}

/// Link state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Idle,
    Busy,
    FileTransfer,
    Error,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Idle => "idle",
            LinkStatus::Busy => "busy",
            LinkStatus::FileTransfer => "file-transfer",
            LinkStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Asynchronous notifications surfaced by the prober and reply handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The link went silent past the fault window or failed outright
    LinkError { reason: String },
    /// The session left the connected state
    Disconnected { reason: String },
    /// The machine answered `error:<n>`
    FirmwareError { code: u32, line: String },
    /// The machine raised `ALARM:<n>`
    Alarm { code: u32, line: String },
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Keep-alive probe cadence
    pub poll_interval: Duration,
    /// Silence after which an extra probe goes out
    pub silent_reprobe: Duration,
    /// Silence after which the link is declared dead
    pub silent_fault: Duration,
    /// Deadline for individual command writes
    pub write_timeout: Duration,
    /// Bound on the pending-reply queue
    pub reply_capacity: usize,
    /// Bound on the command history ring
    pub history_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            silent_reprobe: Duration::from_millis(4500),
            silent_fault: Duration::from_millis(7000),
            write_timeout: Duration::from_secs(1),
            reply_capacity: 256,
            history_capacity: 100,
        }
    }
}

/// Named park positions the firmware knows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamedPosition {
    Clearance,
    WorkOrigin,
    Anchor1,
    Anchor2,
    PathOrigin,
}

struct Shared {
    config: SessionConfig,
    transport: Mutex<Option<Box<dyn Transport>>>,
    cnc: Mutex<CncState>,
    parser: Mutex<GcodeParser>,
    link: Mutex<LinkStatus>,
    kind: Mutex<Option<ConnectionKind>>,
    running: AtomicBool,
    keep_alive: AtomicBool,
    stop: AtomicBool,
    replies: Mutex<VecDeque<String>>,
    events: Mutex<VecDeque<SessionEvent>>,
    history: Mutex<VecDeque<String>>,
    last_rx: Mutex<Instant>,
    transfer_cancel: Arc<AtomicBool>,
}

impl Shared {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            transport: Mutex::new(None),
            cnc: Mutex::new(CncState::new()),
            parser: Mutex::new(GcodeParser::new()),
            link: Mutex::new(LinkStatus::Disconnected),
            kind: Mutex::new(None),
            running: AtomicBool::new(false),
            keep_alive: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            replies: Mutex::new(VecDeque::new()),
            events: Mutex::new(VecDeque::new()),
            history: Mutex::new(VecDeque::new()),
            last_rx: Mutex::new(Instant::now()),
            transfer_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn push_event(&self, event: SessionEvent) {
        self.events.lock().push_back(event);
    }

    fn push_reply(&self, line: String) {
        let mut replies = self.replies.lock();
        if replies.len() >= self.config.reply_capacity {
            replies.pop_front();
        }
        replies.push_back(line);
    }

    fn set_link(&self, status: LinkStatus) {
        *self.link.lock() = status;
        self.refresh_keep_alive();
    }

    fn link(&self) -> LinkStatus {
        *self.link.lock()
    }

    /// Keep-alive runs only while idle and not running
    fn refresh_keep_alive(&self) {
        let alive = self.link() == LinkStatus::Idle && !self.running.load(Ordering::Relaxed);
        self.keep_alive.store(alive, Ordering::Relaxed);
    }

    fn write_bytes(&self, bytes: &[u8]) -> std::result::Result<(), TransportError> {
        let mut guard = self.transport.lock();
        let t = guard.as_mut().ok_or(TransportError::Closed)?;
        t.write_all(bytes, self.config.write_timeout)
    }

    /// Demultiplex one reply line from the machine
    fn handle_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        if trimmed.starts_with('<') {
            if let Some(snapshot) = status::parse_status_line(trimmed) {
                self.cnc.lock().apply_status(&snapshot);
            }
            return;
        }

        if trimmed.starts_with('[') {
            match status::parse_info_line(trimmed) {
                Some(InfoLine::WcsOffset { slot, x, y, z }) => {
                    let mut cnc = self.cnc.lock();
                    let rotation = cnc.wcs_offsets[slot.index()].rotation_deg;
                    cnc.set_wcs_offset(
                        slot,
                        WorkOffset {
                            x,
                            y,
                            z,
                            rotation_deg: rotation,
                        },
                    );
                }
                Some(InfoLine::ToolLengthOffset(tlo)) => {
                    self.cnc.lock().tool_length_offset = tlo;
                }
                Some(InfoLine::Probe { .. }) | Some(InfoLine::Other(_)) | None => {
                    self.push_reply(trimmed.to_string());
                }
            }
            return;
        }

        if let Some(code) = status::parse_error_line(trimmed) {
            tracing::error!("machine error {}: {}", code, trimmed);
            self.push_event(SessionEvent::FirmwareError {
                code,
                line: trimmed.to_string(),
            });
            self.set_link(LinkStatus::Error);
        } else if let Some(code) = status::parse_alarm_line(trimmed) {
            tracing::error!("machine alarm {}: {}", code, trimmed);
            self.push_event(SessionEvent::Alarm {
                code,
                line: trimmed.to_string(),
            });
            self.set_link(LinkStatus::Error);
        } else {
            tracing::debug!("machine reply: {}", trimmed);
        }
        self.push_reply(trimmed.to_string());
    }
}

/// Live connection to one machine
///
/// Created by [`Session::connect`]; torn down by [`Session::disconnect`]
/// or drop. Exactly one background prober runs per session, keeping the
/// firmware's 5-second idle watchdog fed while the link is idle.
pub struct Session {
    shared: Arc<Shared>,
    prober: Option<JoinHandle<()>>,
}

impl Session {
    /// Connect to a machine at `address` over the given link kind
    pub fn connect(address: &str, kind: ConnectionKind) -> Result<Self> {
        Self::connect_with_config(address, kind, SessionConfig::default())
    }

    /// Connect with custom session tuning
    pub fn connect_with_config(
        address: &str,
        kind: ConnectionKind,
        config: SessionConfig,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::new(config));
        shared.set_link(LinkStatus::Connecting);
        tracing::info!("connecting to {} over {}", address, kind);

        match transport::open(address, kind) {
            Ok(t) => {
                *shared.transport.lock() = Some(t);
                *shared.kind.lock() = Some(kind);
            }
            Err(e) => {
                shared.set_link(LinkStatus::Disconnected);
                tracing::error!("connection to {} failed: {}", address, e);
                return Err(e.into());
            }
        }

        Ok(Self::start(shared))
    }

    /// Build a session over an already-open transport
    ///
    /// Used by tests and by callers that construct their own links.
    pub fn with_transport(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        let shared = Arc::new(Shared::new(config));
        *shared.transport.lock() = Some(transport);
        Self::start(shared)
    }

    fn start(shared: Arc<Shared>) -> Self {
        shared.set_link(LinkStatus::Idle);
        *shared.last_rx.lock() = Instant::now();
        let prober_shared = shared.clone();
        let prober = std::thread::Builder::new()
            .name("carvekit-prober".to_string())
            .spawn(move || prober_loop(prober_shared))
            .ok();
        Self { shared, prober }
    }

    /// Tear the session down
    ///
    /// Stops the prober cooperatively, closes the transport and leaves
    /// the session `disconnected`.
    pub fn disconnect(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.prober.take() {
            let _ = handle.join();
        }
        if let Some(mut t) = self.shared.transport.lock().take() {
            t.close();
        }
        self.shared.set_link(LinkStatus::Disconnected);
        tracing::info!("session disconnected");
    }

    /// Current link status
    pub fn link_status(&self) -> LinkStatus {
        self.shared.link()
    }

    /// Link kind, if connected via an address
    pub fn connection_kind(&self) -> Option<ConnectionKind> {
        *self.shared.kind.lock()
    }

    /// Whether the transport is up
    pub fn is_connected(&self) -> bool {
        !matches!(
            self.link_status(),
            LinkStatus::Disconnected | LinkStatus::Connecting
        )
    }

    /// Copy of the shared machine state
    pub fn snapshot(&self) -> CncState {
        self.shared.cnc.lock().clone()
    }

    /// Run a closure against the shared machine state
    pub fn with_state<T>(&self, f: impl FnOnce(&mut CncState) -> T) -> T {
        f(&mut self.shared.cnc.lock())
    }

    /// Declare a long-running operation
    ///
    /// While the running flag is set the prober stays silent so its `?`
    /// probes cannot interleave with the operation's output.
    pub fn set_running(&self, running: bool) {
        self.shared.running.store(running, Ordering::Relaxed);
        let link = self.shared.link();
        if running && link == LinkStatus::Idle {
            self.shared.set_link(LinkStatus::Busy);
        } else if !running && link == LinkStatus::Busy {
            self.shared.set_link(LinkStatus::Idle);
        }
        self.shared.refresh_keep_alive();
    }

    /// Pop the oldest pending event
    pub fn poll_event(&self) -> Option<SessionEvent> {
        self.shared.events.lock().pop_front()
    }

    /// Pop the oldest pending reply line
    pub fn poll_reply(&self) -> Option<String> {
        self.shared.replies.lock().pop_front()
    }

    /// Drain all pending reply lines
    pub fn take_replies(&self) -> Vec<String> {
        self.shared.replies.lock().drain(..).collect()
    }

    /// Recent command history, oldest first
    pub fn history(&self) -> Vec<String> {
        self.shared.history.lock().iter().cloned().collect()
    }

    fn guard_writable(&self, operation: &str) -> Result<()> {
        match self.link_status() {
            LinkStatus::Idle | LinkStatus::Busy => Ok(()),
            status => Err(StateError::InvalidState {
                operation: operation.to_string(),
                status: status.to_string(),
            }
            .into()),
        }
    }

    /// Send one command line (CR-LF appended)
    pub fn send(&self, line: &str) -> Result<()> {
        self.guard_writable("send command")?;
        let mut wire = line.trim_end().to_string();
        wire.push_str("\r\n");
        self.shared
            .write_bytes(wire.as_bytes())
            .map_err(CommandError::Transport)?;
        tracing::debug!("sent: {}", line.trim_end());

        let mut history = self.shared.history.lock();
        let entry = line.trim().to_string();
        if !entry.is_empty() && history.back() != Some(&entry) {
            if history.len() >= self.shared.config.history_capacity {
                history.pop_front();
            }
            history.push_back(entry);
        }
        Ok(())
    }

    /// Send a G-code line and mirror it into the local parser state
    pub fn execute_gcode(&self, line: &str) -> Result<()> {
        {
            let mut parser = self.shared.parser.lock();
            let mut cnc = self.shared.cnc.lock();
            parser.parse_line(&mut cnc, line, 0)?;
        }
        self.send(line)
    }

    /// Wait for the next reply line, polling the pending queue
    ///
    /// Returns `None` on timeout.
    pub fn wait_reply(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.poll_reply() {
                return Some(line);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Send a command and block until the machine answers `ok`
    pub fn send_wait_ok(&self, line: &str, timeout: Duration) -> Result<()> {
        self.send(line)?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            }
            match self.wait_reply(remaining) {
                Some(reply) if reply == "ok" => return Ok(()),
                Some(reply) => {
                    if let Some(code) = status::parse_error_line(&reply) {
                        return Err(CommandError::Firmware { code, line: reply }.into());
                    }
                    if let Some(code) = status::parse_alarm_line(&reply) {
                        return Err(CommandError::Alarm { code, line: reply }.into());
                    }
                    // Informational chatter; keep waiting.
                }
                None => {
                    return Err(TransportError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .into())
                }
            }
        }
    }

    /// Write one real-time byte, bypassing the line protocol
    pub fn write_realtime(&self, byte: u8) -> Result<()> {
        if self.link_status() == LinkStatus::FileTransfer {
            return Err(StateError::InvalidState {
                operation: "write real-time byte".to_string(),
                status: LinkStatus::FileTransfer.to_string(),
            }
            .into());
        }
        self.shared
            .write_bytes(&[byte])
            .map_err(CommandError::Transport)?;
        Ok(())
    }

    // ---- high-level operations -------------------------------------

    /// Home all axes
    pub fn home(&self) -> Result<()> {
        self.send("$H")
    }

    /// Unlock an alarm state
    pub fn unlock_alarm(&self) -> Result<()> {
        self.send("$X")
    }

    /// Jog the given axes; omitted axes do not move
    pub fn jog(
        &self,
        dx: Option<f64>,
        dy: Option<f64>,
        dz: Option<f64>,
        da: Option<f64>,
        speed: Option<f64>,
    ) -> Result<()> {
        let mut cmd = String::from("$J");
        for (letter, value) in [('X', dx), ('Y', dy), ('Z', dz), ('A', da), ('S', speed)] {
            if let Some(v) = value {
                cmd.push_str(&format!(" {}{}", letter, v));
            }
        }
        if cmd.len() == 2 {
            return Err(CommandError::Rejected {
                reason: "jog with no axes".to_string(),
            }
            .into());
        }
        self.send(&cmd)
    }

    /// Feed hold (pause motion)
    pub fn feed_hold(&self) -> Result<()> {
        self.write_realtime(realtime::FEED_HOLD)
    }

    /// Resume from feed hold
    pub fn resume(&self) -> Result<()> {
        self.write_realtime(realtime::RESUME)
    }

    /// Soft-reset the firmware and clear a machine-side error state
    pub fn soft_reset(&self) -> Result<()> {
        self.write_realtime(realtime::SOFT_RESET)?;
        self.shared.replies.lock().clear();
        if self.link_status() == LinkStatus::Error {
            self.shared.set_link(LinkStatus::Idle);
        }
        Ok(())
    }

    /// Set the feed override, 1..=300 percent
    ///
    /// Encoded as real-time bytes: reset to 100%, then coarse and fine
    /// steps to the requested value.
    pub fn set_feed_scale(&self, pct: u16) -> Result<()> {
        if !(1..=300).contains(&pct) {
            return Err(CommandError::Rejected {
                reason: format!("feed scale {}% outside 1..=300", pct),
            }
            .into());
        }
        self.write_realtime(realtime::FEED_OVR_RESET)?;
        let mut current = 100i32;
        let target = pct as i32;
        while current + 10 <= target {
            self.write_realtime(realtime::FEED_OVR_COARSE_PLUS)?;
            current += 10;
        }
        while current - 10 >= target {
            self.write_realtime(realtime::FEED_OVR_COARSE_MINUS)?;
            current -= 10;
        }
        while current < target {
            self.write_realtime(realtime::FEED_OVR_FINE_PLUS)?;
            current += 1;
        }
        while current > target {
            self.write_realtime(realtime::FEED_OVR_FINE_MINUS)?;
            current -= 1;
        }
        self.shared.cnc.lock().feed_override = pct;
        Ok(())
    }

    /// Set the spindle override, 1..=200 percent
    pub fn set_spindle_scale(&self, pct: u16) -> Result<()> {
        if !(1..=200).contains(&pct) {
            return Err(CommandError::Rejected {
                reason: format!("spindle scale {}% outside 1..=200", pct),
            }
            .into());
        }
        self.write_realtime(realtime::SPINDLE_OVR_RESET)?;
        let mut current = 100i32;
        let target = pct as i32;
        while current + 10 <= target {
            self.write_realtime(realtime::SPINDLE_OVR_COARSE_PLUS)?;
            current += 10;
        }
        while current - 10 >= target {
            self.write_realtime(realtime::SPINDLE_OVR_COARSE_MINUS)?;
            current -= 10;
        }
        while current < target {
            self.write_realtime(realtime::SPINDLE_OVR_FINE_PLUS)?;
            current += 1;
        }
        while current > target {
            self.write_realtime(realtime::SPINDLE_OVR_FINE_MINUS)?;
            current -= 1;
        }
        self.shared.cnc.lock().spindle_override = pct;
        Ok(())
    }

    /// Probe workpiece X/Y/Z with the probe block
    pub fn xyz_probe(&self, height: f64, diameter: f64) -> Result<()> {
        self.send(&format!("M495.3 H{} D{}", height, diameter))
    }

    /// Margin / Z-probe / auto-level command over the parsed job's bounds
    ///
    /// Encodes the firmware's M495 vocabulary: the job bounding box as
    /// X/Y (min) and C/D (max), O/F for the probe offset, A/B/I/J/H for
    /// the levelling grid and P1 to return to origin.
    pub fn auto_command(
        &self,
        margin: bool,
        zprobe: bool,
        leveling: bool,
        i: u32,
        j: u32,
        goto_origin: bool,
    ) -> Result<()> {
        if !(margin || zprobe || leveling || goto_origin) {
            return Err(CommandError::Rejected {
                reason: "no auto operation selected".to_string(),
            }
            .into());
        }
        let margins = self.shared.cnc.lock().get_margins();
        if margins.is_empty() {
            return Err(CommandError::Rejected {
                reason: "no job bounds: parse a file first".to_string(),
            }
            .into());
        }

        let base = format!("M495 X{:.3}Y{:.3}", margins.xmin, margins.ymin);
        if margin {
            self.send(&format!(
                "{}C{:.3}D{:.3}",
                base, margins.xmax, margins.ymax
            ))?;
        }

        // The closing command always goes out, even when only the
        // margin pass ran and it carries no extra parameters.
        let mut cmd = base;
        if zprobe {
            cmd.push_str("O0F0");
        }
        if leveling {
            let width = margins.xmax - margins.xmin;
            let height = margins.ymax - margins.ymin;
            cmd.push_str(&format!("A{:.3}B{:.3}I{}J{}H5", width, height, i, j));
        }
        if goto_origin {
            cmd.push_str("P1");
        }
        self.send(&cmd)
    }

    /// Move to a firmware-defined park position
    pub fn goto_position(&self, position: NamedPosition) -> Result<()> {
        let cmd = match position {
            NamedPosition::Clearance => "M496.1".to_string(),
            NamedPosition::WorkOrigin => "M496.2".to_string(),
            NamedPosition::Anchor1 => "M496.3".to_string(),
            NamedPosition::Anchor2 => "M496.4".to_string(),
            NamedPosition::PathOrigin => {
                let margins = self.shared.cnc.lock().get_margins();
                if margins.is_empty() {
                    return Err(CommandError::Rejected {
                        reason: "no job bounds: parse a file first".to_string(),
                    }
                    .into());
                }
                format!("M496.5 X{:.3}Y{:.3}", margins.xmin, margins.ymin)
            }
        };
        self.send(&cmd)
    }

    /// Trigger the firmware-side tool change
    pub fn change_tool(&self) -> Result<()> {
        self.send("M490.2")
    }

    /// Spindle on at the given RPM, or off
    pub fn set_spindle_switch(&self, on: bool, rpm: u32) -> Result<()> {
        if on {
            self.send(&format!("M3 S{}", rpm))
        } else {
            self.send("M5")
        }
    }

    /// Ask for the firmware version
    pub fn query_version(&self) -> Result<()> {
        self.send("version")
    }

    /// Ask for the machine model
    pub fn query_model(&self) -> Result<()> {
        self.send("model")
    }

    /// Ask for the machine clock
    pub fn query_time(&self) -> Result<()> {
        self.send("time")
    }

    /// Push the local clock to the machine
    pub fn sync_time(&self) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::other(format!("system clock error: {}", e)))?;
        self.send(&format!("time {}", now.as_secs()))
    }

    // ---- file transfer ---------------------------------------------

    /// Cancel flag honoured by a transfer in progress
    pub fn cancel_transfer(&self) {
        self.shared.transfer_cancel.store(true, Ordering::Relaxed);
    }

    /// Upload a local file to the machine
    pub fn upload(
        &self,
        local_path: impl AsRef<Path>,
        remote_name: &str,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<TransferStats> {
        let content = std::fs::read(local_path)?;
        self.upload_bytes(remote_name, &content, progress)
    }

    /// Upload raw bytes under a remote name
    ///
    /// Announces the transfer on the command channel (`upload <name>`)
    /// while the link is still idle, then hands the wire to the block
    /// engine until the MD5 verdict.
    pub fn upload_bytes(
        &self,
        remote_name: &str,
        content: &[u8],
        progress: Option<ProgressFn<'_>>,
    ) -> Result<TransferStats> {
        self.begin_transfer("upload", remote_name)?;
        let result = self.run_transfer(|modem| modem.send(remote_name, content, progress));
        self.end_transfer();
        Ok(result?)
    }

    /// Download a remote file to a local path
    pub fn download(
        &self,
        remote_name: &str,
        local_path: impl AsRef<Path>,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<TransferStats> {
        let received = self.download_bytes(remote_name, progress)?;
        std::fs::write(local_path, &received.1)?;
        Ok(received.0)
    }

    /// Download a remote file into memory
    ///
    /// Returns the transfer counters and the decompressed content.
    pub fn download_bytes(
        &self,
        remote_name: &str,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<(TransferStats, Vec<u8>)> {
        self.begin_transfer("download", remote_name)?;
        let result = self.run_transfer(|modem| modem.recv(progress));
        self.end_transfer();
        let file = result?;
        Ok((file.stats, file.content))
    }

    /// Hand the locked transport to the transfer engine
    fn run_transfer<T>(
        &self,
        body: impl FnOnce(&mut Xmodem<'_>) -> std::result::Result<T, carvekit_core::FileTransferError>,
    ) -> std::result::Result<T, carvekit_core::FileTransferError> {
        let mut guard = self.shared.transport.lock();
        let t = guard.as_mut().ok_or(TransportError::Closed)?;
        let mut modem = Xmodem::new(t.as_mut(), XmodemConfig::default());
        modem.set_cancel_flag(self.shared.transfer_cancel.clone());
        body(&mut modem)
    }

    /// Announce the transfer on the command channel and lock the link
    ///
    /// The `upload <name>` / `download <name>` line is an ordinary idle
    /// command; only once it is on the wire does the link transition to
    /// `file-transfer`, after which nothing but block-protocol bytes may
    /// be written.
    fn begin_transfer(&self, verb: &str, remote_name: &str) -> Result<()> {
        {
            let mut link = self.shared.link.lock();
            if *link != LinkStatus::Idle {
                return Err(StateError::InvalidState {
                    operation: "start file transfer".to_string(),
                    status: link.to_string(),
                }
                .into());
            }
            let line = format!("{} {}\r\n", verb, remote_name);
            self.shared
                .write_bytes(line.as_bytes())
                .map_err(Error::Transport)?;
            *link = LinkStatus::FileTransfer;
        }
        self.shared.transfer_cancel.store(false, Ordering::Relaxed);
        self.shared.running.store(true, Ordering::Relaxed);
        self.shared.refresh_keep_alive();
        Ok(())
    }

    /// Transfers always leave the link idle, success or not
    fn end_transfer(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        self.shared.transfer_cancel.store(false, Ordering::Relaxed);
        if self.shared.link() == LinkStatus::FileTransfer {
            self.shared.set_link(LinkStatus::Idle);
        }
        *self.shared.last_rx.lock() = Instant::now();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.prober.is_some() {
            self.disconnect();
        }
    }
}

/// Background keep-alive and reply pump
///
/// Runs every 10 ms: probes with `?` at the poll cadence while the link
/// is idle and the caller has not asserted the running flag, pumps
/// incoming bytes into lines, and watches for the firmware's silence.
fn prober_loop(shared: Arc<Shared>) {
    let mut last_probe = Instant::now();
    let mut reprobe_sent = false;
    let mut line_buf: Vec<u8> = Vec::new();

    tracing::debug!("prober started");
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }

        let link = shared.link();
        let running = shared.running.load(Ordering::Relaxed);
        shared.refresh_keep_alive();

        if link == LinkStatus::FileTransfer {
            // The transfer engine owns the wire.
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }

        let keep_alive = link == LinkStatus::Idle && !running;
        if keep_alive {
            if last_probe.elapsed() >= shared.config.poll_interval {
                if let Err(e) = shared.write_bytes(&[realtime::STATUS_QUERY]) {
                    tracing::warn!("keep-alive probe failed: {}", e);
                    shared.set_link(LinkStatus::Error);
                    shared.push_event(SessionEvent::LinkError {
                        reason: e.to_string(),
                    });
                    shared.push_event(SessionEvent::Disconnected {
                        reason: e.to_string(),
                    });
                    break;
                }
                last_probe = Instant::now();
            }
        }

        // Pump whatever the machine sent.
        let bytes = {
            let mut guard = shared.transport.lock();
            match guard.as_mut() {
                Some(t) => t.read_available(256, Duration::from_millis(10)),
                None => break,
            }
        };
        match bytes {
            Ok(bytes) if !bytes.is_empty() => {
                *shared.last_rx.lock() = Instant::now();
                reprobe_sent = false;
                for b in bytes {
                    if b == b'\n' {
                        if let Ok(line) = std::str::from_utf8(&line_buf) {
                            shared.handle_line(line);
                        }
                        line_buf.clear();
                    } else if b != b'\r' {
                        line_buf.push(b);
                    }
                }
            }
            Ok(_) => {}
            Err(TransportError::Closed) => break,
            Err(e) => {
                tracing::warn!("prober read failed: {}", e);
                shared.set_link(LinkStatus::Error);
                shared.push_event(SessionEvent::LinkError {
                    reason: e.to_string(),
                });
                shared.push_event(SessionEvent::Disconnected {
                    reason: e.to_string(),
                });
                break;
            }
        }

        // Silence watchdog, active only while keep-alive may speak.
        if keep_alive {
            let silent = shared.last_rx.lock().elapsed();
            if silent >= shared.config.silent_fault {
                tracing::error!(
                    "machine silent for {:?}, marking link dead",
                    silent
                );
                shared.set_link(LinkStatus::Error);
                shared.push_event(SessionEvent::LinkError {
                    reason: format!("no data for {:?}", silent),
                });
                shared.push_event(SessionEvent::Disconnected {
                    reason: "firmware watchdog".to_string(),
                });
                break;
            }
            if silent >= shared.config.silent_reprobe && !reprobe_sent {
                tracing::debug!("link quiet for {:?}, extra probe", silent);
                if shared.write_bytes(&[realtime::STATUS_QUERY]).is_ok() {
                    reprobe_sent = true;
                }
            }
        }

        std::thread::sleep(Duration::from_millis(10));
    }
    tracing::debug!("prober stopped");
}
