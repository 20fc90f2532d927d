//! XMODEM-1K file transfer
//!
//! The machine's variant of XMODEM: length-prefixed blocks, a filename
//! header block, an MD5 footer over the uncompressed content, and
//! optional LZ compression negotiated by the `.lz` file-name suffix.
//!
//! Block layout: `[SOH|STX] [seq] [255-seq] [len...] [payload] [checksum]`.
//! SOH blocks carry 128 payload bytes behind a 1-byte length prefix;
//! STX blocks carry 1024 payload bytes behind a 2-byte big-endian
//! prefix. The checksum covers prefix and padded payload, and is
//! CRC-16/XMODEM when the receiver opened with `C`, else an 8-bit sum.

use crate::transport::Transport;
use carvekit_core::utils::md5_hex;
use carvekit_core::FileTransferError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Start of a 128-byte block
pub const SOH: u8 = 0x01;
/// Start of a 1024-byte block
pub const STX: u8 = 0x02;
/// End of transmission
pub const EOT: u8 = 0x04;
/// Block accepted
pub const ACK: u8 = 0x06;
/// Block rejected, resend
pub const NAK: u8 = 0x15;
/// Abort (0x16 rather than 0x18, which the firmware reserves for soft reset)
pub const CAN: u8 = 0x16;
/// Receiver requests CRC-16 mode
pub const CRC_REQ: u8 = b'C';
/// Padding byte for short payloads
pub const PAD: u8 = 0x1a;

const SHORT_PAYLOAD: usize = 128;
const LONG_PAYLOAD: usize = 1024;

const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// Suffix that marks a compressed payload stream
pub const COMPRESSED_SUFFIX: &str = ".lz";

/// Direction of a transfer, reported to progress callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Upload,
    Download,
}

/// Block checksum flavour, negotiated by the receiver's opening byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChecksumMode {
    Crc16,
    Sum8,
}

/// Tuning knobs for one transfer
#[derive(Debug, Clone)]
pub struct XmodemConfig {
    /// Per-block reply timeout
    pub block_timeout: Duration,
    /// Retries per block before giving up
    pub max_retries: u32,
    /// Minimum interval between progress reports
    pub progress_interval: Duration,
    /// Receiver side: open in CRC-16 mode (`C`) rather than 8-bit sum
    pub use_crc: bool,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_secs(10),
            max_retries: 10,
            progress_interval: Duration::from_millis(50),
            use_crc: true,
        }
    }
}

/// Counters accumulated over one transfer
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TransferStats {
    /// Uncompressed content bytes
    pub raw_bytes: u64,
    /// Bytes that actually crossed the wire as block payloads
    pub wire_bytes: u64,
    /// Total block retransmissions
    pub retries: u32,
}

/// A file received from the peer
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    /// Name from the header block (with any `.lz` suffix intact)
    pub name: String,
    /// Decompressed content
    pub content: Vec<u8>,
    /// Transfer counters
    pub stats: TransferStats,
}

/// Progress observer: `(bytes_done, bytes_total, kind)`
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64, TransferKind);

/// One XMODEM endpoint bound to a transport
///
/// The engine exists only for the duration of a single transfer; the
/// cancel flag may be shared with another thread and is honoured at
/// every block boundary.
pub struct Xmodem<'t> {
    transport: &'t mut dyn Transport,
    config: XmodemConfig,
    cancel: Arc<AtomicBool>,
    stats: TransferStats,
    last_report: Option<Instant>,
}

impl<'t> Xmodem<'t> {
    /// Bind the engine to a transport
    pub fn new(transport: &'t mut dyn Transport, config: XmodemConfig) -> Self {
        Self {
            transport,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            stats: TransferStats::default(),
            last_report: None,
        }
    }

    /// Flag that aborts the transfer at the next block boundary
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Use an externally owned cancel flag
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = flag;
    }

    /// Send `content` under `name`
    ///
    /// A `.lz` suffix on the name compresses the payload stream; the
    /// MD5 footer always covers the uncompressed bytes. Blocks until
    /// the receiver acknowledges the MD5 verdict.
    pub fn send(
        &mut self,
        name: &str,
        content: &[u8],
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<TransferStats, FileTransferError> {
        let total = content.len() as u64;
        let digest = md5_hex(content);

        let mut wire = if name.ends_with(COMPRESSED_SUFFIX) {
            lz4_flex::compress_prepend_size(content)
        } else {
            content.to_vec()
        };
        wire.extend_from_slice(digest.as_bytes());
        let wire_total = wire.len() as u64;

        let mode = self.await_handshake()?;
        tracing::debug!(?mode, name, total, "transfer handshake complete");

        // Header block: name NUL decimal-uncompressed-length NUL, padded.
        let mut header = Vec::with_capacity(SHORT_PAYLOAD);
        let length_field = total.to_string();
        let name_room = SHORT_PAYLOAD - length_field.len() - 2;
        let name_bytes = name.as_bytes();
        header.extend_from_slice(&name_bytes[..name_bytes.len().min(name_room)]);
        header.push(0);
        header.extend_from_slice(length_field.as_bytes());
        header.push(0);
        self.send_block(1, SOH, &header, mode)?;
        self.report(&mut progress, 0, total, TransferKind::Upload);

        let mut seq: u8 = 2;
        let mut wire_done: u64 = 0;
        for chunk in wire.chunks(LONG_PAYLOAD) {
            self.send_block(seq, STX, chunk, mode)?;
            seq = seq.wrapping_add(1);
            wire_done += chunk.len() as u64;
            let done = if wire_total == 0 {
                0
            } else {
                (wire_done * total / wire_total).min(total)
            };
            self.report(&mut progress, done, total, TransferKind::Upload);
        }

        // EOT, then the receiver's MD5 verdict.
        let mut attempts = 0;
        loop {
            self.check_cancel()?;
            self.write(&[EOT])?;
            match self.read_byte(self.config.block_timeout)? {
                Some(ACK) => break,
                Some(CAN) => {
                    tracing::warn!("receiver rejected MD5 footer");
                    return Err(FileTransferError::Md5Mismatch {
                        expected: digest,
                        computed: "rejected by receiver".to_string(),
                    });
                }
                other => {
                    tracing::debug!(?other, "unexpected reply to EOT");
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        self.abort()?;
                        return Err(FileTransferError::Timeout {
                            timeout_ms: self.config.block_timeout.as_millis() as u64,
                            block: seq,
                        });
                    }
                }
            }
        }

        self.stats.raw_bytes = total;
        self.force_report(&mut progress, total, total, TransferKind::Upload);
        tracing::info!(name, total, retries = self.stats.retries, "upload complete");
        Ok(self.stats)
    }

    /// Receive one file
    ///
    /// Opens the handshake (CRC or 8-bit sum per the config), collects
    /// blocks, verifies the MD5 footer and acknowledges the verdict.
    pub fn recv(
        &mut self,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<ReceivedFile, FileTransferError> {
        let opener = if self.config.use_crc { CRC_REQ } else { NAK };
        let mode = if self.config.use_crc {
            ChecksumMode::Crc16
        } else {
            ChecksumMode::Sum8
        };

        let mut name = String::new();
        let mut declared_len: u64 = 0;
        let mut wire: Vec<u8> = Vec::new();
        let mut expected_seq: u8 = 1;
        let mut errors = 0;
        let mut cancel_armed = false;
        let mut started = false;

        loop {
            self.check_cancel()?;

            if !started {
                // Keep inviting the sender until the first block lands.
                self.write(&[opener])?;
            }

            let first = match self.read_byte(self.config.block_timeout)? {
                Some(b) => b,
                None => {
                    errors += 1;
                    if errors > self.config.max_retries {
                        self.abort()?;
                        return Err(FileTransferError::Timeout {
                            timeout_ms: self.config.block_timeout.as_millis() as u64,
                            block: expected_seq,
                        });
                    }
                    if started {
                        self.write(&[NAK])?;
                    }
                    continue;
                }
            };

            match first {
                SOH | STX => {
                    started = true;
                    cancel_armed = false;
                    let payload_size = if first == SOH { SHORT_PAYLOAD } else { LONG_PAYLOAD };
                    let prefix_size = if first == SOH { 1 } else { 2 };
                    let checksum_size = if mode == ChecksumMode::Crc16 { 2 } else { 1 };

                    let body = self
                        .read_exact(2 + prefix_size + payload_size + checksum_size)?;
                    let body = match body {
                        Some(b) => b,
                        None => {
                            errors += 1;
                            self.drain();
                            self.write(&[NAK])?;
                            continue;
                        }
                    };

                    let seq = body[0];
                    let seq_inv = body[1];
                    let frame = &body[2..2 + prefix_size + payload_size];
                    let checksum = &body[2 + prefix_size + payload_size..];

                    if seq_inv != 255 - seq || !verify_checksum(mode, frame, checksum) {
                        tracing::debug!(seq, "bad block, NAK");
                        errors += 1;
                        if errors > self.config.max_retries {
                            self.abort()?;
                            return Err(FileTransferError::ChecksumMismatch {
                                block: seq,
                                retries: errors,
                            });
                        }
                        self.drain();
                        self.write(&[NAK])?;
                        continue;
                    }

                    let meaningful = if prefix_size == 1 {
                        frame[0] as usize
                    } else {
                        ((frame[0] as usize) << 8) | frame[1] as usize
                    };
                    if meaningful > payload_size {
                        errors += 1;
                        if errors > self.config.max_retries {
                            self.abort()?;
                            return Err(FileTransferError::ChecksumMismatch {
                                block: seq,
                                retries: errors,
                            });
                        }
                        self.write(&[NAK])?;
                        continue;
                    }
                    let payload = &frame[prefix_size..prefix_size + meaningful];

                    if seq == expected_seq {
                        if expected_seq == 1 {
                            let (n, len) = parse_header(payload);
                            name = n;
                            declared_len = len;
                        } else {
                            wire.extend_from_slice(payload);
                            self.stats.wire_bytes += payload.len() as u64;
                        }
                        expected_seq = expected_seq.wrapping_add(1);
                        errors = 0;
                        self.write(&[ACK])?;
                        let done = (wire.len() as u64).min(declared_len);
                        self.report(&mut progress, done, declared_len, TransferKind::Download);
                    } else if seq == expected_seq.wrapping_sub(1) {
                        // Duplicate of the last block: our ACK was lost.
                        self.write(&[ACK])?;
                    } else {
                        tracing::warn!(seq, expected_seq, "block out of sequence");
                        errors += 1;
                        self.write(&[NAK])?;
                    }
                }
                EOT => {
                    let (content, verdict) = finish_stream(&name, &mut wire);
                    return match verdict {
                        Ok(()) => {
                            self.write(&[ACK])?;
                            self.stats.raw_bytes = content.len() as u64;
                            self.force_report(
                                &mut progress,
                                declared_len,
                                declared_len,
                                TransferKind::Download,
                            );
                            tracing::info!(
                                name,
                                bytes = content.len(),
                                "download complete"
                            );
                            Ok(ReceivedFile {
                                name,
                                content,
                                stats: self.stats,
                            })
                        }
                        Err(e) => {
                            self.write(&[CAN])?;
                            Err(e)
                        }
                    };
                }
                CAN => {
                    if cancel_armed {
                        tracing::info!("transfer cancelled by peer (2xCAN)");
                        return Err(FileTransferError::PeerCancelled);
                    }
                    cancel_armed = true;
                }
                other => {
                    tracing::debug!(byte = other, "ignoring stray byte before block");
                }
            }
        }
    }

    /// Wait for the receiver's opening byte
    fn await_handshake(&mut self) -> Result<ChecksumMode, FileTransferError> {
        let mut errors = 0;
        let mut cancel_armed = false;
        loop {
            self.check_cancel()?;
            match self.read_byte(self.config.block_timeout)? {
                Some(CRC_REQ) => return Ok(ChecksumMode::Crc16),
                Some(NAK) => return Ok(ChecksumMode::Sum8),
                Some(CAN) => {
                    if cancel_armed {
                        return Err(FileTransferError::PeerCancelled);
                    }
                    cancel_armed = true;
                }
                other => {
                    tracing::debug!(?other, "handshake: expected C/NAK");
                    errors += 1;
                    if errors > self.config.max_retries {
                        self.abort()?;
                        return Err(FileTransferError::Timeout {
                            timeout_ms: self.config.block_timeout.as_millis() as u64,
                            block: 0,
                        });
                    }
                }
            }
        }
    }

    /// Transmit one block and wait for its ACK
    fn send_block(
        &mut self,
        seq: u8,
        kind: u8,
        data: &[u8],
        mode: ChecksumMode,
    ) -> Result<(), FileTransferError> {
        let payload_size = if kind == SOH { SHORT_PAYLOAD } else { LONG_PAYLOAD };
        debug_assert!(data.len() <= payload_size);

        let mut frame = Vec::with_capacity(payload_size + 2);
        if kind == SOH {
            frame.push(data.len() as u8);
        } else {
            frame.push((data.len() >> 8) as u8);
            frame.push((data.len() & 0xff) as u8);
        }
        frame.extend_from_slice(data);
        frame.resize(frame.len() + (payload_size - data.len()), PAD);

        let mut block = Vec::with_capacity(frame.len() + 5);
        block.push(kind);
        block.push(seq);
        block.push(255 - seq);
        block.extend_from_slice(&frame);
        match mode {
            ChecksumMode::Crc16 => {
                let crc = CRC16.checksum(&frame);
                block.push((crc >> 8) as u8);
                block.push((crc & 0xff) as u8);
            }
            ChecksumMode::Sum8 => {
                block.push(sum8(&frame));
            }
        }

        let mut naks = 0;
        let mut cancel_armed = false;
        let mut attempts = 0;
        loop {
            self.check_cancel()?;
            self.write(&block)?;
            self.stats.wire_bytes += data.len() as u64;

            // Wait out garbage and single CANs without resending.
            let reply = loop {
                match self.read_byte(self.config.block_timeout)? {
                    Some(ACK) => break Some(ACK),
                    Some(NAK) => break Some(NAK),
                    Some(CAN) => {
                        if cancel_armed {
                            tracing::info!("transfer cancelled by peer (2xCAN)");
                            return Err(FileTransferError::PeerCancelled);
                        }
                        cancel_armed = true;
                    }
                    Some(other) => {
                        tracing::debug!(byte = other, seq, "unexpected reply to block");
                        break None;
                    }
                    None => break None,
                }
            };

            match reply {
                Some(ACK) => return Ok(()),
                Some(NAK) => {
                    naks += 1;
                    self.stats.retries += 1;
                }
                _ => {}
            }

            attempts += 1;
            if attempts > self.config.max_retries {
                self.abort()?;
                return if naks > 0 {
                    Err(FileTransferError::ChecksumMismatch {
                        block: seq,
                        retries: naks,
                    })
                } else {
                    Err(FileTransferError::Timeout {
                        timeout_ms: self.config.block_timeout.as_millis() as u64,
                        block: seq,
                    })
                };
            }
        }
    }

    fn check_cancel(&mut self) -> Result<(), FileTransferError> {
        if self.cancel.load(Ordering::Relaxed) {
            tracing::info!("transfer cancelled locally");
            self.abort()?;
            return Err(FileTransferError::LocalCancelled);
        }
        Ok(())
    }

    /// Send the two-CAN abort sequence and drain the line
    fn abort(&mut self) -> Result<(), FileTransferError> {
        self.write(&[CAN, CAN])?;
        self.drain();
        Ok(())
    }

    fn drain(&mut self) {
        while let Ok(bytes) = self
            .transport
            .read_available(256, Duration::from_millis(50))
        {
            if bytes.is_empty() {
                break;
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), FileTransferError> {
        self.transport
            .write_all(data, self.config.block_timeout)
            .map_err(FileTransferError::Transport)
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, FileTransferError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let bytes = self
                .transport
                .read_available(1, remaining.min(Duration::from_millis(100)))
                .map_err(FileTransferError::Transport)?;
            if let Some(&b) = bytes.first() {
                return Ok(Some(b));
            }
        }
    }

    /// Read exactly `n` bytes within the block timeout, or `None`
    fn read_exact(&mut self, n: usize) -> Result<Option<Vec<u8>>, FileTransferError> {
        let deadline = Instant::now() + self.config.block_timeout;
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let bytes = self
                .transport
                .read_available(n - out.len(), remaining.min(Duration::from_millis(100)))
                .map_err(FileTransferError::Transport)?;
            out.extend_from_slice(&bytes);
        }
        Ok(Some(out))
    }

    /// Throttled progress report
    fn report(
        &mut self,
        progress: &mut Option<ProgressFn<'_>>,
        done: u64,
        total: u64,
        kind: TransferKind,
    ) {
        if let Some(cb) = progress {
            let due = match self.last_report {
                Some(at) => at.elapsed() >= self.config.progress_interval,
                None => true,
            };
            if due {
                cb(done, total, kind);
                self.last_report = Some(Instant::now());
            }
        }
    }

    /// Unthrottled final progress report
    fn force_report(
        &mut self,
        progress: &mut Option<ProgressFn<'_>>,
        done: u64,
        total: u64,
        kind: TransferKind,
    ) {
        if let Some(cb) = progress {
            cb(done, total, kind);
            self.last_report = Some(Instant::now());
        }
    }
}

/// Strip the MD5 footer, decompress if the name asks for it, verify
fn finish_stream(name: &str, wire: &mut Vec<u8>) -> (Vec<u8>, Result<(), FileTransferError>) {
    if wire.len() < 32 {
        return (
            Vec::new(),
            Err(FileTransferError::Md5Mismatch {
                expected: String::new(),
                computed: "stream shorter than MD5 footer".to_string(),
            }),
        );
    }
    let digest_bytes = wire.split_off(wire.len() - 32);
    let expected = String::from_utf8_lossy(&digest_bytes).to_string();

    let content = if name.ends_with(COMPRESSED_SUFFIX) {
        match lz4_flex::decompress_size_prepended(wire) {
            Ok(c) => c,
            Err(e) => {
                return (
                    Vec::new(),
                    Err(FileTransferError::Md5Mismatch {
                        expected,
                        computed: format!("decompression failed: {}", e),
                    }),
                )
            }
        }
    } else {
        std::mem::take(wire)
    };

    let computed = md5_hex(&content);
    if computed == expected {
        (content, Ok(()))
    } else {
        (
            Vec::new(),
            Err(FileTransferError::Md5Mismatch { expected, computed }),
        )
    }
}

/// Parse the header block payload: `name NUL decimal-length NUL ...`
fn parse_header(payload: &[u8]) -> (String, u64) {
    let mut parts = payload.split(|&b| b == 0);
    let name = parts
        .next()
        .map(|b| String::from_utf8_lossy(b).to_string())
        .unwrap_or_default();
    let len = parts
        .next()
        .and_then(|b| std::str::from_utf8(b).ok())
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    (name, len)
}

fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn verify_checksum(mode: ChecksumMode, frame: &[u8], checksum: &[u8]) -> bool {
    match mode {
        ChecksumMode::Crc16 => {
            if checksum.len() != 2 {
                return false;
            }
            let theirs = ((checksum[0] as u16) << 8) | checksum[1] as u16;
            CRC16.checksum(frame) == theirs
        }
        ChecksumMode::Sum8 => checksum.len() == 1 && sum8(frame) == checksum[0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_reference_vector() {
        // CRC-16/XMODEM of "123456789" is 0x31C3.
        assert_eq!(CRC16.checksum(b"123456789"), 0x31c3);
    }

    #[test]
    fn sum8_wraps() {
        assert_eq!(sum8(&[0xff, 0x02]), 0x01);
    }

    #[test]
    fn header_roundtrip() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"job.nc");
        payload.push(0);
        payload.extend_from_slice(b"12345");
        payload.push(0);
        payload.resize(128, PAD);
        let (name, len) = parse_header(&payload);
        assert_eq!(name, "job.nc");
        assert_eq!(len, 12345);
    }
}
