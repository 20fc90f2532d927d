//! File-transfer engine tests over an in-memory wire

mod common;

use carvekit_communication::{Transport, TransferKind, Xmodem, XmodemConfig};
use carvekit_core::FileTransferError;
use common::{CorruptingTransport, PipeTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> XmodemConfig {
    XmodemConfig {
        block_timeout: Duration::from_millis(500),
        max_retries: 10,
        progress_interval: Duration::from_millis(50),
        use_crc: true,
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Run a send on the main thread against a recv on a helper thread.
fn roundtrip(
    name: &str,
    content: Vec<u8>,
    host: Box<dyn Transport>,
    machine: Box<dyn Transport>,
) -> (
    Result<carvekit_communication::TransferStats, FileTransferError>,
    Result<carvekit_communication::ReceivedFile, FileTransferError>,
) {
    let receiver = std::thread::spawn(move || {
        let mut machine = machine;
        let mut modem = Xmodem::new(machine.as_mut(), test_config());
        modem.recv(None)
    });

    let mut host = host;
    let mut modem = Xmodem::new(host.as_mut(), test_config());
    let sent = modem.send(name, &content, None);
    let received = receiver.join().expect("receiver thread panicked");
    (sent, received)
}

#[test]
fn roundtrip_small_file() {
    let (host, machine) = PipeTransport::pair();
    let content = b"G21\nG90\nG1 X10 F1000\n".to_vec();
    let (sent, received) = roundtrip("job.nc", content.clone(), Box::new(host), Box::new(machine));

    let stats = sent.expect("send failed");
    let file = received.expect("receive failed");
    assert_eq!(file.name, "job.nc");
    assert_eq!(file.content, content);
    assert_eq!(stats.raw_bytes, content.len() as u64);
    assert_eq!(stats.retries, 0);
}

#[test]
fn roundtrip_multi_block_file() {
    let (host, machine) = PipeTransport::pair();
    // Spans several 1K blocks with a partial tail.
    let content = patterned(10_000);
    let (sent, received) = roundtrip("big.nc", content.clone(), Box::new(host), Box::new(machine));

    sent.expect("send failed");
    let file = received.expect("receive failed");
    assert_eq!(file.content, content);
}

#[test]
fn roundtrip_empty_file() {
    let (host, machine) = PipeTransport::pair();
    let (sent, received) = roundtrip("empty.nc", Vec::new(), Box::new(host), Box::new(machine));
    sent.expect("send failed");
    let file = received.expect("receive failed");
    assert!(file.content.is_empty());
}

#[test]
fn roundtrip_compressed_by_suffix() {
    let (host, machine) = PipeTransport::pair();
    // Highly compressible payload.
    let content = vec![b'G'; 50_000];
    let (sent, received) = roundtrip("job.nc.lz", content.clone(), Box::new(host), Box::new(machine));

    let stats = sent.expect("send failed");
    let file = received.expect("receive failed");
    assert_eq!(file.content, content);
    assert_eq!(file.name, "job.nc.lz");
    // The wire saw far fewer payload bytes than the raw content.
    assert!(stats.wire_bytes < content.len() as u64 / 2);
}

#[test]
fn roundtrip_survives_injected_corruption() {
    let (host, machine) = PipeTransport::pair();
    // Roughly every 10th block write is corrupted; the receiver NAKs
    // and the retransmission carries the block through.
    let host = CorruptingTransport::new(host, 10);
    let content = patterned(64 * 1024);
    let (sent, received) = roundtrip(
        "noisy.nc",
        content.clone(),
        Box::new(host),
        Box::new(machine),
    );

    let stats = sent.expect("send failed despite retries");
    let file = received.expect("receive failed despite retries");
    assert_eq!(file.content, content);
    assert!(stats.retries > 0, "corruption should have forced resends");
}

#[test]
fn progress_reports_are_monotonic_and_complete() {
    let (host, machine) = PipeTransport::pair();
    let content = patterned(8192);
    let total = content.len() as u64;

    let receiver = std::thread::spawn(move || {
        let mut machine: Box<dyn Transport> = Box::new(machine);
        let mut modem = Xmodem::new(machine.as_mut(), test_config());
        modem.recv(None)
    });

    let mut reports: Vec<(u64, u64)> = Vec::new();
    {
        let mut host: Box<dyn Transport> = Box::new(host);
        let mut modem = Xmodem::new(host.as_mut(), test_config());
        let mut cb = |done: u64, total: u64, kind: TransferKind| {
            assert_eq!(kind, TransferKind::Upload);
            reports.push((done, total));
        };
        modem.send("job.nc", &content, Some(&mut cb)).expect("send");
    }
    receiver.join().unwrap().expect("receive");

    assert!(!reports.is_empty());
    for pair in reports.windows(2) {
        assert!(pair[1].0 >= pair[0].0);
    }
    let last = reports.last().unwrap();
    assert_eq!(*last, (total, total));
}

#[test]
fn local_cancel_sends_two_cans_and_stops() {
    let (host, machine) = PipeTransport::pair();
    let content = patterned(500 * 1024);
    let cancel = Arc::new(AtomicBool::new(false));

    let cancel_for_receiver = cancel.clone();
    let receiver = std::thread::spawn(move || {
        let mut machine: Box<dyn Transport> = Box::new(machine);
        // Unthrottled progress so the cancel lands right after block 2.
        let mut cfg = test_config();
        cfg.progress_interval = Duration::ZERO;
        let mut modem = Xmodem::new(machine.as_mut(), cfg);
        let mut data_blocks = 0u32;
        let mut cb = |done: u64, _total: u64, _kind: TransferKind| {
            if done > 0 {
                data_blocks += 1;
            }
            if data_blocks >= 2 {
                cancel_for_receiver.store(true, Ordering::Relaxed);
            }
        };
        modem.recv(Some(&mut cb))
    });

    let mut host: Box<dyn Transport> = Box::new(host);
    let mut modem = Xmodem::new(host.as_mut(), test_config());
    modem.set_cancel_flag(cancel);
    let err = modem.send("big.nc", &content, None).unwrap_err();
    assert!(matches!(err, FileTransferError::LocalCancelled));
    assert!(!err.is_retryable());

    let outcome = receiver.join().unwrap();
    assert!(matches!(outcome, Err(FileTransferError::PeerCancelled)));

    // Nothing follows the two-CAN abort sequence on the wire.
    std::thread::sleep(Duration::from_millis(100));
    let mut host = host;
    assert_eq!(
        host.read_available(64, Duration::from_millis(50))
            .map(|b| b.len())
            .unwrap_or(0),
        0
    );
}

#[test]
fn md5_mismatch_is_reported_to_the_sender() {
    // A transport that corrupts *every* large write would never get a
    // block through; instead corrupt nothing and tamper with the footer
    // by corrupting only the final block (the one carrying the digest).
    struct FooterTamper {
        inner: PipeTransport,
        blocks: usize,
        total_blocks: usize,
    }
    impl Transport for FooterTamper {
        fn read_available(
            &mut self,
            max: usize,
            deadline: Duration,
        ) -> Result<Vec<u8>, carvekit_core::TransportError> {
            self.inner.read_available(max, deadline)
        }
        fn write_all(
            &mut self,
            data: &[u8],
            deadline: Duration,
        ) -> Result<(), carvekit_core::TransportError> {
            if data.len() > 64 {
                self.blocks += 1;
                if self.blocks == self.total_blocks {
                    // Flip the last meaningful payload byte (a digest
                    // character) and recompute the CRC so the block
                    // itself still verifies.
                    let mut copy = data.to_vec();
                    let payload_end = copy.len() - 2;
                    let meaningful = ((copy[3] as usize) << 8) | copy[4] as usize;
                    copy[5 + meaningful - 1] ^= 0x01;
                    let crc = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM)
                        .checksum(&copy[3..payload_end]);
                    copy[payload_end] = (crc >> 8) as u8;
                    copy[payload_end + 1] = (crc & 0xff) as u8;
                    return self.inner.write_all(&copy, deadline);
                }
            }
            self.inner.write_all(data, deadline)
        }
        fn set_timeout(
            &mut self,
            t: Duration,
        ) -> Result<(), carvekit_core::TransportError> {
            self.inner.set_timeout(t)
        }
        fn close(&mut self) {
            self.inner.close()
        }
        fn is_open(&self) -> bool {
            self.inner.is_open()
        }
    }

    let (host, machine) = PipeTransport::pair();
    let content = patterned(100);
    // header + single data block
    let host = FooterTamper {
        inner: host,
        blocks: 0,
        total_blocks: 2,
    };

    let (sent, received) = roundtrip("f.nc", content, Box::new(host), Box::new(machine));
    assert!(matches!(sent, Err(FileTransferError::Md5Mismatch { .. })));
    assert!(matches!(
        received,
        Err(FileTransferError::Md5Mismatch { .. })
    ));
}

#[test]
fn checksum_mode_fallback_roundtrip() {
    let (host, machine) = PipeTransport::pair();
    let content = patterned(3000);
    let mut cfg = test_config();
    cfg.use_crc = false;

    let receiver_cfg = cfg.clone();
    let receiver = std::thread::spawn(move || {
        let mut machine: Box<dyn Transport> = Box::new(machine);
        let mut modem = Xmodem::new(machine.as_mut(), receiver_cfg);
        modem.recv(None)
    });

    let mut host: Box<dyn Transport> = Box::new(host);
    let mut modem = Xmodem::new(host.as_mut(), cfg);
    modem.send("sum8.nc", &content, None).expect("send");
    let file = receiver.join().unwrap().expect("receive");
    assert_eq!(file.content, content);
}
