//! In-memory duplex transport used as the mock wire in tests

use carvekit_communication::Transport;
use carvekit_core::TransportError;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Channel {
    data: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

impl Channel {
    fn push(&self, bytes: &[u8]) {
        let mut data = self.data.lock().unwrap();
        data.extend(bytes.iter().copied());
        self.ready.notify_all();
    }

    fn pop(&self, max: usize, deadline: Duration) -> Vec<u8> {
        let mut data = self.data.lock().unwrap();
        if data.is_empty() {
            let (guard, _timeout) = self
                .ready
                .wait_timeout_while(data, deadline, |d| d.is_empty())
                .unwrap();
            data = guard;
        }
        let n = data.len().min(max);
        data.drain(..n).collect()
    }

    fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

/// One endpoint of an in-memory duplex byte pipe
pub struct PipeTransport {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
    open: bool,
}

impl PipeTransport {
    /// Connected pair: what one end writes, the other reads
    pub fn pair() -> (PipeTransport, PipeTransport) {
        let a = Arc::new(Channel::default());
        let b = Arc::new(Channel::default());
        (
            PipeTransport {
                rx: a.clone(),
                tx: b.clone(),
                open: true,
            },
            PipeTransport {
                rx: b,
                tx: a,
                open: true,
            },
        )
    }

    /// Bytes queued toward this endpoint but not yet read
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Transport for PipeTransport {
    fn read_available(
        &mut self,
        max_bytes: usize,
        deadline: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        Ok(self.rx.pop(max_bytes, deadline))
    }

    fn write_all(&mut self, data: &[u8], _deadline: Duration) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.tx.push(data);
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Wrapper that flips one payload byte in every Nth sufficiently large
/// write, to exercise the block retry path
pub struct CorruptingTransport {
    inner: PipeTransport,
    every: usize,
    counter: usize,
}

impl CorruptingTransport {
    pub fn new(inner: PipeTransport, every: usize) -> Self {
        Self {
            inner,
            every,
            counter: 0,
        }
    }
}

impl Transport for CorruptingTransport {
    fn read_available(
        &mut self,
        max_bytes: usize,
        deadline: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.inner.read_available(max_bytes, deadline)
    }

    fn write_all(&mut self, data: &[u8], deadline: Duration) -> Result<(), TransportError> {
        // Only blocks are large; leave control bytes alone.
        if data.len() > 64 {
            self.counter += 1;
            if self.counter % self.every == 0 {
                let mut corrupted = data.to_vec();
                let mid = corrupted.len() / 2;
                corrupted[mid] ^= 0xff;
                return self.inner.write_all(&corrupted, deadline);
            }
        }
        self.inner.write_all(data, deadline)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.inner.set_timeout(timeout)
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}
