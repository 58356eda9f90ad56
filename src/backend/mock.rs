//! An in-memory mock backend used by the worker-loop and ownership-
//! discipline tests. Not compiled into production builds.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{Backend, Descriptor};
use crate::config::BackendKind;

/// A frame owned by the mock pool. Kept in a `Box` so its address is
/// stable for the lifetime of the backend (descriptors point into it).
struct Frame {
    bytes: Box<[u8]>,
}

/// Records which buffer ids have been consumed exactly once per burst,
/// so tests can assert the ownership discipline the worker loop depends on.
#[derive(Default)]
pub struct OwnershipLog {
    pub sent: Vec<u64>,
    pub released: Vec<u64>,
}

pub struct MockBackend {
    frames: Vec<Frame>,
    /// Frames queued to be handed out by the next `recv_batch` call,
    /// pre-loaded by a test via `push_rx`.
    rx_queue: VecDeque<(usize, Option<u64>)>,
    pub tx_log: Arc<Mutex<Vec<Vec<u8>>>>,
    pub ownership: Arc<Mutex<OwnershipLog>>,
    /// When set, `send_batch` accepts only this many descriptors per
    /// call, exercising the "ring full" / `err_tx_failed` path.
    pub send_capacity: Option<usize>,
    fail_recv: bool,
}

impl MockBackend {
    pub fn new(frame_size: usize, frame_count: usize) -> Self {
        let frames = (0..frame_count)
            .map(|_| Frame {
                bytes: vec![0u8; frame_size].into_boxed_slice(),
            })
            .collect();
        MockBackend {
            frames,
            rx_queue: VecDeque::new(),
            tx_log: Arc::new(Mutex::new(Vec::new())),
            ownership: Arc::new(Mutex::new(OwnershipLog::default())),
            send_capacity: None,
            fail_recv: false,
        }
    }

    /// Loads `data` into frame `idx` and queues it to be returned by the
    /// next `recv_batch`.
    pub fn push_rx(&mut self, idx: usize, data: &[u8], timestamp_ns: Option<u64>) {
        self.frames[idx].bytes[..data.len()].copy_from_slice(data);
        self.rx_queue.push_back((idx, timestamp_ns));
    }

    pub fn set_fail_recv(&mut self, fail: bool) {
        self.fail_recv = fail;
    }

    /// Clones of the shared logs, kept alive after `self` is boxed and
    /// moved into a worker thread so a test can still inspect them.
    pub fn observer(&self) -> MockObserver {
        MockObserver {
            tx_log: Arc::clone(&self.tx_log),
            ownership: Arc::clone(&self.ownership),
        }
    }
}

/// A handle onto a [`MockBackend`]'s logs that outlives the backend once
/// it has been moved into a worker thread via `Box<dyn Backend>`.
pub struct MockObserver {
    tx_log: Arc<Mutex<Vec<Vec<u8>>>>,
    ownership: Arc<Mutex<OwnershipLog>>,
}

impl MockObserver {
    pub fn tx_count(&self) -> usize {
        self.tx_log.lock().unwrap().len()
    }

    pub fn tx_frames(&self) -> Vec<Vec<u8>> {
        self.tx_log.lock().unwrap().clone()
    }

    pub fn sent_ids(&self) -> Vec<u64> {
        self.ownership.lock().unwrap().sent.clone()
    }

    pub fn released_ids(&self) -> Vec<u64> {
        self.ownership.lock().unwrap().released.clone()
    }
}

impl Backend for MockBackend {
    fn recv_batch(&mut self, out: &mut Vec<Descriptor>, max: usize) -> usize {
        if self.fail_recv {
            return 0;
        }
        let mut n = 0;
        while n < max {
            let Some((idx, ts)) = self.rx_queue.pop_front() else {
                break;
            };
            let frame = &mut self.frames[idx];
            let ptr = frame.bytes.as_mut_ptr();
            let len = frame.bytes.len();
            // Safety: `frame` outlives the descriptor (owned by `self`,
            // which the worker loop keeps alive across the burst), and
            // the mock hands out each index at most once before it is
            // consumed by send/release.
            out.push(unsafe { Descriptor::new(idx as u64, ptr, len, ts) });
            n += 1;
        }
        n
    }

    fn send_batch(&mut self, pkts: &mut Vec<Descriptor>) -> usize {
        let cap = self.send_capacity.unwrap_or(pkts.len());
        let accepted = cap.min(pkts.len());
        let mut log = self.tx_log.lock().unwrap();
        let mut ownership = self.ownership.lock().unwrap();
        for d in pkts.drain(..accepted) {
            log.push(d.bytes().to_vec());
            ownership.sent.push(d.buffer_id);
        }
        accepted
    }

    fn release_batch(&mut self, pkts: Vec<Descriptor>) {
        let mut ownership = self.ownership.lock().unwrap();
        for d in pkts {
            ownership.released.push(d.buffer_id);
        }
    }

    fn cleanup(&mut self) {}

    fn kind(&self) -> BackendKind {
        BackendKind::ZeroCopy
    }
}
