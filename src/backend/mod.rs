//! The platform backend contract: a narrow interface that lets three
//! concrete I/O mechanisms coexist behind one worker loop.
//!
//! Backend selection is a `Box<dyn Backend>` trait object, dispatched
//! once per burst — negligible next to the syscalls each backend makes.

#[cfg(feature = "backend-filter")]
pub mod filter_device;
#[cfg(feature = "backend-mmap")]
pub mod mmap_ring;
#[cfg(feature = "backend-xdp")]
pub mod xdp;

pub mod mock;

use crate::config::{BackendKind, Config};
use crate::error::InitError;

/// A worker-local, temporarily-owned reference to one frame in the
/// backend's buffer pool.
///
/// Between `recv_batch` returning a `Descriptor` and either `send_batch`
/// or `release_batch` consuming it, the worker has exclusive access to
/// the bytes it points at — the backend must not touch them.
pub struct Descriptor {
    /// Backend-defined identifier needed to return ownership (a ring
    /// slot index, a umem frame address, ...).
    pub buffer_id: u64,
    data: *mut u8,
    len: usize,
    /// Monotonic receive timestamp, only populated when
    /// `cfg.measure_latency` is set.
    pub timestamp_ns: Option<u64>,
}

// Descriptors are handed from one backend to exactly one worker thread
// and never touched concurrently; the backend that produced it upholds
// that invariant. Safe to move across the single worker thread that
// owns the burst.
unsafe impl Send for Descriptor {}

impl Descriptor {
    /// # Safety
    /// `data` must point to `len` bytes that are valid for reads and
    /// writes for as long as this descriptor is alive, and no other
    /// reference to that range may exist concurrently.
    pub unsafe fn new(buffer_id: u64, data: *mut u8, len: usize, timestamp_ns: Option<u64>) -> Self {
        Descriptor {
            buffer_id,
            data,
            len,
            timestamp_ns,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        // Safety: see `new`'s contract, upheld by every backend.
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // Safety: see `new`'s contract.
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Per-worker context created by `init` and consumed by `cleanup`. Each
/// concrete backend defines its own; the worker loop only ever holds it
/// behind the `Backend` trait object.
pub trait BackendContext: Send {}

/// The contract every backend implements. A `Box<dyn Backend>` is
/// created once per worker by `Backend::init` and lives for the
/// worker's lifetime.
pub trait Backend: Send {
    /// Non-blocking. Returns `0..=out.len()` descriptors now owned by
    /// the caller. Must not allocate. May wake the kernel once if the
    /// fill ring needs replenishing.
    fn recv_batch(&mut self, out: &mut Vec<Descriptor>, max: usize) -> usize;

    /// Enqueues up to `pkts.len()` descriptors for transmission. Returns
    /// how many were accepted; `pkts[accepted..]` remain owned by the
    /// caller. Must not block.
    fn send_batch(&mut self, pkts: &mut Vec<Descriptor>) -> usize;

    /// Returns ownership of `pkts` to the backend (the fill ring for
    /// zero-copy backends, a no-op for copy-in backends). After this
    /// call the caller must not touch them again.
    fn release_batch(&mut self, pkts: Vec<Descriptor>);

    /// Tears down sockets/rings/the buffer pool. Safe to call in any
    /// internal state.
    fn cleanup(&mut self);

    fn kind(&self) -> BackendKind;
}

/// Attempts each backend in precedence order, returning the first that
/// initializes successfully along with the kind selected, or every
/// error encountered if all fail.
pub fn init_with_fallback(
    cfg: &Config,
    worker_index: usize,
) -> Result<Box<dyn Backend>, Vec<(BackendKind, InitError)>> {
    let mut errors = Vec::new();
    for kind in BackendKind::PRECEDENCE {
        match init_backend(kind, cfg, worker_index) {
            Ok(backend) => {
                if worker_index == 0 && !errors.is_empty() {
                    tracing::warn!(
                        selected = ?kind,
                        attempted_and_failed = ?errors.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
                        "preferred backend(s) unavailable, falling back; expect reduced throughput"
                    );
                }
                return Ok(backend);
            }
            Err(e) => errors.push((kind, e)),
        }
    }
    Err(errors)
}

/// Initializes one specific backend kind, used once fallback has picked
/// a kind on worker 0 and propagated it to workers 1..N-1.
pub fn init_backend(
    kind: BackendKind,
    cfg: &Config,
    worker_index: usize,
) -> Result<Box<dyn Backend>, InitError> {
    match kind {
        #[cfg(feature = "backend-xdp")]
        BackendKind::ZeroCopy => xdp::XdpBackend::init(cfg, worker_index).map(|b| Box::new(b) as _),
        #[cfg(not(feature = "backend-xdp"))]
        BackendKind::ZeroCopy => Err(InitError::RingCreationFailed(
            "backend-xdp feature disabled".into(),
        )),

        #[cfg(feature = "backend-mmap")]
        BackendKind::MmapRing => {
            mmap_ring::MmapRingBackend::init(cfg, worker_index).map(|b| Box::new(b) as _)
        }
        #[cfg(not(feature = "backend-mmap"))]
        BackendKind::MmapRing => Err(InitError::RingCreationFailed(
            "backend-mmap feature disabled".into(),
        )),

        #[cfg(feature = "backend-filter")]
        BackendKind::FilterDevice => {
            filter_device::FilterDeviceBackend::init(cfg, worker_index).map(|b| Box::new(b) as _)
        }
        #[cfg(not(feature = "backend-filter"))]
        BackendKind::FilterDevice => Err(InitError::RingCreationFailed(
            "backend-filter feature disabled".into(),
        )),
    }
}
