//! Backend A — zero-copy AF_XDP.
//!
//! A shared `Umem` buffer region plus four lock-free rings (fill,
//! completion, RX, TX) exchange frame ownership with the kernel without
//! copying packet bytes. Built on `xdpilone`, the same reader/writer
//! cursor style the crate's own examples use for its completion/transmit
//! rings.

use std::num::NonZeroU32;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use xdpilone::xdp::XdpDesc;
use xdpilone::{BufIdx, DeviceQueue, IfInfo, RingRx, RingTx, Socket, SocketConfig, Umem, UmemConfig};

use super::{Backend, Descriptor};
use crate::config::{BackendKind, Config};
use crate::error::InitError;

/// How low the fill ring can get (as a fraction of the pool) before
/// `recv_batch` proactively reaps the completion ring, rather than
/// waiting for it to run dry — frames sent but not yet reclaimed would
/// otherwise starve the fill ring during a sustained transmit burst.
const FILL_LOW_WATERMARK_NUM: usize = 1;
const FILL_LOW_WATERMARK_DEN: usize = 4;

/// Capability shared across workers when a kernel-side filter program is
/// attached. Opened once by worker 0; `None` means no program is
/// attached and userspace performs all filtering, which the backend
/// must (and does) work correctly without.
pub struct SharedFilterProgram {
    attached: AtomicBool,
}

impl SharedFilterProgram {
    pub fn new() -> Arc<Self> {
        Arc::new(SharedFilterProgram {
            attached: AtomicBool::new(false),
        })
    }

    fn mark_attached(&self) {
        self.attached.store(true, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

pub struct XdpBackend {
    /// Raw base of `_umem_storage`, captured before the region was
    /// handed to `Umem::new`, so ring addresses (byte offsets into the
    /// umem) can be turned back into pointers without relying on a
    /// lookup method the ring types don't expose.
    umem_base: *mut u8,
    umem: Umem,
    fill_completion: DeviceQueue,
    rx: RingRx,
    tx: RingTx,
    frame_size: usize,
    frame_count: usize,
    shared_filter: Option<Arc<SharedFilterProgram>>,
    pending_completions: u32,
    measure_latency: bool,
    /// Declared last so it drops last: `umem`/`rx`/`tx` reference this
    /// region for as long as they're registered with the kernel, and
    /// Rust drops struct fields in declaration order.
    _umem_storage: Box<[u8]>,
}

impl XdpBackend {
    pub fn init(cfg: &Config, worker_index: usize) -> Result<XdpBackend, InitError> {
        let total_bytes = cfg
            .frame_size
            .checked_mul(cfg.frame_count)
            .ok_or(InitError::PoolAllocationFailed {
                frame_count: cfg.frame_count,
                frame_size: cfg.frame_size,
            })?;

        // A boxed, page-aligned-enough region serves as the umem backing
        // store; `xdpilone::Umem` accepts any stable mapping.
        let mut storage = vec![0u8; total_bytes].into_boxed_slice();
        let umem_base = storage.as_mut_ptr();
        let mem = NonNull::new(storage.as_mut() as *mut [u8]).ok_or(InitError::PoolAllocationFailed {
            frame_count: cfg.frame_count,
            frame_size: cfg.frame_size,
        })?;

        let umem_config = UmemConfig {
            frame_size: cfg.frame_size as u32,
            ..UmemConfig::default()
        };

        // Safety: `mem` points at `storage`, which this struct keeps
        // alive for as long as the `Umem` (and hence its rings) exist.
        let umem = unsafe { Umem::new(umem_config, mem) }
            .map_err(|e| InitError::RingCreationFailed(format!("umem: {e}")))?;

        let info = IfInfo::from_name(cfg.ifname.as_str())
            .map_err(|_| InitError::InterfaceNotFound(cfg.ifname.clone()))?;

        let socket = if worker_index == 0 {
            Socket::with_shared(&info, &umem)
        } else {
            Socket::new(&info)
        }
        .map_err(|e| InitError::RingCreationFailed(format!("socket: {e}")))?;

        let fill_completion = umem
            .fq_cq(&socket)
            .map_err(|e| InitError::RingCreationFailed(format!("fill/completion: {e}")))?;

        let rxtx_config = SocketConfig {
            rx_size: NonZeroU32::new(cfg.frame_count as u32),
            tx_size: NonZeroU32::new(cfg.frame_count as u32),
            bind_flags: 0,
        };
        let rxtx = umem
            .rx_tx(&socket, &rxtx_config)
            .map_err(|e| InitError::RingCreationFailed(format!("rx/tx: {e}")))?;

        if worker_index == 0 {
            umem.bind(&rxtx)
                .map_err(|e| InitError::RingCreationFailed(format!("bind: {e}")))?;
        } else {
            fill_completion
                .bind(&rxtx)
                .map_err(|e| InitError::RingCreationFailed(format!("bind: {e}")))?;
        }

        let rx = rxtx
            .map_rx()
            .map_err(|e| InitError::RingCreationFailed(format!("map_rx: {e}")))?;
        let tx = rxtx
            .map_tx()
            .map_err(|e| InitError::RingCreationFailed(format!("map_tx: {e}")))?;

        let mut backend = XdpBackend {
            _umem_storage: storage,
            umem_base,
            umem,
            fill_completion,
            rx,
            tx,
            frame_size: cfg.frame_size,
            frame_count: cfg.frame_count,
            shared_filter: None,
            pending_completions: 0,
            measure_latency: cfg.measure_latency,
        };
        backend.populate_fill_ring(cfg.frame_count as u32);
        Ok(backend)
    }

    /// Attaches the optional shared in-kernel filter program. Safe to
    /// skip entirely — without it, every packet arrives and the
    /// classifier filters in userspace.
    pub fn attach_shared_filter(&mut self, program: Arc<SharedFilterProgram>) {
        program.mark_attached();
        self.shared_filter = Some(program);
    }

    fn populate_fill_ring(&mut self, n: u32) {
        let mut writer = self.fill_completion.fill(n);
        let idxs = (0..n).map(BufIdx);
        writer.insert(idxs);
        writer.commit();
    }

    /// Drains the completion ring back into the fill ring. Called both
    /// opportunistically (every `send_batch`) and proactively when the
    /// fill ring runs low, so a sustained TX burst never starves RX.
    fn reap_completions(&mut self) {
        let budget = self.frame_count as u32;
        let mut reclaimed = Vec::with_capacity(budget as usize);
        {
            let mut reader = self.fill_completion.complete(budget);
            while let Some(idx) = reader.read() {
                reclaimed.push(idx);
            }
            reader.release();
        }
        if !reclaimed.is_empty() {
            let mut writer = self.fill_completion.fill(reclaimed.len() as u32);
            writer.insert(reclaimed.into_iter());
            writer.commit();
        }
        self.pending_completions = 0;
    }
}

impl Backend for XdpBackend {
    fn recv_batch(&mut self, out: &mut Vec<Descriptor>, max: usize) -> usize {
        let low_watermark =
            (self.frame_count * FILL_LOW_WATERMARK_NUM) / FILL_LOW_WATERMARK_DEN;
        if self.pending_completions as usize >= low_watermark {
            self.reap_completions();
        }

        let mut n = 0;
        let mut reader = self.rx.receive(max as u32);
        while n < max {
            let Some(desc) = reader.read() else { break };
            // Safety: `desc.addr` is a byte offset into `_umem_storage`
            // handed back to us by the kernel; it is owned by `self` and
            // outlives this descriptor, which the worker consumes within
            // the same burst per the contract.
            let ptr = unsafe { self.umem_base.add(desc.addr as usize) };
            // Skipped entirely when latency measurement is off — the
            // syscall cost is measurable at 1+ Mpps.
            let ts = self
                .measure_latency
                .then(crate::sleepyinstant::Instant::now_since_epoch_ns);
            out.push(unsafe { Descriptor::new(desc.addr, ptr, desc.len as usize, ts) });
            n += 1;
        }
        reader.release();
        n
    }

    fn send_batch(&mut self, pkts: &mut Vec<Descriptor>) -> usize {
        let n = pkts.len() as u32;
        let mut writer = self.tx.transmit(n);
        let descs = pkts.iter().map(|d| XdpDesc {
            addr: d.buffer_id,
            len: d.len() as u32,
            options: 0,
        });
        let accepted = writer.insert(descs);
        writer.commit();
        self.tx.wake();

        pkts.drain(..accepted as usize);
        self.pending_completions += accepted;
        self.reap_completions();
        accepted as usize
    }

    fn release_batch(&mut self, pkts: Vec<Descriptor>) {
        if pkts.is_empty() {
            return;
        }
        let mut writer = self.fill_completion.fill(pkts.len() as u32);
        writer.insert(pkts.iter().map(|d| BufIdx(d.buffer_id as u32)));
        writer.commit();
    }

    fn cleanup(&mut self) {
        // Rings and the umem mapping are torn down by their Drop impls;
        // nothing else to release.
    }

    fn kind(&self) -> BackendKind {
        BackendKind::ZeroCopy
    }
}

// Frame size/count are validated by `Config::validate` against power-of-
// two constraints the ring implementations require; keep them reachable
// for diagnostics.
impl XdpBackend {
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}
