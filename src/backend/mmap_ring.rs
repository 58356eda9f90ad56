//! Backend B — memory-mapped `PACKET_MMAP` ring. The
//! copy-light fallback: an `AF_PACKET` socket with kernel-mapped RX and
//! TX ring buffers (`PACKET_RX_RING` / `PACKET_TX_RING`), avoiding a
//! per-packet syscall even though frames still live in a kernel-owned
//! mmap rather than a umem the NIC DMAs into directly.

use std::os::fd::{AsRawFd, RawFd};
use std::ptr::NonNull;

use super::{Backend, Descriptor};
use crate::config::{BackendKind, Config};
use crate::error::InitError;

/// `tpacket_req` block/frame geometry. One frame per packet descriptor,
/// matching the umem backend's one-frame-per-slot layout so the two
/// backends share a mental model even though the kernel owns this mmap.
const BLOCK_SIZE: usize = 1 << 12;

#[repr(C)]
struct TpacketReq {
    tp_block_size: u32,
    tp_block_nr: u32,
    tp_frame_size: u32,
    tp_frame_nr: u32,
}

/// Per-frame status header `PACKET_MMAP` prepends to each slot
/// (`struct tpacket_hdr`, simplified to the fields this backend reads).
#[repr(C)]
struct TpacketHdr {
    tp_status: libc::c_ulong,
    tp_len: u32,
    tp_snaplen: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_sec: u32,
    tp_usec: u32,
}

const TP_STATUS_KERNEL: libc::c_ulong = 0;
const TP_STATUS_USER: libc::c_ulong = 1;
const TP_STATUS_SEND_REQUEST: libc::c_ulong = 1;
const TP_STATUS_AVAILABLE: libc::c_ulong = 0;

struct MappedRing {
    base: *mut u8,
    len: usize,
    frame_size: usize,
    frame_count: usize,
    cursor: usize,
}

impl MappedRing {
    fn frame_ptr(&self, idx: usize) -> *mut u8 {
        unsafe { self.base.add(idx * self.frame_size) }
    }
}

// The mapping outlives every descriptor handed out from it (tied to
// `MmapRingBackend`'s lifetime), and only one worker thread touches a
// given ring.
unsafe impl Send for MappedRing {}

impl Drop for MappedRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

pub struct MmapRingBackend {
    fd: RawFd,
    rx: MappedRing,
    tx: MappedRing,
    frame_size: usize,
    measure_latency: bool,
}

impl MmapRingBackend {
    pub fn init(cfg: &Config, worker_index: usize) -> Result<MmapRingBackend, InitError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(InitError::Io(std::io::Error::last_os_error()));
        }

        let version = libc::TPACKET_V2;
        if unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_VERSION,
                &version as *const _ as *const libc::c_void,
                std::mem::size_of_val(&version) as u32,
            )
        } != 0
        {
            unsafe { libc::close(fd) };
            return Err(InitError::Io(std::io::Error::last_os_error()));
        }

        let frame_size = cfg.frame_size.max(BLOCK_SIZE);
        let req = TpacketReq {
            tp_block_size: frame_size as u32,
            tp_block_nr: cfg.frame_count as u32,
            tp_frame_size: frame_size as u32,
            tp_frame_nr: cfg.frame_count as u32,
        };

        let rx = setup_ring(fd, libc::PACKET_RX_RING, &req, frame_size, cfg.frame_count)
            .map_err(|e| InitError::RingCreationFailed(format!("rx ring: {e}")))?;
        let tx = setup_ring(fd, libc::PACKET_TX_RING, &req, frame_size, cfg.frame_count)
            .map_err(|e| InitError::RingCreationFailed(format!("tx ring: {e}")))?;

        bind_to_interface(fd, cfg.ifname.as_str())
            .map_err(|_| InitError::InterfaceNotFound(cfg.ifname.clone()))?;

        set_best_effort_opts(fd);
        if cfg.worker_count > 1 {
            set_fanout(fd, cfg.worker_count);
        }

        tracing::debug!(
            worker = worker_index,
            frame_size,
            frame_count = cfg.frame_count,
            "mmap ring backend bound"
        );

        Ok(MmapRingBackend {
            fd,
            rx,
            tx,
            frame_size,
            measure_latency: cfg.measure_latency,
        })
    }
}

fn setup_ring(
    fd: RawFd,
    opt: libc::c_int,
    req: &TpacketReq,
    frame_size: usize,
    frame_count: usize,
) -> std::io::Result<MappedRing> {
    if unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            opt,
            req as *const _ as *const libc::c_void,
            std::mem::size_of::<TpacketReq>() as u32,
        )
    } != 0
    {
        return Err(std::io::Error::last_os_error());
    }

    let total_len = frame_size * frame_count;
    // RX and TX rings are mapped as separate regions (two mmap calls at
    // the socket-wide offset PACKET_MMAP reserves per ring, matching the
    // two-setsockopt-then-one-mmap-per-ring idiom the kernel documents).
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total_len,
            prot,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    let base = NonNull::new(ptr as *mut u8)
        .ok_or_else(std::io::Error::last_os_error)?
        .as_ptr();

    Ok(MappedRing {
        base,
        len: total_len,
        frame_size,
        frame_count,
        cursor: 0,
    })
}

fn bind_to_interface(fd: RawFd, ifname: &str) -> std::io::Result<()> {
    let ifname_c = std::ffi::CString::new(ifname)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let idx = unsafe { libc::if_nametoindex(ifname_c.as_ptr()) };
    if idx == 0 {
        return Err(std::io::Error::last_os_error());
    }
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    addr.sll_ifindex = idx as i32;

    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as u32,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// `PACKET_QDISC_BYPASS` and `SO_BUSY_POLL` shave latency off the
/// hot path when the kernel supports them; neither is load-bearing so
/// failures are logged and ignored rather than surfaced as `InitError`.
fn set_best_effort_opts(fd: RawFd) {
    let bypass: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            libc::PACKET_QDISC_BYPASS,
            &bypass as *const _ as *const libc::c_void,
            std::mem::size_of_val(&bypass) as u32,
        );
    }
    let busy_poll: libc::c_int = 50;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BUSY_POLL,
            &busy_poll as *const _ as *const libc::c_void,
            std::mem::size_of_val(&busy_poll) as u32,
        );
    }
}

/// Joins a `PACKET_FANOUT` group hashed on flow so the kernel, not the
/// reflector, distributes packets across the `worker_count` sockets bound
/// to this interface ("multi-worker hash-based queue
/// distribution"). Every worker must request the same group id; since all
/// workers of one reflector share a process, its pid is a stable id that
/// won't collide with another reflector instance's sockets on the same
/// interface. Best-effort: failure just leaves each worker seeing every
/// packet, which userspace classification still handles correctly.
fn set_fanout(fd: RawFd, _worker_count: usize) {
    let group_id = (std::process::id() & 0xffff) as u16;
    let fanout_arg: u32 = (group_id as u32) | ((libc::PACKET_FANOUT_HASH as u32) << 16);
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            libc::PACKET_FANOUT,
            &fanout_arg as *const _ as *const libc::c_void,
            std::mem::size_of_val(&fanout_arg) as u32,
        );
    }
}

impl Backend for MmapRingBackend {
    fn recv_batch(&mut self, out: &mut Vec<Descriptor>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            let idx = self.rx.cursor;
            let frame = self.rx.frame_ptr(idx);
            let hdr = frame as *mut TpacketHdr;
            let status = unsafe { std::ptr::read_volatile(&(*hdr).tp_status) };
            if status & TP_STATUS_USER == TP_STATUS_KERNEL {
                break;
            }
            let mac_off = unsafe { (*hdr).tp_mac } as usize;
            let len = unsafe { (*hdr).tp_len } as usize;
            let data = unsafe { frame.add(mac_off) };

            // Safety: this frame is marked TP_STATUS_USER (owned by us,
            // not the kernel) until `release_batch` flips it back; only
            // this worker thread touches `self.rx`.
            let ts = self
                .measure_latency
                .then(crate::sleepyinstant::Instant::now_since_epoch_ns);
            out.push(unsafe { Descriptor::new(idx as u64, data, len, ts) });

            self.rx.cursor = (self.rx.cursor + 1) % self.rx.frame_count;
            n += 1;
        }
        n
    }

    fn send_batch(&mut self, pkts: &mut Vec<Descriptor>) -> usize {
        let mut accepted = 0;
        while accepted < pkts.len() {
            let idx = self.tx.cursor;
            let frame = self.tx.frame_ptr(idx);
            let hdr = frame as *mut TpacketHdr;
            let status = unsafe { std::ptr::read_volatile(&(*hdr).tp_status) };
            if status != TP_STATUS_AVAILABLE {
                break;
            }

            let d = &pkts[accepted];
            let mac_off = std::mem::size_of::<TpacketHdr>();
            let dst = unsafe { frame.add(mac_off) };
            unsafe { std::ptr::copy_nonoverlapping(d.bytes().as_ptr(), dst, d.len()) };
            unsafe {
                (*hdr).tp_len = d.len() as u32;
                (*hdr).tp_mac = mac_off as u16;
                std::ptr::write_volatile(&mut (*hdr).tp_status, TP_STATUS_SEND_REQUEST);
            }

            self.tx.cursor = (self.tx.cursor + 1) % self.tx.frame_count;
            accepted += 1;
        }
        if accepted > 0 {
            // Kicks the kernel to drain every TP_STATUS_SEND_REQUEST
            // frame now queued, equivalent to a zero-length `send`.
            unsafe { libc::send(self.fd, std::ptr::null(), 0, libc::MSG_DONTWAIT) };
        }
        pkts.drain(..accepted);
        accepted
    }

    fn release_batch(&mut self, pkts: Vec<Descriptor>) {
        for d in pkts {
            let frame = self.rx.frame_ptr(d.buffer_id as usize);
            let hdr = frame as *mut TpacketHdr;
            unsafe { std::ptr::write_volatile(&mut (*hdr).tp_status, TP_STATUS_KERNEL) };
        }
    }

    fn cleanup(&mut self) {
        // The fd and ring mappings are released by `Drop`.
    }

    fn kind(&self) -> BackendKind {
        BackendKind::MmapRing
    }
}

impl MmapRingBackend {
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

impl AsRawFd for MmapRingBackend {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for MmapRingBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
