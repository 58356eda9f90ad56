//! Backend C — filter device. The copy-heavy fallback of
//! last resort: a raw `AF_PACKET` socket, event-driven readiness via
//! `mio` instead of blocking reads, writes coalesced into a bounded
//! userspace buffer, and a best-effort kernel-side classic-BPF prefilter.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

use afpacket::sync::RawPacketStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use super::{Backend, Descriptor};
use crate::config::{BackendKind, Config};
use crate::error::InitError;

const RX_TOKEN: Token = Token(0);

/// Candidate coalescing-buffer sizes, largest first.
const BUFFER_SIZE_SCHEDULE: [usize; 4] = [1 << 20, 1 << 19, 1 << 18, 1 << 16];

pub struct FilterDeviceBackend {
    stream: RawPacketStream,
    poll: Poll,
    events: Events,
    frame_size: usize,
    /// Per-slot scratch buffers the worker's descriptors point into.
    rx_slots: Vec<Box<[u8]>>,
    next_slot: usize,
    tx_coalesce: Vec<u8>,
    tx_coalesce_cap: usize,
    measure_latency: bool,
}

impl FilterDeviceBackend {
    pub fn init(cfg: &Config, worker_index: usize) -> Result<FilterDeviceBackend, InitError> {
        let mut stream = RawPacketStream::new().map_err(InitError::Io)?;
        stream.bind(cfg.ifname.as_str()).map_err(InitError::Io)?;

        let fd = stream.as_raw_fd();
        install_classic_bpf_filter(fd, &cfg.local_mac, cfg.ito_port)
            .map_err(|e| InitError::FilterLoadFailed(e.to_string()))?;

        let tx_coalesce_cap = detect_max_buffer_size(fd);
        tracing::debug!(
            worker = worker_index,
            cap = tx_coalesce_cap,
            "filter-device TX coalescing buffer sized"
        );

        let poll = Poll::new().map_err(InitError::Io)?;
        poll.registry()
            .register(&mut SourceFd(&fd), RX_TOKEN, Interest::READABLE)
            .map_err(InitError::Io)?;

        let rx_slots = (0..cfg.frame_count.min(256))
            .map(|_| vec![0u8; cfg.frame_size].into_boxed_slice())
            .collect();

        Ok(FilterDeviceBackend {
            stream,
            poll,
            events: Events::with_capacity(64),
            frame_size: cfg.frame_size,
            rx_slots,
            next_slot: 0,
            tx_coalesce: Vec::with_capacity(tx_coalesce_cap),
            tx_coalesce_cap,
            measure_latency: cfg.measure_latency,
        })
    }

    fn flush_tx(&mut self) {
        if self.tx_coalesce.is_empty() {
            return;
        }
        // The device doesn't frame writes for us; each packet was
        // length-prefixed as it was appended, so split them back out.
        let mut rest: &[u8] = &self.tx_coalesce;
        while rest.len() >= 2 {
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            if rest.len() < 2 + len {
                break;
            }
            let _ = self.stream.write(&rest[2..2 + len]);
            rest = &rest[2 + len..];
        }
        self.tx_coalesce.clear();
    }
}

impl Backend for FilterDeviceBackend {
    fn recv_batch(&mut self, out: &mut Vec<Descriptor>, max: usize) -> usize {
        // Readiness check only; the socket is non-blocking so a spurious
        // wakeup just yields 0 without stalling the worker.
        let _ = self.poll.poll(&mut self.events, Some(std::time::Duration::from_millis(0)));

        let mut n = 0;
        while n < max && n < self.rx_slots.len() {
            let slot = self.next_slot;
            let buf = &mut self.rx_slots[slot];
            match self.stream.read(buf) {
                Ok(0) => break,
                Ok(len) => {
                    let ptr = buf.as_mut_ptr();
                    // Safety: `rx_slots[slot]` is owned by `self` and not
                    // touched again until this descriptor is consumed —
                    // `next_slot` only reuses a slot after a full cycle
                    // through `rx_slots.len()` bursts, by which point the
                    // worker loop has already released every prior burst.
                    let ts = self
                        .measure_latency
                        .then(crate::sleepyinstant::Instant::now_since_epoch_ns);
                    out.push(unsafe { Descriptor::new(slot as u64, ptr, len, ts) });
                    self.next_slot = (self.next_slot + 1) % self.rx_slots.len();
                    n += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        n
    }

    fn send_batch(&mut self, pkts: &mut Vec<Descriptor>) -> usize {
        let mut accepted = 0;
        for d in pkts.iter() {
            let needed = 2 + d.len();
            if self.tx_coalesce.len() + needed > self.tx_coalesce_cap {
                self.flush_tx();
            }
            if self.tx_coalesce.len() + needed > self.tx_coalesce_cap {
                // Single packet larger than the whole coalescing buffer;
                // send it directly rather than dropping it.
                let _ = self.stream.write(d.bytes());
                accepted += 1;
                continue;
            }
            self.tx_coalesce
                .extend_from_slice(&(d.len() as u16).to_be_bytes());
            self.tx_coalesce.extend_from_slice(d.bytes());
            accepted += 1;
        }
        self.flush_tx();
        pkts.drain(..accepted);
        accepted
    }

    fn release_batch(&mut self, _pkts: Vec<Descriptor>) {
        // Copy-in/copy-out backend: nothing to return to the kernel.
    }

    fn cleanup(&mut self) {
        self.flush_tx();
    }

    fn kind(&self) -> BackendKind {
        BackendKind::FilterDevice
    }
}

/// Tries `SO_SNDBUF` sizes in descending order until one is accepted,
/// trying each in descending order. Falls back to the
/// smallest candidate if even that is rejected (the socket still works;
/// it simply flushes more often).
fn detect_max_buffer_size(fd: std::os::fd::RawFd) -> usize {
    use socket2::Socket;
    // Safety: `fd` is a valid, open socket owned by the caller for the
    // duration of this call; `into_raw_fd` below hands it back without
    // closing it.
    let sock = unsafe { Socket::from_raw_fd(fd) };
    let mut chosen = *BUFFER_SIZE_SCHEDULE.last().unwrap();
    for &size in &BUFFER_SIZE_SCHEDULE {
        if sock.set_send_buffer_size(size).is_ok() {
            chosen = size;
            break;
        }
    }
    let _ = sock.into_raw_fd();
    chosen
}

/// Installs a classic-BPF program expressing "dst MAC == local AND
/// EtherType == IPv4 AND protocol == UDP". Signature
/// matching is left to userspace classification — a classic-BPF program
/// cannot cheaply branch on IHL-dependent offsets, so this prefilter
/// only rules out the traffic that can never be ITO on this interface;
/// VLAN-tagged frames are not matched here and fall through to userspace
/// unfiltered (still correctly classified by [`crate::packet::is_acceptable`]).
fn install_classic_bpf_filter(fd: std::os::fd::RawFd, local_mac: &[u8; 6], _ito_port: u16) -> io::Result<()> {
    use libc::{sock_filter, sock_fprog};

    const BPF_LD: u16 = 0x00;
    const BPF_LDX: u16 = 0x01;
    const BPF_JMP: u16 = 0x05;
    const BPF_RET: u16 = 0x06;
    const BPF_W: u16 = 0x00;
    const BPF_H: u16 = 0x08;
    const BPF_B: u16 = 0x10;
    const BPF_ABS: u16 = 0x20;
    const BPF_JEQ: u16 = 0x10;
    const BPF_K: u16 = 0x00;

    fn stmt(code: u16, k: u32) -> sock_filter {
        sock_filter {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }
    fn jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
        sock_filter { code, jt, jf, k }
    }

    let mac_hi = u32::from_be_bytes([0, 0, local_mac[0], local_mac[1]]);
    let mac_mid = u16::from_be_bytes([local_mac[2], local_mac[3]]) as u32;
    let mac_lo = u16::from_be_bytes([local_mac[4], local_mac[5]]) as u32;

    // Program: reject early on any mismatch, accept (full snaplen) only
    // if every check passes.
    let program = vec![
        // dst MAC bytes 2..6 as a 32-bit word at offset 0 (bytes 0..2 are
        // loaded separately since Ethernet dst MAC isn't word-aligned
        // with a convenient 6-byte load).
        jump(BPF_LD | BPF_W | BPF_ABS, 0, 0, 0),
        jump(BPF_JMP | BPF_JEQ | BPF_K, mac_hi << 16 | mac_mid, 0, 7),
        jump(BPF_LD | BPF_H | BPF_ABS, 4, 0, 0),
        jump(BPF_JMP | BPF_JEQ | BPF_K, mac_lo, 0, 5),
        jump(BPF_LD | BPF_H | BPF_ABS, 12, 0, 0),
        jump(BPF_JMP | BPF_JEQ | BPF_K, 0x0800, 0, 3),
        jump(BPF_LD | BPF_B | BPF_ABS, 23, 0, 0),
        jump(BPF_JMP | BPF_JEQ | BPF_K, 17, 0, 1),
        stmt(BPF_RET | BPF_K, 0xFFFF),
        stmt(BPF_RET | BPF_K, 0),
    ];
    let _ = BPF_LDX; // reserved for a future VLAN-aware variant

    let mut prog = program;
    let fprog = sock_fprog {
        len: prog.len() as u16,
        filter: prog.as_mut_ptr(),
    };

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &fprog as *const _ as *const libc::c_void,
            std::mem::size_of::<sock_fprog>() as u32,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
