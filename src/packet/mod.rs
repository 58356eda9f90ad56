//! Packet classifier and reflector.
//!
//! Pure, reentrant functions over a mutable byte slice. No allocation, no
//! syscalls, no assumption of pointer alignment. This is the hot path:
//! every packet a worker receives passes through [`is_acceptable`] and,
//! on accept, [`reflect`].

pub mod checksum;

use crate::config::{signature_from_wire, Config, ReflectionMode, SignatureKind};

const ETH_HDR_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_MIN_HDR_LEN: usize = 20;
const IPV6_HDR_LEN: usize = 40;
const UDP_HDR_LEN: usize = 8;
const OPAQUE_HDR_LEN: usize = 5;
const SIGNATURE_LEN: usize = 7;
const MIN_POST_UDP_LEN: usize = OPAQUE_HDR_LEN + SIGNATURE_LEN;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const PROTO_UDP: u8 = 17;

/// Why a packet was rejected. Each variant corresponds to one of the
/// per-worker error counters in [`crate::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooShort,
    InvalidMac,
    InvalidEtherType,
    InvalidProtocol,
    InvalidSignature,
}

/// Pre-parsed offsets the reflector needs, computed once by the
/// classifier so it never re-parses the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub eth_hdr_len: usize,
    pub ip_start: usize,
    pub ip_is_v6: bool,
    pub ihl_bytes: usize,
    pub udp_start: usize,
    pub is_vlan_tagged: bool,
}

/// Result of [`is_acceptable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept(SignatureKind, Layout),
    Reject(RejectReason),
}

/// Seven ordered checks, each a cheap prefilter for the next, so first
/// failure wins.
pub fn is_acceptable(buf: &[u8], cfg: &Config) -> Verdict {
    let l = buf.len();

    // Step 1 (partial): minimum length for an untagged IPv4 frame. The
    // VLAN/IPv6 thresholds are re-checked after we know the EtherType.
    if l < ETH_HDR_LEN + IPV4_MIN_HDR_LEN + UDP_HDR_LEN + MIN_POST_UDP_LEN {
        return Verdict::Reject(RejectReason::TooShort);
    }

    // Step 2: destination MAC must equal our local MAC exactly.
    if buf[0..6] != cfg.local_mac {
        return Verdict::Reject(RejectReason::InvalidMac);
    }

    // Step 3: optional source OUI filter.
    if cfg.filter_oui && buf[6..9] != cfg.oui {
        return Verdict::Reject(RejectReason::InvalidMac);
    }

    // Step 4: EtherType, with at most one VLAN tag peeled.
    let mut eth_hdr_len = ETH_HDR_LEN;
    let mut ethertype = u16::from_be_bytes([buf[12], buf[13]]);
    let mut is_vlan_tagged = false;

    if ethertype == ETHERTYPE_VLAN {
        if !cfg.enable_vlan {
            return Verdict::Reject(RejectReason::InvalidEtherType);
        }
        if l < ETH_HDR_LEN + VLAN_TAG_LEN + 2 {
            return Verdict::Reject(RejectReason::TooShort);
        }
        // Inner EtherType sits at offset 16..18 (14 + 4 tag - 2 already
        // counted as part of the tag's own type field is not applicable
        // here; the 4-byte tag is TPID(2)+TCI(2), inner type follows).
        ethertype = u16::from_be_bytes([buf[16], buf[17]]);
        // A second 0x8100/0x88A8 here is a stacked VLAN (QinQ) — reject.
        if ethertype == ETHERTYPE_VLAN || ethertype == 0x88A8 {
            return Verdict::Reject(RejectReason::InvalidEtherType);
        }
        eth_hdr_len += VLAN_TAG_LEN;
        is_vlan_tagged = true;
    }

    let ip_is_v6 = match ethertype {
        ETHERTYPE_IPV4 => false,
        ETHERTYPE_IPV6 if cfg.enable_ipv6 => true,
        _ => return Verdict::Reject(RejectReason::InvalidEtherType),
    };

    let ip_start = eth_hdr_len;

    // Step 5: IP header sanity, then locate UDP.
    let (ihl_bytes, udp_start) = if ip_is_v6 {
        if l < ip_start + IPV6_HDR_LEN + UDP_HDR_LEN + MIN_POST_UDP_LEN {
            return Verdict::Reject(RejectReason::TooShort);
        }
        let next_header = buf[ip_start + 6];
        if next_header != PROTO_UDP {
            return Verdict::Reject(RejectReason::InvalidProtocol);
        }
        (IPV6_HDR_LEN, ip_start + IPV6_HDR_LEN)
    } else {
        if l < ip_start + IPV4_MIN_HDR_LEN {
            return Verdict::Reject(RejectReason::TooShort);
        }
        let version = buf[ip_start] >> 4;
        let ihl = buf[ip_start] & 0x0f;
        if version != 4 || !(5..=15).contains(&ihl) {
            return Verdict::Reject(RejectReason::InvalidProtocol);
        }
        let ihl_bytes = ihl as usize * 4;
        if l < ip_start + ihl_bytes + UDP_HDR_LEN + MIN_POST_UDP_LEN {
            return Verdict::Reject(RejectReason::TooShort);
        }
        let protocol = buf[ip_start + 9];
        if protocol != PROTO_UDP {
            return Verdict::Reject(RejectReason::InvalidProtocol);
        }
        (ihl_bytes, ip_start + ihl_bytes)
    };

    // Step 6: destination port filter.
    if cfg.ito_port != 0 {
        let dst_port = u16::from_be_bytes([buf[udp_start + 2], buf[udp_start + 3]]);
        if dst_port != cfg.ito_port {
            return Verdict::Reject(RejectReason::InvalidProtocol);
        }
    }

    // Step 7: signature match, intersected with the configured filter.
    let sig_offset = udp_start + UDP_HDR_LEN + OPAQUE_HDR_LEN;
    let sig_bytes: [u8; 7] = match buf[sig_offset..sig_offset + SIGNATURE_LEN].try_into() {
        Ok(b) => b,
        Err(_) => return Verdict::Reject(RejectReason::TooShort),
    };
    let sig = match signature_from_wire(&sig_bytes) {
        Some(sig) if cfg.sig_filter.accepts(sig) => sig,
        _ => return Verdict::Reject(RejectReason::InvalidSignature),
    };

    Verdict::Accept(
        sig,
        Layout {
            eth_hdr_len,
            ip_start,
            ip_is_v6,
            ihl_bytes,
            udp_start,
            is_vlan_tagged,
        },
    )
}

#[inline]
fn swap_bytes(buf: &mut [u8], a: usize, b: usize, len: usize) {
    for i in 0..len {
        buf.swap(a + i, b + i);
    }
}

/// Rewrites `buf` in place so the packet would travel in the opposite
/// direction. Never reallocates, never changes length.
pub fn reflect(buf: &mut [u8], layout: Layout, mode: ReflectionMode, software_checksum: bool) {
    // Always: swap the two 6-byte MAC fields.
    swap_bytes(buf, 0, 6, 6);

    if mode == ReflectionMode::MacOnly {
        return;
    }

    let addr_len = if layout.ip_is_v6 { 16 } else { 4 };
    let (src_off, dst_off) = if layout.ip_is_v6 {
        (layout.ip_start + 8, layout.ip_start + 24)
    } else {
        (layout.ip_start + 12, layout.ip_start + 16)
    };
    swap_bytes(buf, src_off, dst_off, addr_len);

    if mode == ReflectionMode::MacIpPorts {
        swap_bytes(buf, layout.udp_start, layout.udp_start + 2, 2);
    }

    if software_checksum {
        recompute_checksums(buf, layout);
    }
}

fn recompute_checksums(buf: &mut [u8], layout: Layout) {
    if !layout.ip_is_v6 {
        buf[layout.ip_start + 10] = 0;
        buf[layout.ip_start + 11] = 0;
        let header_checksum =
            checksum::internet_checksum(&buf[layout.ip_start..layout.ip_start + layout.ihl_bytes]);
        buf[layout.ip_start + 10..layout.ip_start + 12]
            .copy_from_slice(&header_checksum.to_be_bytes());
    }

    let udp_len = u16::from_be_bytes([buf[layout.udp_start + 4], buf[layout.udp_start + 5]]);
    buf[layout.udp_start + 6] = 0;
    buf[layout.udp_start + 7] = 0;

    let mut acc = checksum::ChecksumAccumulator::new();
    if layout.ip_is_v6 {
        acc.add_bytes(&buf[layout.ip_start + 8..layout.ip_start + 24]); // src
        acc.add_bytes(&buf[layout.ip_start + 24..layout.ip_start + 40]); // dst
        acc.add_u16(0);
        acc.add_u16(udp_len);
        acc.add_u16(0);
        acc.add_u16(PROTO_UDP as u16);
    } else {
        acc.add_bytes(&buf[layout.ip_start + 12..layout.ip_start + 16]); // src
        acc.add_bytes(&buf[layout.ip_start + 16..layout.ip_start + 20]); // dst
        acc.add_u16(0);
        acc.add_u16(PROTO_UDP as u16);
        acc.add_u16(udp_len);
    }
    let udp_end = (layout.udp_start + udp_len as usize).min(buf.len());
    acc.add_bytes(&buf[layout.udp_start..udp_end]);

    let computed = acc.finish();
    // RFC 768: a computed checksum of zero is transmitted as all-ones.
    // Applies for both IPv4 and IPv6 UDP; recomputed unconditionally
    // (see DESIGN.md's open-question resolution).
    let checksum = if computed == 0 { 0xFFFF } else { computed };
    buf[layout.udp_start + 6..layout.udp_start + 8].copy_from_slice(&checksum.to_be_bytes());
}

#[cfg(test)]
mod tests;
