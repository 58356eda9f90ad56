use super::*;
use crate::config::{Config, ReflectionMode, SignatureFilter};

fn base_config(local_mac: [u8; 6]) -> Config {
    let mut cfg = Config::new("eth0", local_mac);
    cfg.mode = ReflectionMode::MacIpPorts;
    cfg.sig_filter = SignatureFilter::All;
    cfg
}

fn hex_frame(hex: &str) -> Vec<u8> {
    hex.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).unwrap())
        .collect()
}

const SCENARIO_1_HEX: &str = "00 01 55 17 1e 1b  00 c0 17 54 05 98  08 00 \
     45 00 00 27 00 00 40 00 40 11 00 00 c0 a8 00 0a c0 a8 00 01 \
     0f 02 0f 03 00 13 00 00 \
     09 10 ea 1d 00 \
     50 52 4f 42 45 4f 54 \
     00 00 00 00";

#[test]
fn scenario_1_valid_ipv4_probeot() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let cfg = base_config(local_mac);
    let mut buf = hex_frame(SCENARIO_1_HEX);

    let verdict = is_acceptable(&buf, &cfg);
    let Verdict::Accept(sig, layout) = verdict else {
        panic!("expected accept, got {verdict:?}");
    };
    assert_eq!(sig, SignatureKind::ProbeOt);

    reflect(&mut buf, layout, cfg.mode, false);

    assert_eq!(&buf[0..12], &[0x00, 0xc0, 0x17, 0x54, 0x05, 0x98, 0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b]);
    assert_eq!(&buf[26..34], &[0xc0, 0xa8, 0x00, 0x01, 0xc0, 0xa8, 0x00, 0x0a]);
    assert_eq!(&buf[34..38], &[0x0f, 0x03, 0x0f, 0x02]);
    // payload untouched
    assert_eq!(&buf[54..58], &[0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn scenario_2_wrong_destination_mac() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let cfg = base_config(local_mac);
    let mut buf = hex_frame(SCENARIO_1_HEX);
    buf[0..6].copy_from_slice(&[0xff; 6]);

    assert_eq!(
        is_acceptable(&buf, &cfg),
        Verdict::Reject(RejectReason::InvalidMac)
    );
}

#[test]
fn scenario_3_tcp_not_udp() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let cfg = base_config(local_mac);
    let mut buf = hex_frame(SCENARIO_1_HEX);
    buf[23] = 6; // IP protocol byte -> TCP

    assert_eq!(
        is_acceptable(&buf, &cfg),
        Verdict::Reject(RejectReason::InvalidProtocol)
    );
}

#[test]
fn scenario_4_short_frame_no_panic() {
    let cfg = base_config([0; 6]);
    let buf = vec![0u8; 50];
    assert_eq!(
        is_acceptable(&buf, &cfg),
        Verdict::Reject(RejectReason::TooShort)
    );
}

#[test]
fn scenario_6_vlan_tagged_probeot() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let cfg = base_config(local_mac);
    let mut untagged = hex_frame(SCENARIO_1_HEX);
    // Splice a VLAN tag between the MACs and the original EtherType.
    let mut tagged = Vec::with_capacity(untagged.len() + 4);
    tagged.extend_from_slice(&untagged[0..12]);
    tagged.extend_from_slice(&[0x81, 0x00, 0x00, 0x07]); // TPID + VID 7
    tagged.extend_from_slice(&untagged[12..]);
    untagged.clear();

    let verdict = is_acceptable(&tagged, &cfg);
    let Verdict::Accept(sig, layout) = verdict else {
        panic!("expected accept, got {verdict:?}");
    };
    assert_eq!(sig, SignatureKind::ProbeOt);
    assert!(layout.is_vlan_tagged);

    let vlan_tag_before = tagged[12..16].to_vec();
    reflect(&mut tagged, layout, cfg.mode, false);
    assert_eq!(&tagged[12..16], vlan_tag_before.as_slice());
    assert_eq!(&tagged[0..12], &[0x00, 0xc0, 0x17, 0x54, 0x05, 0x98, 0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b]);
}

#[test]
fn scenario_5_ipv6_latency() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let src_mac = [0x00, 0xc0, 0x17, 0x54, 0x05, 0x98];
    let mut cfg = base_config(local_mac);
    cfg.enable_ipv6 = true;

    let src_ip = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01];
    let dst_ip = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x02];

    let mut buf = Vec::new();
    buf.extend_from_slice(&local_mac);
    buf.extend_from_slice(&src_mac);
    buf.extend_from_slice(&0x86DDu16.to_be_bytes());
    buf.push(0x60); // version 6, traffic class high nibble
    buf.extend_from_slice(&[0, 0, 0]); // traffic class low / flow label
    let udp_and_payload_len: u16 = 8 + 5 + 7;
    buf.extend_from_slice(&udp_and_payload_len.to_be_bytes()); // payload length
    buf.push(17); // next header = UDP
    buf.push(64); // hop limit
    buf.extend_from_slice(&src_ip);
    buf.extend_from_slice(&dst_ip);
    // UDP header: src port, dst port, length, checksum (left zero, software_checksum off)
    buf.extend_from_slice(&0x0f02u16.to_be_bytes());
    buf.extend_from_slice(&0x0f03u16.to_be_bytes());
    buf.extend_from_slice(&udp_and_payload_len.to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&[0u8; 5]); // opaque header
    buf.extend_from_slice(b"LATENCY");

    let before_len = buf.len();
    let verdict = is_acceptable(&buf, &cfg);
    let Verdict::Accept(sig, layout) = verdict else {
        panic!("expected accept, got {verdict:?}");
    };
    assert_eq!(sig, SignatureKind::Latency);
    assert!(layout.ip_is_v6);

    reflect(&mut buf, layout, cfg.mode, false);

    assert_eq!(buf.len(), before_len);
    assert_eq!(&buf[0..6], &src_mac);
    assert_eq!(&buf[6..12], &local_mac);
    assert_eq!(&buf[layout.ip_start + 8..layout.ip_start + 24], &dst_ip);
    assert_eq!(&buf[layout.ip_start + 24..layout.ip_start + 40], &src_ip);
    assert_eq!(&buf[layout.udp_start..layout.udp_start + 2], &0x0f03u16.to_be_bytes());
    assert_eq!(&buf[layout.udp_start + 2..layout.udp_start + 4], &0x0f02u16.to_be_bytes());
}

#[test]
fn reflection_is_involutive_mac_only() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let mut cfg = base_config(local_mac);
    cfg.mode = ReflectionMode::MacOnly;
    let original = hex_frame(SCENARIO_1_HEX);
    let mut buf = original.clone();

    let Verdict::Accept(_, layout) = is_acceptable(&buf, &cfg) else {
        panic!("expected accept");
    };
    reflect(&mut buf, layout, cfg.mode, false);
    reflect(&mut buf, layout, cfg.mode, false);
    assert_eq!(buf, original);
}

#[test]
fn reflection_is_involutive_mac_ip() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let mut cfg = base_config(local_mac);
    cfg.mode = ReflectionMode::MacAndIp;
    let original = hex_frame(SCENARIO_1_HEX);
    let mut buf = original.clone();

    let Verdict::Accept(_, layout) = is_acceptable(&buf, &cfg) else {
        panic!("expected accept");
    };
    reflect(&mut buf, layout, cfg.mode, false);
    reflect(&mut buf, layout, cfg.mode, false);
    assert_eq!(buf, original);
}

#[test]
fn reflection_is_involutive_mac_ip_ports() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let cfg = base_config(local_mac);
    let original = hex_frame(SCENARIO_1_HEX);
    let mut buf = original.clone();

    let Verdict::Accept(_, layout) = is_acceptable(&buf, &cfg) else {
        panic!("expected accept");
    };
    reflect(&mut buf, layout, cfg.mode, false);
    reflect(&mut buf, layout, cfg.mode, false);
    assert_eq!(buf, original);
}

#[test]
fn reflection_preserves_length() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let cfg = base_config(local_mac);
    let mut buf = hex_frame(SCENARIO_1_HEX);
    let before = buf.len();
    let Verdict::Accept(_, layout) = is_acceptable(&buf, &cfg) else {
        panic!("expected accept");
    };
    reflect(&mut buf, layout, cfg.mode, true);
    assert_eq!(buf.len(), before);
}

#[test]
fn classification_is_pure_and_does_not_mutate() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let cfg = base_config(local_mac);
    let buf = hex_frame(SCENARIO_1_HEX);
    let before = buf.clone();
    let v1 = is_acceptable(&buf, &cfg);
    let v2 = is_acceptable(&buf, &cfg);
    assert_eq!(v1, v2);
    assert_eq!(buf, before);
}

#[test]
fn software_checksum_produces_valid_ipv4_and_udp_checksums() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let cfg = base_config(local_mac);
    let mut buf = hex_frame(SCENARIO_1_HEX);

    let Verdict::Accept(_, layout) = is_acceptable(&buf, &cfg) else {
        panic!("expected accept");
    };
    reflect(&mut buf, layout, cfg.mode, true);

    // A valid IPv4 header checksum makes the header sum to zero.
    assert_eq!(
        checksum::internet_checksum(&buf[layout.ip_start..layout.ip_start + layout.ihl_bytes]),
        0
    );
}

#[test]
fn qinq_stacked_vlan_is_rejected() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let cfg = base_config(local_mac);
    let untagged = hex_frame(SCENARIO_1_HEX);
    let mut tagged = Vec::new();
    tagged.extend_from_slice(&untagged[0..12]);
    tagged.extend_from_slice(&[0x81, 0x00, 0x00, 0x07]);
    tagged.extend_from_slice(&[0x88, 0xa8, 0x00, 0x07]); // stacked tag
    tagged.extend_from_slice(&untagged[12..]);

    assert_eq!(
        is_acceptable(&tagged, &cfg),
        Verdict::Reject(RejectReason::InvalidEtherType)
    );
}

#[test]
fn ipv6_extension_headers_are_rejected() {
    let local_mac = [0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b];
    let mut cfg = base_config(local_mac);
    cfg.enable_ipv6 = true;

    let mut buf = vec![0u8; 14 + 40 + 8 + 5 + 7];
    buf[0..6].copy_from_slice(&local_mac);
    buf[12..14].copy_from_slice(&0x86DDu16.to_be_bytes());
    buf[14] = 0x60; // version 6
    buf[20] = 0; // "hop-by-hop options" next header, not UDP
    assert_eq!(
        is_acceptable(&buf, &cfg),
        Verdict::Reject(RejectReason::InvalidProtocol)
    );
}

mod classifier_fuzz {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100_000))]

        /// Classification never panics or reads out of bounds regardless
        /// of content, and any buffer that isn't a well-formed ITO
        /// packet is rejected rather than misclassified.
        #[test]
        fn never_panics_and_is_pure_on_arbitrary_bytes(buf in vec(any::<u8>(), 0..256)) {
            let cfg = base_config([0x00, 0x01, 0x55, 0x17, 0x1e, 0x1b]);
            let before = buf.clone();
            let v1 = is_acceptable(&buf, &cfg);
            let v2 = is_acceptable(&buf, &cfg);
            prop_assert_eq!(v1, v2);
            prop_assert_eq!(&buf, &before);
        }

        /// A second independent local MAC and OUI filter, to make sure the
        /// purity property holds across configs too, not just the default.
        #[test]
        fn purity_holds_with_oui_filter_enabled(
            buf in vec(any::<u8>(), 0..128),
            oui in any::<[u8; 3]>(),
        ) {
            let mut cfg = base_config([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
            cfg.filter_oui = true;
            cfg.oui = oui;
            let before = buf.clone();
            let verdict = is_acceptable(&buf, &cfg);
            prop_assert_eq!(is_acceptable(&buf, &cfg), verdict);
            prop_assert_eq!(&buf, &before);
        }
    }
}
