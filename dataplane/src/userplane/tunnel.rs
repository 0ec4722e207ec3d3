#![allow(clippy::unusual_byte_groupings)]
//! tunnel - GTP-U decapsulation on the S1-U ingress and encapsulation on egress

use super::batch::{Batch, PacketBuf, PktMask};
use super::headers::{Ipv4Hdr, ipv4_checksum};
use super::{
    ETH_HDR_LEN, GTP_MESSAGE_TYPE_GPDU, GTPU_HDR_LEN, GTPU_OPT_HDR_LEN, GTPU_OUTER_LEN,
    GTPU_PORT, IP_PROTO_UDP, IPV4_HDR_LEN, UDP_HDR_LEN,
};
use crate::BearerSession;
use std::net::Ipv4Addr;
use std::sync::Arc;

const GTP_FLAGS_VERSION_MASK: u8 = 0b111_0_0_0_0_0;
const GTP_FLAGS_V1: u8 = 0b001_0_0_0_0_0;
const GTP_FLAGS_PT: u8 = 0b000_1_0_0_0_0;
const GTP_FLAGS_E: u8 = 0b000_0_0_1_0_0;
const GTP_FLAGS_OPTIONAL: u8 = 0b000_0_0_1_1_1; // E, S, PN

/// What decapsulation learned from the outer headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelHeader {
    pub teid: u32,
    pub peer_ipv4: Ipv4Addr,
}

/// Check the outer IPv4/UDP/GTP-U headers of an S1-U frame and strip them, leaving
/// the Ethernet header directly in front of the inner IP packet.  None means the
/// frame is not a G-PDU for us; it is left untouched.
pub fn decapsulate(pkt: &mut PacketBuf, s1u_ip: Ipv4Addr) -> Option<TunnelHeader> {
    let (hdr, outer_len) = parse_outer(pkt.data(), s1u_ip)?;
    let data = pkt.data_mut();
    data.copy_within(0..ETH_HDR_LEN, outer_len);
    pkt.adj(outer_len)?;
    Some(hdr)
}

fn parse_outer(frame: &[u8], s1u_ip: Ipv4Addr) -> Option<(TunnelHeader, usize)> {
    let ip = Ipv4Hdr::from_frame(frame)?;

    // Reject if not addressed to our S1-U address.
    if ip.dst() != s1u_ip {
        return None;
    }

    // Reject un-tunneled packets.
    if ip.protocol() != IP_PROTO_UDP {
        return None;
    }
    let udp = ip.udp()?;
    if udp.dst_port() != GTPU_PORT {
        return None;
    }

    // ---- GTP header, TS29.281, 5.1 ----
    let gtp = udp.payload();
    if gtp.len() < GTPU_HDR_LEN {
        return None;
    }
    let flags = gtp[0];
    if flags & (GTP_FLAGS_VERSION_MASK | GTP_FLAGS_PT) != GTP_FLAGS_V1 | GTP_FLAGS_PT {
        return None;
    }
    let teid = u32::from_be_bytes([gtp[4], gtp[5], gtp[6], gtp[7]]);
    if teid == 0 || gtp[1] != GTP_MESSAGE_TYPE_GPDU {
        return None;
    }

    let mut gtp_len = GTPU_HDR_LEN;
    if flags & GTP_FLAGS_OPTIONAL != 0 {
        gtp_len += GTPU_OPT_HDR_LEN;
        if gtp.len() < gtp_len {
            return None;
        }
        if flags & GTP_FLAGS_E != 0 {
            gtp_len = skip_extension_headers(gtp, gtp_len)?;
        }
    }

    let outer_len = ip.header_len() + UDP_HDR_LEN + gtp_len;
    if ETH_HDR_LEN + outer_len > frame.len() {
        return None;
    }
    Some((
        TunnelHeader {
            teid,
            peer_ipv4: ip.src(),
        },
        outer_len,
    ))
}

// TS29.281, 5.2.1.  Each extension header's length is in units of 4 bytes and its
// last byte is the type of the next one.
fn skip_extension_headers(gtp: &[u8], mut offset: usize) -> Option<usize> {
    let mut next_type = gtp[offset - 1];
    while next_type != 0 {
        let units = *gtp.get(offset)? as usize;
        if units == 0 {
            return None;
        }
        offset += units * 4;
        next_type = *gtp.get(offset - 1)?;
    }
    Some(offset)
}

/// Decapsulate every active packet, recording TEID and eNB address in its side record.
pub fn gtpu_decap(batch: &mut Batch, s1u_ip: Ipv4Addr) {
    for i in 0..batch.len() {
        if !batch.mask.is_set(i) {
            continue;
        }
        let (pkt, meta) = batch.pkt_and_meta_mut(i);
        match decapsulate(pkt, s1u_ip) {
            Some(hdr) => {
                meta.teid = hdr.teid;
                meta.enb_ipv4 = u32::from(hdr.peer_ipv4);
            }
            None => batch.mask.clear(i),
        }
    }
}

/// Wrap the inner IP packet of an Ethernet frame in IPv4/UDP/GTP-U headers.  None if
/// there is not enough headroom.
pub fn encapsulate(
    pkt: &mut PacketBuf,
    teid: u32,
    peer_ipv4: Ipv4Addr,
    s1u_ip: Ipv4Addr,
) -> Option<()> {
    let inner_len = pkt.len().checked_sub(ETH_HDR_LEN)?;
    let ip_total_len = u16::try_from(inner_len + GTPU_OUTER_LEN).ok()?;
    let udp_len = ip_total_len - IPV4_HDR_LEN as u16;
    let gtp_payload_len = inner_len as u16;

    let data = pkt.prepend(GTPU_OUTER_LEN)?;
    data.copy_within(GTPU_OUTER_LEN..GTPU_OUTER_LEN + ETH_HDR_LEN, 0);

    // ---- GTP header, TS29.281, 5.1 ----
    let gtp = &mut data[ETH_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN..][..GTPU_HDR_LEN];
    gtp[0] = 0b001_1_0_0_0_0; // version=1, PT=1, R, E=0, S=0, PN=0
    gtp[1] = GTP_MESSAGE_TYPE_GPDU;
    gtp[2..4].copy_from_slice(&gtp_payload_len.to_be_bytes());
    gtp[4..8].copy_from_slice(&teid.to_be_bytes());

    // ---- UDP header, GTP-U port at both ends, checksum not used ----
    let udp = &mut data[ETH_HDR_LEN + IPV4_HDR_LEN..][..UDP_HDR_LEN];
    udp[0..2].copy_from_slice(&GTPU_PORT.to_be_bytes());
    udp[2..4].copy_from_slice(&GTPU_PORT.to_be_bytes());
    udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
    udp[6..8].copy_from_slice(&[0, 0]);

    // ---- IPv4 header ----
    let ip = &mut data[ETH_HDR_LEN..][..IPV4_HDR_LEN];
    ip[0] = 0x45; // version 4, IHL 5
    ip[1] = 0; // DSCP / ECN
    ip[2..4].copy_from_slice(&ip_total_len.to_be_bytes());
    ip[4..6].copy_from_slice(&[0, 0]); // identification
    ip[6..8].copy_from_slice(&[0x40, 0]); // DF
    ip[8] = 64; // TTL
    ip[9] = IP_PROTO_UDP;
    ip[12..16].copy_from_slice(&s1u_ip.octets());
    ip[16..20].copy_from_slice(&peer_ipv4.octets());
    let checksum = ipv4_checksum(ip);
    ip[10..12].copy_from_slice(&checksum.to_be_bytes());

    Some(())
}

/// Encapsulate every active packet towards its bearer's eNB.  A bearer with no
/// downlink tunnel yet has its packet moved from `batch.mask` to `queue_mask` for
/// buffering.
pub fn gtpu_encap(
    sessions: &[Option<Arc<BearerSession>>],
    batch: &mut Batch,
    s1u_ip: Ipv4Addr,
    queue_mask: &mut PktMask,
) {
    for i in 0..batch.len() {
        if !batch.mask.is_set(i) {
            continue;
        }
        let Some(session) = sessions.get(i).and_then(Option::as_ref) else {
            batch.mask.clear(i);
            continue;
        };
        let Some((enb_teid, enb_ipv4)) = session.downlink_tunnel() else {
            batch.mask.clear(i);
            queue_mask.set(i);
            continue;
        };
        if encapsulate(batch.pkt_mut(i), enb_teid, enb_ipv4, s1u_ip).is_none() {
            batch.mask.clear(i);
        }
    }
}
