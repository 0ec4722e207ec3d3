//! Frame builders and parsers for driving the dataplane with realistic traffic.
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use pnet_packet::Packet;
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet_packet::udp::{MutableUdpPacket, UdpPacket};
use std::net::Ipv4Addr;

pub const GTPU_PORT: u16 = 2152; // TS29.281
pub const DNS_PORT: u16 = 53;
const ETH_HDR_LEN: usize = 14;
const IPV4_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;
const GTP_MESSAGE_TYPE_GPDU: u8 = 255; // TS29.281, table 6.1-1

/// An IPv4/UDP packet with correct lengths and checksums.
pub fn ipv4_udp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HDR_LEN + payload.len();
    let total_len = IPV4_HDR_LEN + udp_len;
    let mut packet = vec![0u8; total_len];

    let mut udp_packet = MutableUdpPacket::new(&mut packet[IPV4_HDR_LEN..]).unwrap();
    udp_packet.set_source(src_port);
    udp_packet.set_destination(dst_port);
    udp_packet.set_length(udp_len as u16);
    udp_packet.set_payload(payload);
    let checksum = pnet_packet::udp::ipv4_checksum(&udp_packet.to_immutable(), &src, &dst);
    udp_packet.set_checksum(checksum);

    let mut ipv4_packet = MutableIpv4Packet::new(&mut packet).unwrap();
    ipv4_packet.set_version(4);
    ipv4_packet.set_header_length(5);
    ipv4_packet.set_total_length(total_len as u16);
    ipv4_packet.set_flags(Ipv4Flags::DontFragment);
    ipv4_packet.set_ttl(64);
    ipv4_packet.set_next_level_protocol(IpNextHeaderProtocols::Udp);
    ipv4_packet.set_source(src);
    ipv4_packet.set_destination(dst);
    let checksum = pnet_packet::ipv4::checksum(&ipv4_packet.to_immutable());
    ipv4_packet.set_checksum(checksum);

    packet
}

/// Put an IPv4 packet in an Ethernet frame.
pub fn eth_frame(dst_mac: [u8; 6], src_mac: [u8; 6], ip_packet: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HDR_LEN + ip_packet.len());
    frame.extend_from_slice(&dst_mac);
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&[0x08, 0x00]);
    frame.extend_from_slice(ip_packet);
    frame
}

/// A G-PDU from an eNB carrying `inner`.
pub fn gtpu_packet(
    enb_ip: Ipv4Addr,
    s1u_ip: Ipv4Addr,
    dst_port: u16,
    teid: u32,
    inner: &[u8],
) -> Vec<u8> {
    let mut gtp = vec![
        0b001_1_0_0_0_0,       // version, PT, R, E, S, PN
        GTP_MESSAGE_TYPE_GPDU, // message type
    ];
    gtp.extend_from_slice(&(inner.len() as u16).to_be_bytes());
    gtp.extend_from_slice(&teid.to_be_bytes());
    gtp.extend_from_slice(inner);
    ipv4_udp(enb_ip, s1u_ip, GTPU_PORT, dst_port, &gtp)
}

/// The fields of a GTP-U frame that tests check.
#[derive(Debug, PartialEq, Eq)]
pub struct GtpuFrame {
    pub eth_dst: [u8; 6],
    pub eth_src: [u8; 6],
    pub outer_src: Ipv4Addr,
    pub outer_dst: Ipv4Addr,
    pub udp_src: u16,
    pub udp_dst: u16,
    pub teid: u32,
    pub inner: Vec<u8>,
}

pub fn parse_gtpu_frame(frame: &[u8]) -> Option<GtpuFrame> {
    let ip = Ipv4Packet::new(&frame[ETH_HDR_LEN..])?;
    if pnet_packet::ipv4::checksum(&ip) != ip.get_checksum() {
        return None;
    }
    let udp = UdpPacket::new(ip.payload())?;
    let gtp = udp.payload();
    if gtp.len() < 8 || gtp[1] != GTP_MESSAGE_TYPE_GPDU {
        return None;
    }
    let gtp_len = u16::from_be_bytes([gtp[2], gtp[3]]) as usize;
    Some(GtpuFrame {
        eth_dst: frame[0..6].try_into().ok()?,
        eth_src: frame[6..12].try_into().ok()?,
        outer_src: ip.get_source(),
        outer_dst: ip.get_destination(),
        udp_src: udp.get_source(),
        udp_dst: udp.get_destination(),
        teid: u32::from_be_bytes(gtp[4..8].try_into().ok()?),
        inner: gtp.get(8..8 + gtp_len)?.to_vec(),
    })
}

fn dns_message(name: &str, message_type: MessageType) -> (Message, Name) {
    let name = Name::from_ascii(name).expect("valid DNS name");
    let mut msg = Message::new();
    msg.set_id(0x1234)
        .set_message_type(message_type)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(name.clone(), RecordType::A));
    (msg, name)
}

/// A successful DNS response to an A query for `name`, answering with `addrs`.
pub fn dns_response(name: &str, addrs: &[Ipv4Addr]) -> Vec<u8> {
    let (mut msg, name) = dns_message(name, MessageType::Response);
    msg.set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);
    for addr in addrs {
        msg.add_answer(Record::from_rdata(name.clone(), 60, RData::A(A(*addr))));
    }
    msg.to_vec().expect("encodable DNS response")
}

/// A DNS query for `name`.
pub fn dns_query(name: &str) -> Vec<u8> {
    let (msg, _) = dns_message(name, MessageType::Query);
    msg.to_vec().expect("encodable DNS query")
}
