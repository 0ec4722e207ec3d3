//! headers - bounds-checked views over the link, network and transport headers

use super::{ETH_HDR_LEN, IP_PROTO_TCP, IP_PROTO_UDP, IPV4_HDR_LEN, UDP_HDR_LEN};
use crate::FlowTuple;
use std::net::Ipv4Addr;

const IPV4_FLAG_MF: u16 = 0x2000;
const IPV4_FRAG_OFFSET_MASK: u16 = 0x1fff;

/// Read-only view of an IPv4 header and what follows it.
#[derive(Clone, Copy)]
pub struct Ipv4Hdr<'a>(&'a [u8]);

impl<'a> Ipv4Hdr<'a> {
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < IPV4_HDR_LEN || bytes[0] >> 4 != 4 {
            return None;
        }
        let ihl = ((bytes[0] & 0x0f) as usize) * 4;
        if ihl < IPV4_HDR_LEN || bytes.len() < ihl {
            return None;
        }
        Some(Ipv4Hdr(bytes))
    }

    /// View the IPv4 header that follows the Ethernet header of a frame.
    pub fn from_frame(frame: &'a [u8]) -> Option<Self> {
        frame.get(ETH_HDR_LEN..).and_then(Self::new)
    }

    pub fn header_len(&self) -> usize {
        ((self.0[0] & 0x0f) as usize) * 4
    }
    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }
    fn flags_fragment_offset(&self) -> u16 {
        u16::from_be_bytes([self.0[6], self.0[7]])
    }
    /// True if this packet is any fragment of a larger datagram.
    pub fn is_fragmented(&self) -> bool {
        let ff = self.flags_fragment_offset();
        (ff & IPV4_FLAG_MF) != 0 || (ff & IPV4_FRAG_OFFSET_MASK) != 0
    }
    fn is_first_fragment(&self) -> bool {
        (self.flags_fragment_offset() & IPV4_FRAG_OFFSET_MASK) == 0
    }
    pub fn protocol(&self) -> u8 {
        self.0[9]
    }
    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[12], self.0[13], self.0[14], self.0[15])
    }
    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[16], self.0[17], self.0[18], self.0[19])
    }
    pub fn payload(&self) -> &'a [u8] {
        &self.0[self.header_len()..]
    }

    /// The UDP header carried by this packet, if any.
    pub fn udp(&self) -> Option<UdpHdr<'a>> {
        if self.protocol() != IP_PROTO_UDP || !self.is_first_fragment() {
            return None;
        }
        UdpHdr::new(self.payload())
    }

    pub fn flow_tuple(&self) -> FlowTuple {
        let payload = self.payload();
        let (src_port, dst_port) = match self.protocol() {
            IP_PROTO_UDP | IP_PROTO_TCP if self.is_first_fragment() && payload.len() >= 4 => (
                u16::from_be_bytes([payload[0], payload[1]]),
                u16::from_be_bytes([payload[2], payload[3]]),
            ),
            _ => (0, 0),
        };
        FlowTuple {
            src_ip: self.src(),
            dst_ip: self.dst(),
            src_port,
            dst_port,
            proto: self.protocol(),
        }
    }
}

#[derive(Clone, Copy)]
pub struct UdpHdr<'a>(&'a [u8]);

impl<'a> UdpHdr<'a> {
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        (bytes.len() >= UDP_HDR_LEN).then_some(UdpHdr(bytes))
    }
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }
    pub fn payload(&self) -> &'a [u8] {
        &self.0[UDP_HDR_LEN..]
    }
}

// Index of the checksum among the header's 16 bit words.
const IPV4_CHECKSUM_WORD: usize = 5;

/// Header checksum of an IPv4 header.  The header's own checksum field is skipped.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    pnet_packet::util::checksum(header, IPV4_CHECKSUM_WORD)
}
