//! nexthop - rewrites the Ethernet header of each surviving packet for its egress port

use super::batch::{Batch, PacketBuf};
use super::headers::Ipv4Hdr;
use super::{ETH_HDR_LEN, ETHER_TYPE_IPV4};
use crate::{MacAddr, PortConfig};
use anyhow::{Context, Result, bail};
use derive_deref::Deref;
use std::collections::HashMap;
use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
pub struct PortNextHop {
    pub mac: MacAddr,
    pub gateway_mac: Option<MacAddr>,
    pub neighbors: HashMap<Ipv4Addr, MacAddr>,
}

impl PortNextHop {
    /// MAC of the next hop towards `dst`: a static neighbor, else the default gateway.
    pub fn resolve(&self, dst: Ipv4Addr) -> Option<MacAddr> {
        self.neighbors.get(&dst).copied().or(self.gateway_mac)
    }
}

/// Link layer next hop data for each egress port.
#[derive(Debug, Clone, Default, Deref)]
pub struct NextHopTable(HashMap<u8, PortNextHop>);

impl NextHopTable {
    pub fn new(ports: &[PortConfig]) -> Result<Self> {
        let mut table = HashMap::new();
        for port in ports {
            let mut neighbors = HashMap::new();
            for (ip, mac) in port.neighbors.iter() {
                let ip: Ipv4Addr = ip
                    .parse()
                    .context(format!("Port {} neighbor '{ip}' is not an IPv4 address", port.port_id))?;
                neighbors.insert(ip, *mac);
            }
            let next_hop = PortNextHop {
                mac: port.mac,
                gateway_mac: port.gateway_mac,
                neighbors,
            };
            if table.insert(port.port_id, next_hop).is_some() {
                bail!("Port {} configured more than once", port.port_id);
            }
        }
        Ok(NextHopTable(table))
    }
}

/// Write the Ethernet header for sending `pkt` out of `port`.  None if the port is
/// unknown, the packet is not IPv4 or there is no next hop for its destination.
pub fn construct_ether_hdr(pkt: &mut PacketBuf, port: u8, table: &NextHopTable) -> Option<()> {
    let next_hop = table.get(&port)?;
    let dst = Ipv4Hdr::new(pkt.l3())?.dst();
    let dst_mac = next_hop.resolve(dst)?;

    let eth = pkt.data_mut().get_mut(..ETH_HDR_LEN)?;
    eth[0..6].copy_from_slice(&dst_mac.0);
    eth[6..12].copy_from_slice(&next_hop.mac.0);
    eth[12..14].copy_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());
    Some(())
}

/// Build the Ethernet header of every active packet.  Packets with no next hop are
/// dropped.
pub fn update_nexthop_info(batch: &mut Batch, port: u8, table: &NextHopTable) {
    let n = batch.len();
    for i in batch.mask.iter().filter(|i| *i < n) {
        if construct_ether_hdr(batch.pkt_mut(i), port, table).is_none() {
            batch.mask.clear(i);
        }
    }
}
