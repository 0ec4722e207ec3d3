mod batch;
mod charging;
mod dns;
mod fabric;
mod gate;
mod headers;
mod meter;
mod nexthop;
mod sponsored_dns;
mod tunnel;
mod worker;

pub use batch::{Batch, MAX_BURST_SZ, PacketBuf, PacketMeta, PktMask};
pub use charging::{
    charged_len, update_adc_cdr, update_bear_cdr, update_rating_grp_cdr, update_sdf_cdr,
};
pub use dns::{
    DNS_RULE_ID, DnsSideChannel, MAX_ADC_RULES, clone_dns_pkts, is_dns_pkt, update_dns_meta,
};
pub use fabric::{FabricError, KeyedStore, ResolutionFabric};
pub use gate::{adc_gating, merge_adc_rule_ids, pcc_gating, rating_groups};
pub use headers::{Ipv4Hdr, UdpHdr, ipv4_checksum};
pub use meter::{Metering, apn_meters, apply_meters, sdf_meters};
pub use nexthop::{NextHopTable, PortNextHop, construct_ether_hdr, update_nexthop_info};
pub use sponsored_dns::{SponsoredDnsError, SponsoredDomains, run_dns_consumer};
pub use tunnel::{TunnelHeader, decapsulate, encapsulate, gtpu_decap, gtpu_encap};
pub use worker::{
    DownlinkCounters, SharedTables, UplinkCounters, Worker, downlink_counter_indices,
    dump_stats, uplink_counter_indices,
};

const ETH_HDR_LEN: usize = 14;
const ETHER_TYPE_IPV4: u16 = 0x0800;
const IPV4_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;
const GTPU_HDR_LEN: usize = 8;
const GTPU_OPT_HDR_LEN: usize = 4; // sequence number, N-PDU number, next extension type
const GTPU_OUTER_LEN: usize = IPV4_HDR_LEN + UDP_HDR_LEN + GTPU_HDR_LEN;
const GTP_MESSAGE_TYPE_GPDU: u8 = 255; // TS29.281, table 6.1-1
const GTPU_PORT: u16 = 2152; // TS29.281
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;
const DNS_PORT: u16 = 53;
