use anyhow::Result;
use dataplane::{
    BearerSession, Batch, Config, Dataplane, MacAddr, PacketBuf, PortConfig,
    SponsoredDomainConfig,
};
use slog::{Drain, Logger, o};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub const S1U_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 1);
pub const ENB_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 20);
pub const UE_IP: Ipv4Addr = Ipv4Addr::new(10, 45, 0, 2);
pub const PDN_SERVER_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);
pub const DNS_SERVER_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 53);
pub const S1U_PORT: u8 = 0;
pub const SGI_PORT: u8 = 1;
pub const S1U_MAC: [u8; 6] = [0x02, 0, 0, 0, 0x01, 0x01];
pub const ENB_MAC: [u8; 6] = [0x02, 0, 0, 0, 0x01, 0x14];
pub const SGI_MAC: [u8; 6] = [0x02, 0, 0, 0, 0x02, 0x01];
pub const PDN_GW_MAC: [u8; 6] = [0x02, 0, 0, 0, 0x02, 0xfe];

pub const SGW_TEID: u32 = 0x0000_0101;
pub const ENB_TEID: u32 = 0x0000_0a01;
pub const CATCH_ALL_RULE: u32 = 1;
pub const TEST_UDP_PORT: u16 = 23215;

pub fn init_logging() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build();
    let drain = std::sync::Mutex::new(drain).fuse();
    let drain = slog_envlogger::new(drain);
    slog::Logger::root(drain, o!())
}

/// Two ports: S1-U with the eNB as a static neighbor, and SGi with a default gateway.
pub fn test_config() -> Config {
    let mut config = Config::new(S1U_IP, S1U_PORT, SGI_PORT);
    let mut neighbors = HashMap::new();
    neighbors.insert(ENB_IP.to_string(), MacAddr(ENB_MAC));
    config.ports = vec![
        PortConfig {
            port_id: S1U_PORT,
            mac: MacAddr(S1U_MAC),
            gateway_mac: None,
            neighbors,
        },
        PortConfig {
            port_id: SGI_PORT,
            mac: MacAddr(SGI_MAC),
            gateway_mac: Some(MacAddr(PDN_GW_MAC)),
            neighbors: HashMap::new(),
        },
    ];
    config.dns_servers = vec![DNS_SERVER_IP];
    config
}

pub fn sponsored(name: &str, rule_id: u32) -> SponsoredDomainConfig {
    SponsoredDomainConfig {
        name: name.to_string(),
        rule_id,
        gate: dataplane::GateStatus::Open,
        rating_group: 0,
    }
}

pub fn init(config: Config) -> Result<(Dataplane, Logger)> {
    let logger = init_logging();
    let dp = Dataplane::new(config, None, logger.new(o!("dataplane" => 1)))?;
    Ok((dp, logger))
}

/// Provision UE_IP with one bearer on the catch-all rule.  `enb_teid` of None leaves
/// the bearer without a downlink tunnel.
pub fn attach(
    dp: &Dataplane,
    rating_groups: &[u32],
    enb_teid: Option<u32>,
) -> Result<Arc<BearerSession>> {
    let control = dp.control();
    control.create_session(UE_IP, rating_groups, None)?;
    let bearer = control.create_bearer(UE_IP, 5, SGW_TEID)?;
    if let Some(enb_teid) = enb_teid {
        control.modify_bearer(SGW_TEID, enb_teid, ENB_IP)?;
    }
    control.add_sdf(SGW_TEID, CATCH_ALL_RULE)?;
    Ok(bearer)
}

pub fn batch_of(frames: &[Vec<u8>]) -> Batch {
    let (batch, _rest) = Batch::new(frames.iter().map(|f| PacketBuf::from_frame(f)).collect());
    batch
}

/// An uplink frame from the UE to `dst`, tunnelled by the eNB.
pub fn uplink_frame(teid: u32, dst: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let inner = crate::ipv4_udp(UE_IP, dst, TEST_UDP_PORT, dst_port, payload);
    let outer = crate::gtpu_packet(ENB_IP, S1U_IP, crate::GTPU_PORT, teid, &inner);
    crate::eth_frame(S1U_MAC, ENB_MAC, &outer)
}

/// A downlink frame from `src` to the UE, as it arrives on the SGi port.
pub fn downlink_frame(src: Ipv4Addr, src_port: u16, payload: &[u8]) -> Vec<u8> {
    let ip = crate::ipv4_udp(src, UE_IP, src_port, TEST_UDP_PORT, payload);
    crate::eth_frame(SGI_MAC, PDN_GW_MAC, &ip)
}
