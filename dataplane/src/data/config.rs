use super::contexts::{GateStatus, MeterProfile};
use anyhow::{Context, Result};
use serde::Deserialize;
use slog::{Logger, error, info};
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;

const LDB_ENTRIES_DEFAULT: usize = 1024 * 512;
const HASH_SIZE_FACTOR: usize = 4;
const DEFAULT_DN_NUM: usize = 512;
const DEFAULT_MAX_FILTERS: usize = 1024;
const DEFAULT_DNS_RING_DEPTH: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Our end of the S1-U tunnels.  Uplink GTP-U must be addressed here and
    // downlink GTP-U is sourced from here.
    pub s1u_ip: Ipv4Addr,

    // Egress ports for downlink (towards the eNBs) and uplink (towards the PDN).
    pub s1u_port: u8,
    pub sgi_port: u8,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub capacities: StoreCapacities,

    #[serde(default)]
    pub capabilities: Capabilities,

    // Depth of the channel carrying DNS clones off the workers.
    #[serde(default = "default_dns_ring_depth")]
    pub dns_ring_depth: usize,

    #[serde(default)]
    pub ports: Vec<PortConfig>,

    // Optional TOML file of static packet filters.
    pub filter_file: Option<String>,

    // DNS servers.  Traffic to and from these is classified under DNS_RULE_ID.
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,

    #[serde(default)]
    pub sponsored_domains: Vec<SponsoredDomainConfig>,

    #[serde(default)]
    pub meters: Vec<MeterConfig>,
}

impl Config {
    pub fn new(s1u_ip: Ipv4Addr, s1u_port: u8, sgi_port: u8) -> Self {
        Config {
            s1u_ip,
            s1u_port,
            sgi_port,
            workers: default_workers(),
            capacities: StoreCapacities::default(),
            capabilities: Capabilities::default(),
            dns_ring_depth: default_dns_ring_depth(),
            ports: vec![],
            filter_file: None,
            dns_servers: vec![],
            sponsored_domains: vec![],
            meters: vec![],
        }
    }
}

fn default_workers() -> usize {
    1
}

fn default_dns_ring_depth() -> usize {
    DEFAULT_DNS_RING_DEPTH
}

/// Fixed capacities of the keyed stores, set once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreCapacities {
    pub uplink: usize,
    pub downlink: usize,
    pub adc_domain: usize,
    pub adc_ue: usize,
    pub ue_sessions: usize,
    pub sponsored_domains: usize,
    pub filters: usize,
}

impl Default for StoreCapacities {
    fn default() -> Self {
        StoreCapacities {
            uplink: LDB_ENTRIES_DEFAULT * HASH_SIZE_FACTOR,
            downlink: LDB_ENTRIES_DEFAULT * HASH_SIZE_FACTOR,
            adc_domain: LDB_ENTRIES_DEFAULT,
            adc_ue: LDB_ENTRIES_DEFAULT,
            ue_sessions: LDB_ENTRIES_DEFAULT,
            sponsored_domains: DEFAULT_DN_NUM,
            filters: DEFAULT_MAX_FILTERS,
        }
    }
}

/// Optional pipeline stages.  Resolved once when the workers are built.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub adc: bool,
    pub sdf_metering: bool,
    pub apn_metering: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            adc: true,
            sdf_metering: false,
            apn_metering: false,
        }
    }
}

/// An Ethernet MAC address, written in config as a 12 digit hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct MacAddr(#[serde(with = "hex")] pub [u8; 6]);

#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    pub port_id: u8,
    pub mac: MacAddr,

    // Next hop for any destination not listed in `neighbors`.
    pub gateway_mac: Option<MacAddr>,

    // Statically resolved neighbors, keyed by dotted decimal IPv4 address.
    #[serde(default)]
    pub neighbors: HashMap<String, MacAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SponsoredDomainConfig {
    pub name: String,
    pub rule_id: u32,
    #[serde(default = "default_gate")]
    pub gate: GateStatus,
    #[serde(default)]
    pub rating_group: u32,
}

/// A meter profile provisioned at startup.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MeterConfig {
    pub meter_id: u32,
    #[serde(flatten)]
    pub profile: MeterProfile,
}

fn default_gate() -> GateStatus {
    GateStatus::Open
}

pub fn load_config_file(filename: &str, logger: &Logger) -> Result<Config> {
    let path = std::env::current_dir()?;
    let contents = fs::read_to_string(filename).inspect_err(|e| {
        error!(
            logger,
            "Failed to load config file {filename} (current directory {}) with error code {e}",
            path.display()
        )
    })?;
    let config: Config =
        toml::from_str(&contents).context(format!("Failed to parse {filename}"))?;
    info!(logger, "Loaded config from {filename}");
    Ok(config)
}
