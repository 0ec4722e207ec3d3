//! packet_filter - TS24.008 traffic flow template packet filters

use super::cdr::Flow;
use anyhow::Result;
use serde::Deserialize;
use slog::{Logger, error, info};
use std::fs;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const FIRST_FILTER_ID: u16 = 1;

/// Precedence of the catch-all.  No other filter may use it.
pub const CATCH_ALL_PRECEDENCE: u32 = u32::MAX;

/// Precedence of a filter that does not give one: the lowest a TFT can signal.
pub const DEFAULT_PRECEDENCE: u32 = 255;

/// TFT packet filter direction, TS24.008 table 10.5.162.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    DownlinkOnly,
    UplinkOnly,
    Bidirectional,
}

impl Direction {
    pub fn tft_value(self) -> u8 {
        match self {
            Direction::DownlinkOnly => 1,
            Direction::UplinkOnly => 2,
            Direction::Bidirectional => 3,
        }
    }

    fn applies_to(self, flow: Flow) -> bool {
        match self {
            Direction::Bidirectional => true,
            Direction::UplinkOnly => flow == Flow::Uplink,
            Direction::DownlinkOnly => flow == Flow::Downlink,
        }
    }
}

/// A packet filter.  Missing fields in a filter file take the catch-all values, so
/// an empty table matches everything, except for the precedence, which defaults to
/// DEFAULT_PRECEDENCE so that the filter still wins over the catch-all.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PacketFilter {
    pub direction: Direction,
    #[serde(default = "default_precedence")]
    pub precedence: u32,
    pub remote_ip_addr: Ipv4Addr,
    pub remote_ip_mask: u8,
    pub remote_port_low: u16,
    pub remote_port_high: u16,
    pub proto: u8,
    pub proto_mask: u8,
    pub local_ip_addr: Ipv4Addr,
    pub local_ip_mask: u8,
    pub local_port_low: u16,
    pub local_port_high: u16,
    pub rating_group: u16,
}

impl PacketFilter {
    /// The filter that accepts every packet, at the lowest precedence.
    pub fn catch_all() -> Self {
        PacketFilter {
            direction: Direction::Bidirectional,
            precedence: CATCH_ALL_PRECEDENCE,
            remote_ip_addr: Ipv4Addr::UNSPECIFIED,
            remote_ip_mask: 0,
            remote_port_low: 0,
            remote_port_high: u16::MAX,
            proto: 0,
            proto_mask: 0,
            local_ip_addr: Ipv4Addr::UNSPECIFIED,
            local_ip_mask: 0,
            local_port_low: 0,
            local_port_high: u16::MAX,
            rating_group: 0,
        }
    }

    /// Does this filter accept a packet travelling in `flow`?  The local end is the
    /// subscriber: the source on uplink and the destination on downlink.
    pub fn matches(&self, tuple: &FlowTuple, flow: Flow) -> bool {
        if !self.direction.applies_to(flow) {
            return false;
        }
        let (local_ip, local_port, remote_ip, remote_port) = match flow {
            Flow::Uplink => (tuple.src_ip, tuple.src_port, tuple.dst_ip, tuple.dst_port),
            Flow::Downlink => (tuple.dst_ip, tuple.dst_port, tuple.src_ip, tuple.src_port),
        };
        prefix_match(self.local_ip_addr, self.local_ip_mask, local_ip)
            && prefix_match(self.remote_ip_addr, self.remote_ip_mask, remote_ip)
            && (self.local_port_low..=self.local_port_high).contains(&local_port)
            && (self.remote_port_low..=self.remote_port_high).contains(&remote_port)
            && (tuple.proto & self.proto_mask) == (self.proto & self.proto_mask)
    }
}

fn default_precedence() -> u32 {
    DEFAULT_PRECEDENCE
}

impl Default for PacketFilter {
    fn default() -> Self {
        PacketFilter::catch_all()
    }
}

fn prefix_match(net: Ipv4Addr, prefix_len: u8, addr: Ipv4Addr) -> bool {
    let mask = match prefix_len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => u32::MAX << (32 - n),
    };
    (u32::from(net) & mask) == (u32::from(addr) & mask)
}

/// The fields of a packet that filters look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Packet filter store is full (capacity {0})")]
    CapacityExceeded(usize),

    #[error("No packet filter with index {0}")]
    NotFound(u16),

    #[error("Precedence {0} is reserved for the catch-all filter")]
    ReservedPrecedence(u32),
}

/// The installed packet filters.  Built and populated before the first packet, then
/// shared read-only between workers.
#[derive(Debug)]
pub struct FilterStore {
    filters: Vec<PacketFilter>,
    capacity: usize,
}

impl FilterStore {
    /// Create a store.  The catch-all filter goes in first, at FIRST_FILTER_ID, so
    /// every packet matches something.
    pub fn new(capacity: usize) -> Result<Self, FilterError> {
        let mut store = FilterStore {
            filters: Vec::with_capacity(capacity),
            capacity,
        };
        store.install(PacketFilter::catch_all())?;
        Ok(store)
    }

    pub fn install(&mut self, filter: PacketFilter) -> Result<u16, FilterError> {
        if self.filters.len() >= self.capacity || self.filters.len() >= u16::MAX as usize {
            return Err(FilterError::CapacityExceeded(self.capacity));
        }
        if filter.precedence == CATCH_ALL_PRECEDENCE && filter != PacketFilter::catch_all() {
            return Err(FilterError::ReservedPrecedence(filter.precedence));
        }
        self.filters.push(filter);
        Ok(self.filters.len() as u16 - 1 + FIRST_FILTER_ID)
    }

    pub fn get(&self, index: u16) -> Result<&PacketFilter, FilterError> {
        index
            .checked_sub(FIRST_FILTER_ID)
            .and_then(|slot| self.filters.get(slot as usize))
            .ok_or(FilterError::NotFound(index))
    }

    pub fn direction(&self, index: u16) -> Result<Direction, FilterError> {
        Ok(self.get(index)?.direction)
    }

    /// Overwrite a slot with the catch-all filter.
    pub fn reset(&mut self, index: u16) -> Result<(), FilterError> {
        let slot = index
            .checked_sub(FIRST_FILTER_ID)
            .and_then(|slot| self.filters.get_mut(slot as usize))
            .ok_or(FilterError::NotFound(index))?;
        *slot = PacketFilter::catch_all();
        Ok(())
    }

    /// Index of the first installed filter equal to `filter`.
    pub fn find(&self, filter: &PacketFilter) -> Option<u16> {
        self.filters
            .iter()
            .position(|f| f == filter)
            .map(|slot| slot as u16 + FIRST_FILTER_ID)
    }

    /// Index of the matching filter with the lowest precedence value.  Ties go to
    /// the lower index.
    pub fn classify(&self, tuple: &FlowTuple, flow: Flow) -> u16 {
        self.iter()
            .filter(|(_, f)| f.matches(tuple, flow))
            .min_by_key(|(index, f)| (f.precedence, *index))
            .map(|(index, _)| index)
            .unwrap_or(FIRST_FILTER_ID)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &PacketFilter)> {
        self.filters
            .iter()
            .enumerate()
            .map(|(slot, f)| (slot as u16 + FIRST_FILTER_ID, f))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[derive(Deserialize)]
struct FilterFile {
    #[serde(default)]
    filter: Vec<PacketFilter>,
}

/// Load static packet filters from a TOML file of `[[filter]]` tables.
pub fn load_filters_file(filename: &str, logger: &Logger) -> Result<Vec<PacketFilter>> {
    let contents = fs::read_to_string(filename).inspect_err(|e| {
        error!(
            logger,
            "Failed to load packet filter file {filename} with error code {e}"
        )
    })?;
    let file: FilterFile = toml::from_str(&contents)?;
    info!(
        logger,
        "Loaded {} packet filters from {filename}",
        file.filter.len()
    );
    Ok(file.filter)
}
