//! contexts - per-subscriber state that the pipeline resolves packets to
//!
//! The control path owns these.  Workers get shared references for the length of one
//! batch and must resolve again on the next one.

use super::cdr::Cdr;
use atomic_counter::{AtomicCounter, RelaxedCounter};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Number of rating group buckets held per subscriber.
pub const MAX_RATING_GRP: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Open,
    Closed,
}

/// Gate status that the control path can flip while workers read it.
#[derive(Debug)]
struct Gate(AtomicBool);

impl Gate {
    fn new(status: GateStatus) -> Self {
        Gate(AtomicBool::new(status == GateStatus::Closed))
    }
    fn status(&self) -> GateStatus {
        if self.0.load(Ordering::Relaxed) {
            GateStatus::Closed
        } else {
            GateStatus::Open
        }
    }
    fn set(&self, status: GateStatus) {
        self.0.store(status == GateStatus::Closed, Ordering::Relaxed)
    }
}

/// Policy and charging control rule, as bound to one service data flow.
#[derive(Debug)]
pub struct PccRule {
    pub rule_id: u32,
    pub rating_group: u32,
    gate: Gate,
    drop_pkt_count: RelaxedCounter,
}

impl PccRule {
    pub fn new(rule_id: u32, gate_status: GateStatus, rating_group: u32) -> Self {
        PccRule {
            rule_id,
            rating_group,
            gate: Gate::new(gate_status),
            drop_pkt_count: RelaxedCounter::new(0),
        }
    }
    pub fn gate_status(&self) -> GateStatus {
        self.gate.status()
    }
    pub fn set_gate_status(&self, status: GateStatus) {
        self.gate.set(status)
    }
    pub fn drop_pkt_count(&self) -> usize {
        self.drop_pkt_count.get()
    }
    pub(crate) fn record_drop(&self) {
        self.drop_pkt_count.inc();
    }
}

/// Application detection rule, found by the address the subscriber is talking to.
#[derive(Debug)]
pub struct AdcRule {
    pub rule_id: u32,
    pub rating_group: u32,
    gate: Gate,
    drop_pkt_count: RelaxedCounter,
}

impl AdcRule {
    pub fn new(rule_id: u32, gate_status: GateStatus, rating_group: u32) -> Self {
        AdcRule {
            rule_id,
            rating_group,
            gate: Gate::new(gate_status),
            drop_pkt_count: RelaxedCounter::new(0),
        }
    }
    pub fn gate_status(&self) -> GateStatus {
        self.gate.status()
    }
    pub fn set_gate_status(&self, status: GateStatus) {
        self.gate.set(status)
    }
    pub fn drop_pkt_count(&self) -> usize {
        self.drop_pkt_count.get()
    }
    pub(crate) fn record_drop(&self) {
        self.drop_pkt_count.inc();
    }
}

/// Per-subscriber application detection state.
#[derive(Debug, Default)]
pub struct AdcUeInfo {
    pub rating_group: u32,
    pub adc_cdr: Cdr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MeterProfile {
    /// Committed information rate, bytes per second.
    pub cir: u64,
    /// Committed burst size, bytes.
    pub cbs: u64,
    /// Excess burst size, bytes.
    pub ebs: u64,
}

/// A metering handle.  The algorithm behind it lives outside the pipeline; the
/// pipeline only carries the handle to it and keeps the drop count.
#[derive(Debug)]
pub struct MeterHandle {
    pub meter_id: u32,
    pub profile: MeterProfile,
    drops: RelaxedCounter,
}

impl MeterHandle {
    pub fn new(meter_id: u32, profile: MeterProfile) -> Self {
        MeterHandle {
            meter_id,
            profile,
            drops: RelaxedCounter::new(0),
        }
    }
    pub fn drops(&self) -> usize {
        self.drops.get()
    }
    pub(crate) fn record_drop(&self) {
        self.drops.inc();
    }
}

/// Subscriber record shared by all of a subscriber's bearers.
#[derive(Debug)]
pub struct UeSession {
    pub ue_ipv4: Ipv4Addr,
    pub apn_meter: Option<MeterHandle>,
    rg_idx_map: [u32; MAX_RATING_GRP],
    rating_grp: [Cdr; MAX_RATING_GRP],
}

impl UeSession {
    /// Rating groups beyond MAX_RATING_GRP are ignored, as is the value 0.
    pub fn new(ue_ipv4: Ipv4Addr, rating_groups: &[u32], apn_meter: Option<MeterHandle>) -> Self {
        let mut rg_idx_map = [0; MAX_RATING_GRP];
        for (slot, rg) in rg_idx_map
            .iter_mut()
            .zip(rating_groups.iter().filter(|rg| **rg != 0))
        {
            *slot = *rg;
        }
        UeSession {
            ue_ipv4,
            apn_meter,
            rg_idx_map,
            rating_grp: Default::default(),
        }
    }

    /// Map a rating group value to its bucket.  None for 0 or an unknown value.
    pub fn rating_group_index(&self, rating_group: u32) -> Option<usize> {
        if rating_group == 0 {
            return None;
        }
        self.rg_idx_map.iter().position(|rg| *rg == rating_group)
    }

    pub fn rating_group_cdr(&self, idx: usize) -> Option<&Cdr> {
        self.rating_grp.get(idx)
    }
}

/// The eNB end of a bearer's S1-U tunnel.  Zero TEID means not yet known.
// TEID in the high half, eNB address in the low half, so that both change together.
// A TEID of 0 means no tunnel.
#[derive(Debug, Default)]
struct DownlinkTunnel(AtomicU64);

impl DownlinkTunnel {
    fn store(&self, enb_teid: u32, enb_ipv4: Ipv4Addr) {
        let packed = (u64::from(enb_teid) << 32) | u64::from(u32::from(enb_ipv4));
        self.0.store(packed, Ordering::Release);
    }

    fn load(&self) -> Option<(u32, Ipv4Addr)> {
        let packed = self.0.load(Ordering::Acquire);
        let teid = (packed >> 32) as u32;
        (teid != 0).then(|| (teid, Ipv4Addr::from(packed as u32)))
    }
}

#[derive(Debug)]
pub struct BearerSession {
    pub ue: Arc<UeSession>,
    pub ebi: u8,
    pub s1u_sgw_teid: u32,
    pub bearer_cdr: Cdr,
    dl_tunnel: DownlinkTunnel,
}

impl BearerSession {
    pub fn new(ue: Arc<UeSession>, ebi: u8, s1u_sgw_teid: u32) -> Self {
        BearerSession {
            ue,
            ebi,
            s1u_sgw_teid,
            bearer_cdr: Cdr::default(),
            dl_tunnel: DownlinkTunnel::default(),
        }
    }

    pub fn set_downlink_tunnel(&self, enb_teid: u32, enb_ipv4: Ipv4Addr) {
        self.dl_tunnel.store(enb_teid, enb_ipv4);
    }

    /// The downlink tunnel, or None if the eNB TEID has not been signaled yet.
    pub fn downlink_tunnel(&self) -> Option<(u32, Ipv4Addr)> {
        self.dl_tunnel.load()
    }
}

/// One service data flow on one bearer.
#[derive(Debug)]
pub struct SdfBearerContext {
    pub pcc: PccRule,
    pub sdf_cdr: Cdr,
    pub bearer: Arc<BearerSession>,
    pub sdf_meter: Option<MeterHandle>,
}

impl SdfBearerContext {
    pub fn new(pcc: PccRule, bearer: Arc<BearerSession>, sdf_meter: Option<MeterHandle>) -> Self {
        SdfBearerContext {
            pcc,
            sdf_cdr: Cdr::default(),
            bearer,
            sdf_meter,
        }
    }
}

/// Uplink resolution key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UlKey {
    pub s1u_sgw_teid: u32,
    pub rid: u32,
}

/// Downlink (and per-subscriber ADC) resolution key.  The address is held in host
/// byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DlKey {
    pub ue_ipv4: u32,
    pub rid: u32,
}

/// ADC domain key: the IPv4 address matched, host byte order.
pub type AdcDomainKey = u32;

/// Generic session key: the subscriber IPv4 address, host byte order.
pub type UeKey = u32;
