//! worker - runs a batch through every uplink or downlink stage
//!
//! A worker owns no shared mutable state of its own apart from its counters.  It
//! resolves against the shared fabric on every batch and keeps the results in
//! stack arrays sized to MAX_BURST_SZ for the length of that batch.

use super::batch::{Batch, MAX_BURST_SZ, PacketBuf, PktMask};
use super::charging::{update_adc_cdr, update_bear_cdr, update_rating_grp_cdr, update_sdf_cdr};
use super::dns::{DnsSideChannel, update_dns_meta};
use super::fabric::ResolutionFabric;
use super::gate::{adc_gating, merge_adc_rule_ids, pcc_gating, rating_groups};
use super::headers::Ipv4Hdr;
use super::meter::{Metering, apn_meters, apply_meters, sdf_meters};
use super::nexthop::{NextHopTable, update_nexthop_info};
use super::tunnel::{gtpu_decap, gtpu_encap};
use crate::{
    AdcRule, AdcUeInfo, BearerSession, Capabilities, Config, FilterStore, Flow, MeterHandle,
    SdfBearerContext,
};
use async_channel::Sender;
use atomic_counter::{AtomicCounter, RelaxedCounter};
use derive_deref::Deref;
use slog::{Logger, info, o, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

pub mod uplink_counter_indices {
    pub const UL_RX_PKTS: usize = 0;
    pub const UL_RX_BYTES: usize = 1;
    pub const UL_TX_PKTS: usize = 2;
    pub const UL_TX_BYTES: usize = 3;
    pub const UL_DROP_DECAP: usize = 4;
    pub const UL_DROP_NOT_IPV4: usize = 5;
    pub const UL_DROP_NO_BEARER: usize = 6;
    pub const UL_DROP_GATED: usize = 7;
    pub const UL_DROP_METERED: usize = 8;
    pub const UL_DROP_NO_NEXT_HOP: usize = 9;
    pub const UL_NUM_COUNTERS: usize = 10;
}

pub mod downlink_counter_indices {
    pub const DL_RX_PKTS: usize = 0;
    pub const DL_RX_BYTES: usize = 1;
    pub const DL_TX_PKTS: usize = 2;
    pub const DL_TX_BYTES: usize = 3;
    pub const DL_QUEUED: usize = 4;
    pub const DL_DROP_NOT_IPV4: usize = 5;
    pub const DL_DROP_NO_BEARER: usize = 6;
    pub const DL_DROP_GATED: usize = 7;
    pub const DL_DROP_METERED: usize = 8;
    pub const DL_DROP_ENCAP: usize = 9;
    pub const DL_DROP_NO_NEXT_HOP: usize = 10;
    pub const DL_NUM_COUNTERS: usize = 11;
}

use downlink_counter_indices::*;
use uplink_counter_indices::*;

#[derive(Default, Deref)]
pub struct UplinkCounters([RelaxedCounter; UL_NUM_COUNTERS]);

#[derive(Default, Deref)]
pub struct DownlinkCounters([RelaxedCounter; DL_NUM_COUNTERS]);

/// Tables shared read-only by all workers.
#[derive(Clone)]
pub struct SharedTables {
    pub filters: Arc<FilterStore>,
    pub fabric: Arc<ResolutionFabric>,
    pub next_hops: Arc<NextHopTable>,
}

type Contexts<T> = [Option<Arc<T>>; MAX_BURST_SZ];

// What the resolution stages found for one batch.
struct Resolved {
    sdf_rids: [u32; MAX_BURST_SZ],
    rids: [u32; MAX_BURST_SZ],
    adc_rules: Contexts<AdcRule>,
    adc_ue: Contexts<AdcUeInfo>,
    sdf: Contexts<SdfBearerContext>,
}

impl Default for Resolved {
    fn default() -> Self {
        Resolved {
            sdf_rids: [0; MAX_BURST_SZ],
            rids: [0; MAX_BURST_SZ],
            adc_rules: Default::default(),
            adc_ue: Default::default(),
            sdf: Default::default(),
        }
    }
}

// Run a stage and return the number of packets it dropped.  A stage may only clear
// forwarding bits.
fn narrowing(batch: &mut Batch, stage: impl FnOnce(&mut Batch)) -> usize {
    let before = batch.mask;
    stage(batch);
    debug_assert!(
        batch.mask.is_subset_of(&before),
        "stage set a forwarding bit: {:#b} -> {:#b}",
        before.bits(),
        batch.mask.bits()
    );
    before.count().saturating_sub(batch.mask.count())
}

// Run a stage and count the packets it dropped.
fn counted(counter: &RelaxedCounter, batch: &mut Batch, stage: impl FnOnce(&mut Batch)) {
    counter.add(narrowing(batch, stage));
}

fn forwarded_bytes(batch: &Batch) -> usize {
    batch
        .mask
        .iter()
        .filter(|i| *i < batch.len())
        .map(|i| batch.pkt(i).len())
        .sum()
}

pub struct Worker {
    id: usize,
    s1u_ip: Ipv4Addr,
    s1u_port: u8,
    sgi_port: u8,
    capabilities: Capabilities,
    tables: SharedTables,
    metering: Option<Arc<dyn Metering>>,
    dns: DnsSideChannel,
    ul_counters: UplinkCounters,
    dl_counters: DownlinkCounters,
    logger: Logger,
}

impl Worker {
    pub fn new(
        id: usize,
        config: &Config,
        tables: SharedTables,
        metering: Option<Arc<dyn Metering>>,
        dns_tx: Sender<PacketBuf>,
        logger: &Logger,
    ) -> Self {
        Worker {
            id,
            s1u_ip: config.s1u_ip,
            s1u_port: config.s1u_port,
            sgi_port: config.sgi_port,
            capabilities: config.capabilities,
            tables,
            metering,
            dns: DnsSideChannel::new(dns_tx),
            ul_counters: UplinkCounters::default(),
            dl_counters: DownlinkCounters::default(),
            logger: logger.new(o!("worker" => id)),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }
    pub fn ul_counters(&self) -> &UplinkCounters {
        &self.ul_counters
    }
    pub fn dl_counters(&self) -> &DownlinkCounters {
        &self.dl_counters
    }
    pub fn dns(&self) -> &DnsSideChannel {
        &self.dns
    }

    /// S1-U to SGi.  On return the mask holds the packets to transmit on the SGi port,
    /// decapsulated and with their Ethernet header rebuilt.
    pub fn process_uplink(&self, batch: &mut Batch) {
        let c = &self.ul_counters;
        c[UL_RX_PKTS].add(batch.len());
        c[UL_RX_BYTES].add(batch.bytes());

        counted(&c[UL_DROP_DECAP], batch, |b| gtpu_decap(b, self.s1u_ip));

        let mut r = Resolved::default();
        counted(&c[UL_DROP_NOT_IPV4], batch, |b| {
            self.classify(b, Flow::Uplink, &mut r.sdf_rids)
        });
        self.resolve(batch, Flow::Uplink, &mut r);
        counted(&c[UL_DROP_NO_BEARER], batch, |b| {
            self.tables.fabric.uplink_bearer_lookup(b, &r.sdf_rids, &mut r.sdf)
        });

        let adc_mask = self.police(batch, &r, &c[UL_DROP_GATED], &c[UL_DROP_METERED]);
        narrowing(batch, |b| self.charge(b, &r, &adc_mask, Flow::Uplink));

        counted(&c[UL_DROP_NO_NEXT_HOP], batch, |b| {
            update_nexthop_info(b, self.sgi_port, &self.tables.next_hops)
        });
        c[UL_TX_PKTS].add(batch.mask.count());
        c[UL_TX_BYTES].add(forwarded_bytes(batch));
    }

    /// SGi to S1-U.  On return the mask holds the packets to transmit on the S1-U port,
    /// encapsulated towards their eNB.  The returned mask holds the packets whose
    /// bearer has no downlink tunnel yet, for the caller to buffer.
    pub fn process_downlink(&self, batch: &mut Batch) -> PktMask {
        let c = &self.dl_counters;
        c[DL_RX_PKTS].add(batch.len());
        c[DL_RX_BYTES].add(batch.bytes());

        let mut r = Resolved::default();
        let mut sessions: Contexts<BearerSession> = Default::default();
        counted(&c[DL_DROP_NOT_IPV4], batch, |b| {
            self.classify(b, Flow::Downlink, &mut r.sdf_rids)
        });
        self.resolve(batch, Flow::Downlink, &mut r);
        counted(&c[DL_DROP_NO_BEARER], batch, |b| {
            self.tables
                .fabric
                .downlink_bearer_lookup(b, &r.sdf_rids, &mut r.sdf, &mut sessions)
        });

        let adc_mask = self.police(batch, &r, &c[DL_DROP_GATED], &c[DL_DROP_METERED]);
        narrowing(batch, |b| self.charge(b, &r, &adc_mask, Flow::Downlink));

        let mut queue_mask = PktMask::default();
        let removed = narrowing(batch, |b| {
            gtpu_encap(&sessions, b, self.s1u_ip, &mut queue_mask)
        });
        c[DL_QUEUED].add(queue_mask.count());
        c[DL_DROP_ENCAP].add(removed.saturating_sub(queue_mask.count()));

        counted(&c[DL_DROP_NO_NEXT_HOP], batch, |b| {
            update_nexthop_info(b, self.s1u_port, &self.tables.next_hops)
        });
        c[DL_TX_PKTS].add(batch.mask.count());
        c[DL_TX_BYTES].add(forwarded_bytes(batch));
        queue_mask
    }

    // Find the filter each packet falls under.  Packets that are not IPv4 are dropped.
    fn classify(&self, batch: &mut Batch, flow: Flow, rids: &mut [u32]) {
        for i in 0..batch.len() {
            if !batch.mask.is_set(i) {
                continue;
            }
            match Ipv4Hdr::new(batch.pkt(i).l3()) {
                Some(ip) => rids[i] = self.tables.filters.classify(&ip.flow_tuple(), flow) as u32,
                None => batch.mask.clear(i),
            }
        }
    }

    // ADC resolution.  Leaves `r.rids` as the SDF rule ids overridden by any ADC rule.
    fn resolve(&self, batch: &Batch, flow: Flow, r: &mut Resolved) {
        r.rids = r.sdf_rids;
        if !self.capabilities.adc {
            return;
        }
        let fabric = &self.tables.fabric;
        let mut adc_rids = [0u32; MAX_BURST_SZ];
        fabric.adc_domain_lookup(batch, flow, &mut adc_rids, &mut r.adc_rules);
        fabric.adc_ue_lookup(batch, &adc_rids, flow, &mut r.adc_ue);
        merge_adc_rule_ids(&mut r.rids, &adc_rids);
    }

    // Gates and meters.  Returns the ADC mask.
    fn police(
        &self,
        batch: &mut Batch,
        r: &Resolved,
        gated: &RelaxedCounter,
        metered: &RelaxedCounter,
    ) -> PktMask {
        let mut adc_mask = PktMask::default();
        counted(gated, batch, |b| {
            pcc_gating(&r.sdf, &mut b.mask);
            if self.capabilities.adc {
                adc_gating(&r.adc_rules, &mut b.mask, &mut adc_mask);
            }
        });

        if let Some(metering) = &self.metering {
            let mut meters: [Option<&MeterHandle>; MAX_BURST_SZ] = [None; MAX_BURST_SZ];
            counted(metered, batch, |b| {
                if self.capabilities.sdf_metering {
                    sdf_meters(&r.sdf, &b.mask, &mut meters);
                    apply_meters(&meters, b, metering.as_ref());
                }
                if self.capabilities.apn_metering {
                    apn_meters(&r.sdf, &b.mask, &mut meters);
                    apply_meters(&meters, b, metering.as_ref());
                }
            });
        }
        adc_mask
    }

    // DNS classification, the charging ledger and the DNS side channel.
    fn charge(&self, batch: &mut Batch, r: &Resolved, adc_mask: &PktMask, flow: Flow) {
        update_dns_meta(batch, &r.rids);

        let mut rgs = [None; MAX_BURST_SZ];
        rating_groups(&r.adc_ue, &r.sdf, &mut rgs);
        if self.capabilities.adc {
            update_adc_cdr(&r.adc_ue, batch, adc_mask, flow);
        }
        update_sdf_cdr(&r.adc_ue, &r.sdf, batch, flow);
        update_bear_cdr(&r.sdf, batch, flow);
        update_rating_grp_cdr(&r.sdf, &rgs, batch, flow);

        self.dns.clone_dns_pkts(batch);
    }
}

struct Totals {
    ul: [usize; UL_NUM_COUNTERS],
    dl: [usize; DL_NUM_COUNTERS],
    dns: usize,
}

fn totals(workers: &[Arc<Worker>]) -> Totals {
    let mut t = Totals {
        ul: [0; UL_NUM_COUNTERS],
        dl: [0; DL_NUM_COUNTERS],
        dns: 0,
    };
    for w in workers {
        for (total, counter) in t.ul.iter_mut().zip(w.ul_counters.iter()) {
            *total += counter.get();
        }
        for (total, counter) in t.dl.iter_mut().zip(w.dl_counters.iter()) {
            *total += counter.get();
        }
        t.dns += w.dns.num_dns_packets();
    }
    t
}

/// Log throughput whenever it changes and drops whenever they move.
pub async fn dump_stats(logger: Logger, workers: Vec<Arc<Worker>>, interval: Duration) {
    let mut last = totals(&[]);
    const FIRST_DL_WARN_IDX: usize = DL_DROP_NOT_IPV4;
    const FIRST_UL_WARN_IDX: usize = UL_DROP_DECAP;

    loop {
        async_std::task::sleep(interval).await;
        let now = totals(&workers);

        if now.dl[DL_RX_PKTS] != last.dl[DL_RX_PKTS] || now.ul[UL_RX_PKTS] != last.ul[UL_RX_PKTS]
        {
            info!(
                &logger,
                "DL pkts={} bytes={} tx={} UL pkts={} bytes={} tx={} dns={}",
                now.dl[DL_RX_PKTS],
                now.dl[DL_RX_BYTES],
                now.dl[DL_TX_PKTS],
                now.ul[UL_RX_PKTS],
                now.ul[UL_RX_BYTES],
                now.ul[UL_TX_PKTS],
                now.dns
            );
        }

        if now.dl[FIRST_DL_WARN_IDX..] != last.dl[FIRST_DL_WARN_IDX..] {
            warn!(
                &logger,
                "DL DROPS not_ipv4={} no_bearer={} gated={} metered={} encap={} no_next_hop={} queued={}",
                now.dl[DL_DROP_NOT_IPV4],
                now.dl[DL_DROP_NO_BEARER],
                now.dl[DL_DROP_GATED],
                now.dl[DL_DROP_METERED],
                now.dl[DL_DROP_ENCAP],
                now.dl[DL_DROP_NO_NEXT_HOP],
                now.dl[DL_QUEUED]
            );
        }

        if now.ul[FIRST_UL_WARN_IDX..] != last.ul[FIRST_UL_WARN_IDX..] {
            warn!(
                &logger,
                "UL DROPS decap={} not_ipv4={} no_bearer={} gated={} metered={} no_next_hop={}",
                now.ul[UL_DROP_DECAP],
                now.ul[UL_DROP_NOT_IPV4],
                now.ul[UL_DROP_NO_BEARER],
                now.ul[UL_DROP_GATED],
                now.ul[UL_DROP_METERED],
                now.ul[UL_DROP_NO_NEXT_HOP]
            );
        }
        last = now;
    }
}
