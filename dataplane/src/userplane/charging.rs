//! charging - CDR updates at ADC, SDF, bearer and rating group granularity
//!
//! A packet is charged at exactly one of the ADC or SDF levels.  The bearer and
//! rating group levels are charged independently of that choice.  Each level
//! records the packet as charged if its forwarding bit survived, and as dropped
//! otherwise.

use super::ETH_HDR_LEN;
use super::batch::{Batch, PacketBuf, PktMask};
use super::headers::Ipv4Hdr;
use crate::{AdcUeInfo, Cdr, Flow, PktAction, SdfBearerContext};
use std::sync::Arc;

/// Bytes billed for a packet.  Link layer padding is not billed: the length is
/// bounded by the IP header's own total length.
pub fn charged_len(pkt: &PacketBuf) -> usize {
    let l3_len = pkt.len().saturating_sub(ETH_HDR_LEN);
    match Ipv4Hdr::new(pkt.l3()) {
        Some(ip) => l3_len.min(ip.total_length() as usize),
        None => l3_len,
    }
}

fn record(cdr: &Cdr, batch: &Batch, i: usize, flow: Flow) {
    let action = if batch.mask.is_set(i) {
        PktAction::Charged
    } else {
        PktAction::Dropped
    };
    cdr.record(flow, action, charged_len(batch.pkt(i)));
}

/// ADC level.  Charged if the ADC gate passed the packet and nothing later
/// dropped it.  Dropped if no open ADC rule passed it.  A packet that passed the ADC
/// gate but was dropped later is not recorded here.
pub fn update_adc_cdr(
    adc_ue: &[Option<Arc<AdcUeInfo>>],
    batch: &Batch,
    adc_mask: &PktMask,
    flow: Flow,
) {
    for (i, adc) in adc_ue.iter().enumerate().take(batch.len()) {
        let Some(adc) = adc else { continue };
        let len = charged_len(batch.pkt(i));
        if adc_mask.is_set(i) {
            if batch.mask.is_set(i) {
                adc.adc_cdr.record(flow, PktAction::Charged, len);
            }
        } else {
            adc.adc_cdr.record(flow, PktAction::Dropped, len);
        }
    }
}

/// SDF level, for packets with no per-subscriber ADC state.
pub fn update_sdf_cdr(
    adc_ue: &[Option<Arc<AdcUeInfo>>],
    sdf: &[Option<Arc<SdfBearerContext>>],
    batch: &Batch,
    flow: Flow,
) {
    for (i, ctx) in sdf.iter().enumerate().take(batch.len()) {
        let Some(ctx) = ctx else { continue };
        if adc_ue.get(i).is_some_and(Option::is_some) {
            continue;
        }
        record(&ctx.sdf_cdr, batch, i, flow);
    }
}

pub fn update_bear_cdr(sdf: &[Option<Arc<SdfBearerContext>>], batch: &Batch, flow: Flow) {
    for (i, ctx) in sdf.iter().enumerate().take(batch.len()) {
        let Some(ctx) = ctx else { continue };
        record(&ctx.bearer.bearer_cdr, batch, i, flow);
    }
}

/// Rating group level.  Packets whose rating group has no bucket in the
/// subscriber's index map are not charged here.
pub fn update_rating_grp_cdr(
    sdf: &[Option<Arc<SdfBearerContext>>],
    rating_groups: &[Option<u32>],
    batch: &Batch,
    flow: Flow,
) {
    for (i, ctx) in sdf.iter().enumerate().take(batch.len()) {
        let Some(ctx) = ctx else { continue };
        let Some(rg) = rating_groups.get(i).copied().flatten() else {
            continue;
        };
        let ue = &ctx.bearer.ue;
        let Some(cdr) = ue
            .rating_group_index(rg)
            .and_then(|idx| ue.rating_group_cdr(idx))
        else {
            continue;
        };
        record(cdr, batch, i, flow);
    }
}
