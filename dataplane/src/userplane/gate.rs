//! gate - policy gating and the per-packet choice of rating group

use super::batch::PktMask;
use crate::{AdcRule, AdcUeInfo, GateStatus, SdfBearerContext};
use std::sync::Arc;

/// Drop packets whose PCC rule gate is closed, counting each drop against the rule.
///
/// Packets with no SDF context are skipped.  Inactive packets never have one once
/// the bearer lookup has run.  Running this twice over the same batch counts a
/// closed-gate packet twice; the pipeline runs it once per pass.
pub fn pcc_gating(sdf: &[Option<Arc<SdfBearerContext>>], mask: &mut PktMask) {
    for (i, sdf) in sdf.iter().enumerate() {
        let Some(sdf) = sdf else { continue };
        if sdf.pcc.gate_status() == GateStatus::Closed {
            mask.clear(i);
            sdf.pcc.record_drop();
        }
    }
}

/// Apply ADC rule gates.  A closed gate drops the packet and counts against the
/// ADC rule.  An open gate marks the packet in `adc_mask`, which the ledger uses to
/// decide between ADC charging and ADC drop recording.
pub fn adc_gating(rules: &[Option<Arc<AdcRule>>], mask: &mut PktMask, adc_mask: &mut PktMask) {
    for (i, rule) in rules.iter().enumerate() {
        let Some(rule) = rule else { continue };
        if !mask.is_set(i) {
            continue;
        }
        match rule.gate_status() {
            GateStatus::Open => adc_mask.set(i),
            GateStatus::Closed => {
                mask.clear(i);
                rule.record_drop();
            }
        }
    }
}

/// Overwrite base rule ids with the rule found by domain lookup, where there was one.
pub fn merge_adc_rule_ids(base: &mut [u32], domain: &[u32]) {
    for (b, d) in base.iter_mut().zip(domain) {
        if *d != 0 {
            *b = *d;
        }
    }
}

/// The rating group each packet should be charged to.  A non-zero ADC rating group
/// wins over the PCC rule's.  None means no rating group charging for that packet.
pub fn rating_groups(
    adc_ue: &[Option<Arc<AdcUeInfo>>],
    sdf: &[Option<Arc<SdfBearerContext>>],
    out: &mut [Option<u32>],
) {
    for (i, rg) in out.iter_mut().enumerate() {
        let adc_rg = adc_ue
            .get(i)
            .and_then(Option::as_ref)
            .map(|a| a.rating_group)
            .filter(|rg| *rg != 0);
        let pcc_rg = || {
            sdf.get(i)
                .and_then(Option::as_ref)
                .map(|s| s.pcc.rating_group)
                .filter(|rg| *rg != 0)
        };
        *rg = adc_rg.or_else(pcc_rg);
    }
}
