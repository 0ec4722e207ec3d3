//! meter - threads per-SDF and per-APN meter handles to an external metering algorithm

use super::batch::{Batch, PktMask};
use super::charging::charged_len;
use crate::{MeterHandle, SdfBearerContext};
use std::sync::Arc;

/// The metering algorithm, supplied by the embedding process.
pub trait Metering: Send + Sync {
    /// Whether a packet of `len` bytes conforms to the meter.  May update the
    /// meter's own state.
    fn admit(&self, meter: &MeterHandle, len: usize) -> bool;
}

/// Per-SDF meter of each active packet.
pub fn sdf_meters<'a>(
    sdf: &'a [Option<Arc<SdfBearerContext>>],
    mask: &PktMask,
    out: &mut [Option<&'a MeterHandle>],
) {
    for (i, meter) in out.iter_mut().enumerate() {
        *meter = None;
        if !mask.is_set(i) {
            continue;
        }
        *meter = sdf.get(i).and_then(Option::as_ref).and_then(|s| s.sdf_meter.as_ref());
    }
}

/// Per-subscriber APN meter of each active packet, found through its bearer.
pub fn apn_meters<'a>(
    sdf: &'a [Option<Arc<SdfBearerContext>>],
    mask: &PktMask,
    out: &mut [Option<&'a MeterHandle>],
) {
    for (i, meter) in out.iter_mut().enumerate() {
        *meter = None;
        if !mask.is_set(i) {
            continue;
        }
        *meter = sdf
            .get(i)
            .and_then(Option::as_ref)
            .and_then(|s| s.bearer.ue.apn_meter.as_ref());
    }
}

/// Offer each active metered packet to its meter.  A non-conforming packet is
/// dropped and counted against the meter.
pub fn apply_meters(meters: &[Option<&MeterHandle>], batch: &mut Batch, metering: &dyn Metering) {
    for (i, meter) in meters.iter().enumerate().take(batch.len()) {
        let Some(meter) = meter else { continue };
        if !batch.mask.is_set(i) {
            continue;
        }
        if !metering.admit(meter, charged_len(batch.pkt(i))) {
            batch.mask.clear(i);
            meter.record_drop();
        }
    }
}
