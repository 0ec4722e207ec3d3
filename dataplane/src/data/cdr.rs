//! cdr - byte and packet counters at one charging granularity

use atomic_counter::{AtomicCounter, RelaxedCounter};

/// Direction of travel through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Uplink,
    Downlink,
}

/// Whether a packet is billed as delivered or as dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktAction {
    Charged,
    Dropped,
}

#[derive(Debug)]
struct VolumeCounter {
    bytes: RelaxedCounter,
    pkt_count: RelaxedCounter,
}

impl Default for VolumeCounter {
    fn default() -> Self {
        VolumeCounter {
            bytes: RelaxedCounter::new(0),
            pkt_count: RelaxedCounter::new(0),
        }
    }
}

impl VolumeCounter {
    fn add(&self, len: usize) {
        self.bytes.add(len);
        self.pkt_count.inc();
    }
    fn get(&self) -> Volume {
        Volume {
            bytes: self.bytes.get(),
            pkt_count: self.pkt_count.get(),
        }
    }
}

/// A charging data record block.  The counters only ever go up; resetting them
/// is the job of whoever exports CDRs for billing.
///
/// Updates use relaxed atomics.  A given block is only written by the worker that
/// owns the flow, so these never contend in steady state.
#[derive(Debug, Default)]
pub struct Cdr {
    ul_cdr: VolumeCounter,
    ul_drop: VolumeCounter,
    dl_cdr: VolumeCounter,
    dl_drop: VolumeCounter,
}

impl Cdr {
    pub fn record(&self, flow: Flow, action: PktAction, charged_len: usize) {
        let counter = match (flow, action) {
            (Flow::Uplink, PktAction::Charged) => &self.ul_cdr,
            (Flow::Uplink, PktAction::Dropped) => &self.ul_drop,
            (Flow::Downlink, PktAction::Charged) => &self.dl_cdr,
            (Flow::Downlink, PktAction::Dropped) => &self.dl_drop,
        };
        counter.add(charged_len);
    }

    pub fn snapshot(&self) -> CdrSnapshot {
        CdrSnapshot {
            ul_cdr: self.ul_cdr.get(),
            ul_drop: self.ul_drop.get(),
            dl_cdr: self.dl_cdr.get(),
            dl_drop: self.dl_drop.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Volume {
    pub bytes: usize,
    pub pkt_count: usize,
}

/// Point-in-time copy of a [`Cdr`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CdrSnapshot {
    pub ul_cdr: Volume,
    pub ul_drop: Volume,
    pub dl_cdr: Volume,
    pub dl_drop: Volume,
}

impl CdrSnapshot {
    /// Total packets recorded in any of the four buckets.
    pub fn total_pkts(&self) -> usize {
        self.ul_cdr.pkt_count + self.ul_drop.pkt_count + self.dl_cdr.pkt_count + self.dl_drop.pkt_count
    }
}
