//! dns - marks DNS packets and copies them onto the worker's side channel

use super::batch::{Batch, PacketBuf};
use super::headers::Ipv4Hdr;
use async_channel::{Sender, TrySendError};
use atomic_counter::{AtomicCounter, RelaxedCounter};

/// Highest ADC rule id the control path may provision.
pub const MAX_ADC_RULES: u32 = 1000;

/// Reserved ADC rule id that the DNS server addresses are installed under.
pub const DNS_RULE_ID: u32 = MAX_ADC_RULES + 1;

/// An unfragmented packet whose rule is the DNS rule.
pub fn is_dns_pkt(pkt: &PacketBuf, rid: u32) -> bool {
    if rid != DNS_RULE_ID {
        return false;
    }
    Ipv4Hdr::new(pkt.l3()).is_some_and(|ip| !ip.is_fragmented())
}

/// Set the DNS flag in each packet's side record.  Does not touch the mask.
pub fn update_dns_meta(batch: &mut Batch, rids: &[u32]) {
    for i in 0..batch.len() {
        let rid = rids.get(i).copied().unwrap_or_default();
        let (pkt, meta) = batch.pkt_and_meta_mut(i);
        meta.dns = is_dns_pkt(pkt, rid);
    }
}

/// A worker's path to the DNS consumer.
pub struct DnsSideChannel {
    tx: Sender<PacketBuf>,
    num_dns_packets: RelaxedCounter,
    ring_full: RelaxedCounter,
}

impl DnsSideChannel {
    pub fn new(tx: Sender<PacketBuf>) -> Self {
        DnsSideChannel {
            tx,
            num_dns_packets: RelaxedCounter::new(0),
            ring_full: RelaxedCounter::new(0),
        }
    }

    /// Copy each active DNS-flagged packet onto the side channel.  Returns the number
    /// copied.  The batch is not changed.
    pub fn clone_dns_pkts(&self, batch: &Batch) -> usize {
        let mut cloned = 0;
        for i in batch.mask.iter().filter(|i| *i < batch.len()) {
            if !batch.meta(i).dns {
                continue;
            }
            match self.tx.try_send(batch.pkt(i).clone()) {
                Ok(()) => {
                    self.num_dns_packets.inc();
                    cloned += 1;
                }
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    self.ring_full.inc();
                }
            }
        }
        cloned
    }

    pub fn num_dns_packets(&self) -> usize {
        self.num_dns_packets.get()
    }

    /// DNS packets that could not be copied because the consumer was behind or gone.
    pub fn ring_full(&self) -> usize {
        self.ring_full.get()
    }
}

pub fn clone_dns_pkts(batch: &Batch, channel: &DnsSideChannel) -> usize {
    channel.clone_dns_pkts(batch)
}
