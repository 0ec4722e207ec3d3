//! batch - a burst of packets, their side records and the forwarding mask

use super::ETH_HDR_LEN;
use crate::DlKey;

/// Largest number of packets handled in one pass.
pub const MAX_BURST_SZ: usize = 32;

/// Space kept in front of a received frame so downlink packets can be
/// encapsulated in place.
const DEFAULT_HEADROOM: usize = 128;

/// One bit per packet in a batch.  A set bit means the packet is still being
/// forwarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PktMask(u64);

impl PktMask {
    /// The first `n` bits set.
    pub fn all(n: usize) -> Self {
        match n {
            0 => PktMask(0),
            n if n >= 64 => PktMask(u64::MAX),
            n => PktMask((1u64 << n) - 1),
        }
    }
    pub fn from_bits(bits: u64) -> Self {
        PktMask(bits)
    }
    pub fn bits(&self) -> u64 {
        self.0
    }
    pub fn is_set(&self, i: usize) -> bool {
        i < 64 && (self.0 >> i) & 1 == 1
    }
    pub fn set(&mut self, i: usize) {
        self.0 |= 1 << i
    }
    pub fn clear(&mut self, i: usize) {
        self.0 &= !(1 << i)
    }
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
    /// Is every bit set here also set in `other`?
    pub fn is_subset_of(&self, other: &PktMask) -> bool {
        self.0 & !other.0 == 0
    }
    /// Indices of the set bits, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = usize> + use<> {
        let bits = self.0;
        (0..64).filter(move |i| (bits >> i) & 1 == 1)
    }
}

/// A frame buffer with headroom, starting at the Ethernet header.
#[derive(Debug, Clone)]
pub struct PacketBuf {
    buf: Vec<u8>,
    data_off: usize,
}

impl PacketBuf {
    pub fn from_frame(frame: &[u8]) -> Self {
        Self::with_headroom(frame, DEFAULT_HEADROOM)
    }

    pub fn with_headroom(frame: &[u8], headroom: usize) -> Self {
        let mut buf = vec![0u8; headroom + frame.len()];
        buf[headroom..].copy_from_slice(frame);
        PacketBuf {
            buf,
            data_off: headroom,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.data_off..]
    }
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data_off..]
    }
    pub fn len(&self) -> usize {
        self.buf.len() - self.data_off
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn headroom(&self) -> usize {
        self.data_off
    }

    /// Grow the front of the packet by `n` bytes.  The new bytes are not
    /// initialized.  None if there is not enough headroom.
    pub fn prepend(&mut self, n: usize) -> Option<&mut [u8]> {
        self.data_off = self.data_off.checked_sub(n)?;
        Some(self.data_mut())
    }

    /// Strip `n` bytes from the front of the packet.
    pub fn adj(&mut self, n: usize) -> Option<()> {
        if n > self.len() {
            return None;
        }
        self.data_off += n;
        Some(())
    }

    /// Bytes after the Ethernet header.
    pub fn l3(&self) -> &[u8] {
        self.data().get(ETH_HDR_LEN..).unwrap_or(&[])
    }
}

/// Per-packet side record written by early stages and read by later ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketMeta {
    pub teid: u32,
    pub enb_ipv4: u32,
    pub key: DlKey,
    pub dns: bool,
}

/// The unit of work for one pipeline pass.  Each stage takes it by exclusive
/// reference and may only clear bits in `mask`.
#[derive(Debug)]
pub struct Batch {
    pkts: Vec<PacketBuf>,
    meta: [PacketMeta; MAX_BURST_SZ],
    pub mask: PktMask,
}

impl Batch {
    /// Packets beyond MAX_BURST_SZ are handed back for the next batch.
    pub fn new(mut pkts: Vec<PacketBuf>) -> (Self, Vec<PacketBuf>) {
        let rest = pkts.split_off(pkts.len().min(MAX_BURST_SZ));
        let mask = PktMask::all(pkts.len());
        (
            Batch {
                pkts,
                meta: [PacketMeta::default(); MAX_BURST_SZ],
                mask,
            },
            rest,
        )
    }

    pub fn len(&self) -> usize {
        self.pkts.len()
    }
    pub fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }
    pub fn pkt(&self, i: usize) -> &PacketBuf {
        &self.pkts[i]
    }
    pub fn pkt_mut(&mut self, i: usize) -> &mut PacketBuf {
        &mut self.pkts[i]
    }
    pub fn meta(&self, i: usize) -> &PacketMeta {
        &self.meta[i]
    }
    pub fn meta_mut(&mut self, i: usize) -> &mut PacketMeta {
        &mut self.meta[i]
    }
    /// Packet and side record together, for stages that read one and write the other.
    pub fn pkt_and_meta_mut(&mut self, i: usize) -> (&mut PacketBuf, &mut PacketMeta) {
        (&mut self.pkts[i], &mut self.meta[i])
    }

    /// Total bytes in the batch, forwarded or not.
    pub fn bytes(&self) -> usize {
        self.pkts.iter().map(PacketBuf::len).sum()
    }

    /// The packets still set in the mask, in order.
    pub fn into_forwarded(self) -> Vec<PacketBuf> {
        let mask = self.mask;
        self.pkts
            .into_iter()
            .enumerate()
            .filter_map(|(i, p)| mask.is_set(i).then_some(p))
            .collect()
    }
}
