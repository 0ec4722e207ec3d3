//! fabric - keyed stores that map a burst of keys to the contexts they resolve to
//!
//! Workers only read.  Writes come from the control path and are serialized per
//! store.  Each shard is an immutable map behind an ArcSwap, so a reader never waits
//! for a writer: it sees an entry either wholly before or wholly after a write.
//! A write copies one shard, and the shard count grows with capacity so that a full
//! store still has small shards.

use super::batch::{Batch, MAX_BURST_SZ, PktMask};
use super::headers::Ipv4Hdr;
use crate::{
    AdcDomainKey, AdcRule, AdcUeInfo, BearerSession, DlKey, Flow, SdfBearerContext,
    StoreCapacities, UeKey, UeSession, UlKey,
};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use slog::{Logger, debug, error, info};
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, RandomState};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

const MIN_SHARDS: usize = 16;
const MAX_SHARDS: usize = 1 << 16;
// Entries per shard when the store is full.
const SHARD_FILL: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    #[error("Store {0}: invalid capacity {1}")]
    InvalidCapacity(&'static str, usize),

    #[error("Store {0} is full (capacity {1})")]
    CapacityExceeded(&'static str, usize),

    #[error("Burst of {0} keys exceeds maximum of {MAX_BURST_SZ}")]
    BurstTooLarge(usize),

    #[error("Output of {1} slots is too short for {0} keys")]
    OutputTooShort(usize, usize),
}

type Shard<K, V> = ArcSwap<HashMap<K, Arc<V>>>;

/// A fixed capacity store of contexts keyed by a fixed width key.
pub struct KeyedStore<K, V> {
    name: &'static str,
    capacity: usize,
    len: AtomicUsize,
    hasher: RandomState,
    shards: Vec<Shard<K, V>>,
    writer: Mutex<()>,
}

impl<K: Copy + Eq + Hash, V> KeyedStore<K, V> {
    pub fn create(name: &'static str, capacity: usize) -> Result<Self, FabricError> {
        if capacity == 0 {
            return Err(FabricError::InvalidCapacity(name, capacity));
        }
        let num_shards = capacity
            .div_ceil(SHARD_FILL)
            .next_power_of_two()
            .clamp(MIN_SHARDS, MAX_SHARDS);
        Ok(KeyedStore {
            name,
            capacity,
            len: AtomicUsize::new(0),
            hasher: RandomState::new(),
            shards: (0..num_shards).map(|_| ArcSwap::from_pointee(HashMap::new())).collect(),
            writer: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn key_len(&self) -> usize {
        std::mem::size_of::<K>()
    }

    fn shard(&self, key: &K) -> &Shard<K, V> {
        // The shard count is a power of two.
        &self.shards[self.hasher.hash_one(key) as usize & (self.shards.len() - 1)]
    }

    /// Insert or replace the context for `key`.
    pub fn insert(&self, key: K, value: Arc<V>) -> Result<(), FabricError> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let shard = self.shard(&key);
        let current = shard.load_full();
        let is_new = !current.contains_key(&key);
        if is_new && self.len() >= self.capacity {
            return Err(FabricError::CapacityExceeded(self.name, self.capacity));
        }
        let mut next = HashMap::clone(&current);
        next.insert(key, value);
        shard.store(Arc::new(next));
        if is_new {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let shard = self.shard(key);
        let current = shard.load_full();
        let removed = current.get(key).cloned()?;
        let mut next = HashMap::clone(&current);
        next.remove(key);
        shard.store(Arc::new(next));
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(removed)
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.shard(key).load().get(key).cloned()
    }

    /// Look up a burst of keys.  `out[i]` is the context for `keys[i]` or None, and
    /// the returned mask has bit i set on a hit.  Duplicate keys are each looked up.
    pub fn lookup_bulk(
        &self,
        keys: &[K],
        out: &mut [Option<Arc<V>>],
    ) -> Result<PktMask, FabricError> {
        if keys.len() > MAX_BURST_SZ {
            return Err(FabricError::BurstTooLarge(keys.len()));
        }
        if out.len() < keys.len() {
            return Err(FabricError::OutputTooShort(keys.len(), out.len()));
        }
        let mut hits = PktMask::default();
        for (i, key) in keys.iter().enumerate() {
            out[i] = self.get(key);
            if out[i].is_some() {
                hits.set(i);
            }
        }
        Ok(hits)
    }
}

/// The five keyed stores the pipeline resolves against.
pub struct ResolutionFabric {
    pub uplink: KeyedStore<UlKey, SdfBearerContext>,
    pub downlink: KeyedStore<DlKey, SdfBearerContext>,
    pub adc_domain: KeyedStore<AdcDomainKey, AdcRule>,
    pub adc_ue: KeyedStore<DlKey, AdcUeInfo>,
    pub ue_sessions: KeyedStore<UeKey, UeSession>,
    logger: Logger,
}

fn create_store<K: Copy + Eq + Hash, V>(
    name: &'static str,
    capacity: usize,
    logger: &Logger,
) -> Result<KeyedStore<K, V>> {
    let store =
        KeyedStore::create(name, capacity).context(format!("{name} hash create failed"))?;
    info!(
        logger,
        "Created {name}: {capacity} entries, key length {}",
        store.key_len()
    );
    Ok(store)
}

impl ResolutionFabric {
    /// Create all five stores.  Failure here is fatal to startup.
    pub fn create(capacities: &StoreCapacities, logger: &Logger) -> Result<Self> {
        Ok(ResolutionFabric {
            uplink: create_store("iface_uplink_db", capacities.uplink, logger)?,
            downlink: create_store("iface_downlink_db", capacities.downlink, logger)?,
            adc_domain: create_store("adc_domain_hash", capacities.adc_domain, logger)?,
            adc_ue: create_store("adc_ue_info", capacities.adc_ue, logger)?,
            ue_sessions: create_store("ue_sess_info", capacities.ue_sessions, logger)?,
            logger: logger.clone(),
        })
    }

    // A failed bulk lookup is treated as a miss on every key.
    fn hits_or_none<K: Copy + Eq + Hash, V>(
        &self,
        store: &KeyedStore<K, V>,
        keys: &[K],
        out: &mut [Option<Arc<V>>],
    ) -> PktMask {
        match store.lookup_bulk(keys, out) {
            Ok(hits) => hits,
            Err(e) => {
                error!(self.logger, "{} bulk lookup failed: {e}", store.name());
                out.iter_mut().for_each(|o| *o = None);
                PktMask::default()
            }
        }
    }

    /// Resolve active packets to their SDF context by (TEID, rule id).  A miss clears
    /// the packet's forwarding bit.
    pub fn uplink_bearer_lookup(
        &self,
        batch: &mut Batch,
        rids: &[u32],
        sdf: &mut [Option<Arc<SdfBearerContext>>],
    ) {
        let n = batch.len();
        let mut keys = [UlKey::default(); MAX_BURST_SZ];
        for (i, key) in keys.iter_mut().enumerate().take(n) {
            *key = UlKey {
                s1u_sgw_teid: batch.meta(i).teid,
                rid: rids[i],
            };
            debug!(
                self.logger,
                "BEAR_SESS LKUP: UL_KEY teid:{}, rid:{}", key.s1u_sgw_teid, key.rid
            );
        }
        let hits = self.hits_or_none(&self.uplink, &keys[..n], sdf);

        for i in 0..n {
            if !batch.mask.is_set(i) {
                sdf[i] = None;
            } else if !hits.is_set(i) {
                batch.mask.clear(i);
                debug!(
                    self.logger,
                    "SDF BEAR LKUP: FAIL UL_KEY teid:{}, rid:{}", keys[i].s1u_sgw_teid, keys[i].rid
                );
                sdf[i] = None;
            }
        }
    }

    /// Resolve active packets to their SDF context by (subscriber address, rule id)
    /// and follow it to the bearer.  The key is written into each packet's side
    /// record first.  A miss clears the packet's forwarding bit.
    pub fn downlink_bearer_lookup(
        &self,
        batch: &mut Batch,
        rids: &[u32],
        sdf: &mut [Option<Arc<SdfBearerContext>>],
        sessions: &mut [Option<Arc<BearerSession>>],
    ) {
        let n = batch.len();
        let mut keys = [DlKey::default(); MAX_BURST_SZ];
        for (i, key) in keys.iter_mut().enumerate().take(n) {
            let ue_ipv4 = Ipv4Hdr::new(batch.pkt(i).l3())
                .map(|ip| u32::from(ip.dst()))
                .unwrap_or_default();
            let meta = batch.meta_mut(i);
            meta.key = DlKey {
                ue_ipv4,
                rid: rids[i],
            };
            *key = meta.key;
            debug!(
                self.logger,
                "BEAR_SESS LKUP: DL_KEY ue_addr:{}, rid:{}",
                Ipv4Addr::from(key.ue_ipv4),
                key.rid
            );
        }
        let hits = self.hits_or_none(&self.downlink, &keys[..n], sdf);

        for i in 0..n {
            if !batch.mask.is_set(i) {
                sdf[i] = None;
                sessions[i] = None;
            } else if !hits.is_set(i) {
                batch.mask.clear(i);
                debug!(
                    self.logger,
                    "SDF BEAR LKUP: FAIL DL_KEY ue_addr:{}, rid:{}",
                    Ipv4Addr::from(keys[i].ue_ipv4),
                    keys[i].rid
                );
                sdf[i] = None;
                sessions[i] = None;
            } else {
                sessions[i] = sdf[i].as_ref().map(|s| s.bearer.clone());
            }
        }
    }

    /// Find the per-subscriber ADC state for each active packet by (subscriber
    /// address, ADC rule id).  Misses leave the forwarding mask alone.
    pub fn adc_ue_lookup(
        &self,
        batch: &Batch,
        adc_rids: &[u32],
        flow: Flow,
        adc_ue: &mut [Option<Arc<AdcUeInfo>>],
    ) {
        let n = batch.len();
        let mut keys = [DlKey::default(); MAX_BURST_SZ];
        for (i, key) in keys.iter_mut().enumerate().take(n) {
            let ue_ipv4 = Ipv4Hdr::new(batch.pkt(i).l3())
                .map(|ip| match flow {
                    Flow::Uplink => u32::from(ip.src()),
                    Flow::Downlink => u32::from(ip.dst()),
                })
                .unwrap_or_default();
            *key = DlKey {
                ue_ipv4,
                rid: adc_rids[i],
            };
        }
        let hits = self.hits_or_none(&self.adc_ue, &keys[..n], adc_ue);
        for (i, info) in adc_ue.iter_mut().enumerate().take(n) {
            if !hits.is_set(i) || !batch.mask.is_set(i) {
                *info = None;
            }
        }
    }

    /// Find the ADC rule for each active packet by the remote address: destination on
    /// uplink, source on downlink.  `adc_rids[i]` is 0 where no rule applies.
    pub fn adc_domain_lookup(
        &self,
        batch: &Batch,
        flow: Flow,
        adc_rids: &mut [u32],
        rules: &mut [Option<Arc<AdcRule>>],
    ) {
        let n = batch.len();
        let mut keys = [0 as AdcDomainKey; MAX_BURST_SZ];
        for (i, key) in keys.iter_mut().enumerate().take(n) {
            *key = Ipv4Hdr::new(batch.pkt(i).l3())
                .map(|ip| match flow {
                    Flow::Uplink => u32::from(ip.dst()),
                    Flow::Downlink => u32::from(ip.src()),
                })
                .unwrap_or_default();
        }
        let hits = self.hits_or_none(&self.adc_domain, &keys[..n], rules);
        for i in 0..n {
            if !hits.is_set(i) || !batch.mask.is_set(i) {
                rules[i] = None;
            }
            adc_rids[i] = match &rules[i] {
                Some(rule) => {
                    debug!(self.logger, "ADC_DNS_LKUP: rid[{i}]:{}", rule.rule_id);
                    rule.rule_id
                }
                None => 0,
            };
        }
    }
}
