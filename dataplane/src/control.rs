//! control - the session, PCC, meter, filter and ADC tables behind the fabric
//!
//! The control path is the only writer of the fabric.  Each table here keeps the
//! provisioned definitions, and the provisioning calls turn them into the shared
//! contexts that workers resolve to.

use crate::userplane::{DNS_RULE_ID, ResolutionFabric};
use crate::{
    AdcRule, AdcUeInfo, BearerSession, Config, DlKey, FilterStore, GateStatus, MeterConfig,
    MeterHandle, MeterProfile, PccRule, SdfBearerContext, SponsoredDomainConfig, UeSession, UlKey,
    load_filters_file,
};
use anyhow::{Context, Result, bail, ensure};
use dashmap::DashMap;
use slog::{Logger, info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;

/// A provisioned PCC rule.  Its rule id is the index of the packet filter that
/// classifies traffic into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PccRuleDef {
    pub rule_id: u32,
    pub gate: GateStatus,
    pub rating_group: u32,
    pub meter_id: Option<u32>,
}

struct SessionEntry {
    ue: Arc<UeSession>,
    adc_rule_ids: Vec<u32>,
}

struct BearerEntry {
    bearer: Arc<BearerSession>,
    sdf_rule_ids: Vec<u32>,
}

pub struct ControlTables {
    fabric: Arc<ResolutionFabric>,
    pcc_rules: DashMap<u32, PccRuleDef>,
    meters: DashMap<u32, MeterProfile>,
    adc_rules: DashMap<u32, Arc<AdcRule>>,
    sessions: DashMap<u32, SessionEntry>,
    bearers: DashMap<u32, BearerEntry>,
    logger: Logger,
}

impl ControlTables {
    pub fn new(fabric: Arc<ResolutionFabric>, logger: &Logger) -> Self {
        ControlTables {
            fabric,
            pcc_rules: DashMap::new(),
            meters: DashMap::new(),
            adc_rules: DashMap::new(),
            sessions: DashMap::new(),
            bearers: DashMap::new(),
            logger: logger.clone(),
        }
    }

    // ---- Startup ----

    pub fn init_session_table(&self) {
        self.sessions.clear();
        self.bearers.clear();
        info!(
            self.logger,
            "Session table ready, capacity {} subscribers",
            self.fabric.ue_sessions.capacity()
        );
    }

    pub fn init_meter_table(&self, meters: &[MeterConfig]) -> Result<()> {
        for m in meters {
            ensure!(
                self.meters.insert(m.meter_id, m.profile).is_none(),
                "Meter {} configured more than once",
                m.meter_id
            );
        }
        info!(self.logger, "Meter table loaded with {} meters", meters.len());
        Ok(())
    }

    /// Build the filter store: the catch-all, then any static filters.
    pub fn init_filter_table(&self, config: &Config) -> Result<FilterStore> {
        let mut store = FilterStore::new(config.capacities.filters)?;
        if let Some(filename) = &config.filter_file {
            for filter in load_filters_file(filename, &self.logger)? {
                let index = store
                    .install(filter)
                    .context(format!("Installing filters from {filename}"))?;
                info!(self.logger, "Installed packet filter {index}");
            }
        }
        Ok(store)
    }

    /// A default PCC rule per filter, with an open gate and the filter's rating group.
    pub fn init_pcc_table(&self, filters: &FilterStore) {
        for (index, filter) in filters.iter() {
            self.pcc_rules.insert(
                index as u32,
                PccRuleDef {
                    rule_id: index as u32,
                    gate: GateStatus::Open,
                    rating_group: filter.rating_group as u32,
                    meter_id: None,
                },
            );
        }
        info!(self.logger, "PCC table loaded with {} rules", self.pcc_rules.len());
    }

    /// Install the DNS rule for the given DNS servers, and the ADC rule of each
    /// sponsored domain.  Sponsored domain rules start with no addresses: they are
    /// learned from DNS responses.
    pub fn init_adc_table(
        &self,
        dns_servers: &[Ipv4Addr],
        sponsored: &[SponsoredDomainConfig],
    ) -> Result<()> {
        self.install_adc_rule(DNS_RULE_ID, GateStatus::Open, 0, dns_servers)
            .context("DNS rule install failed")?;
        for d in sponsored {
            self.install_adc_rule(d.rule_id, d.gate, d.rating_group, &[])
                .context(format!("Sponsored domain {}", d.name))?;
        }
        Ok(())
    }

    // ---- Provisioning ----

    pub fn install_pcc_rule(&self, def: PccRuleDef) -> Result<()> {
        if let Some(meter_id) = def.meter_id {
            ensure!(self.meters.contains_key(&meter_id), "Unknown meter {meter_id}");
        }
        self.pcc_rules.insert(def.rule_id, def);
        Ok(())
    }

    pub fn install_meter(&self, meter_id: u32, profile: MeterProfile) {
        self.meters.insert(meter_id, profile);
    }

    /// Install an ADC rule and bind the given addresses to it.  Installing a rule id
    /// that is already known updates its gate in place, so that addresses bound to it
    /// earlier follow the new gate.  Its rating group cannot change.
    pub fn install_adc_rule(
        &self,
        rule_id: u32,
        gate: GateStatus,
        rating_group: u32,
        addrs: &[Ipv4Addr],
    ) -> Result<()> {
        let rule = self
            .adc_rules
            .entry(rule_id)
            .or_insert_with(|| Arc::new(AdcRule::new(rule_id, gate, rating_group)))
            .clone();
        ensure!(
            rule.rating_group == rating_group,
            "ADC rule {rule_id} already installed with rating group {}",
            rule.rating_group
        );
        rule.set_gate_status(gate);
        for addr in addrs {
            self.fabric.adc_domain.insert(u32::from(*addr), rule.clone())?;
        }
        info!(self.logger, "ADC rule {rule_id} installed for {} addresses", addrs.len());
        Ok(())
    }

    /// Open or close a PCC rule's gate, on the definition and on every SDF bound to it.
    pub fn set_pcc_gate(&self, rule_id: u32, gate: GateStatus) -> Result<()> {
        let Some(mut def) = self.pcc_rules.get_mut(&rule_id) else {
            bail!("Unknown PCC rule {rule_id}");
        };
        def.gate = gate;
        for entry in self.bearers.iter() {
            if !entry.sdf_rule_ids.contains(&rule_id) {
                continue;
            }
            let key = UlKey {
                s1u_sgw_teid: entry.bearer.s1u_sgw_teid,
                rid: rule_id,
            };
            if let Some(sdf) = self.fabric.uplink.get(&key) {
                sdf.pcc.set_gate_status(gate);
            }
        }
        Ok(())
    }

    pub fn set_adc_gate(&self, rule_id: u32, gate: GateStatus) -> Result<()> {
        let Some(rule) = self.adc_rules.get(&rule_id) else {
            bail!("Unknown ADC rule {rule_id}");
        };
        rule.set_gate_status(gate);
        Ok(())
    }

    fn meter_handle(&self, meter_id: Option<u32>) -> Result<Option<MeterHandle>> {
        let Some(meter_id) = meter_id else {
            return Ok(None);
        };
        let Some(profile) = self.meters.get(&meter_id) else {
            bail!("Unknown meter {meter_id}");
        };
        Ok(Some(MeterHandle::new(meter_id, *profile)))
    }

    pub fn create_session(
        &self,
        ue_ipv4: Ipv4Addr,
        rating_groups: &[u32],
        apn_meter_id: Option<u32>,
    ) -> Result<Arc<UeSession>> {
        let key = u32::from(ue_ipv4);
        ensure!(!self.sessions.contains_key(&key), "Session {ue_ipv4} already exists");
        let apn_meter = self.meter_handle(apn_meter_id)?;
        let ue = Arc::new(UeSession::new(ue_ipv4, rating_groups, apn_meter));
        self.fabric.ue_sessions.insert(key, ue.clone())?;
        self.sessions.insert(
            key,
            SessionEntry {
                ue: ue.clone(),
                adc_rule_ids: vec![],
            },
        );
        info!(self.logger, "Created session {ue_ipv4}");
        Ok(ue)
    }

    pub fn create_bearer(
        &self,
        ue_ipv4: Ipv4Addr,
        ebi: u8,
        s1u_sgw_teid: u32,
    ) -> Result<Arc<BearerSession>> {
        ensure!(s1u_sgw_teid != 0, "TEID 0 is reserved");
        ensure!(
            !self.bearers.contains_key(&s1u_sgw_teid),
            "TEID {s1u_sgw_teid:#x} already in use"
        );
        let Some(session) = self.sessions.get(&u32::from(ue_ipv4)) else {
            bail!("No session {ue_ipv4}");
        };
        let bearer = Arc::new(BearerSession::new(session.ue.clone(), ebi, s1u_sgw_teid));
        self.bearers.insert(
            s1u_sgw_teid,
            BearerEntry {
                bearer: bearer.clone(),
                sdf_rule_ids: vec![],
            },
        );
        info!(
            self.logger,
            "Created bearer {ebi} for {ue_ipv4}, TEID {s1u_sgw_teid:#x}"
        );
        Ok(bearer)
    }

    /// Set the eNB end of a bearer's tunnel, enabling downlink.
    pub fn modify_bearer(&self, s1u_sgw_teid: u32, enb_teid: u32, enb_ipv4: Ipv4Addr) -> Result<()> {
        ensure!(enb_teid != 0, "eNB TEID 0 is reserved");
        let Some(entry) = self.bearers.get(&s1u_sgw_teid) else {
            bail!("No bearer with TEID {s1u_sgw_teid:#x}");
        };
        entry.bearer.set_downlink_tunnel(enb_teid, enb_ipv4);
        info!(
            self.logger,
            "Bearer {s1u_sgw_teid:#x} downlink tunnel {enb_ipv4}-{enb_teid:#x}"
        );
        Ok(())
    }

    /// Bind a PCC rule to a bearer, making it resolvable in both directions.
    pub fn add_sdf(&self, s1u_sgw_teid: u32, rule_id: u32) -> Result<Arc<SdfBearerContext>> {
        let Some(def) = self.pcc_rules.get(&rule_id).map(|d| *d) else {
            bail!("Unknown PCC rule {rule_id}");
        };
        let Some(mut entry) = self.bearers.get_mut(&s1u_sgw_teid) else {
            bail!("No bearer with TEID {s1u_sgw_teid:#x}");
        };
        let sdf = Arc::new(SdfBearerContext::new(
            PccRule::new(def.rule_id, def.gate, def.rating_group),
            entry.bearer.clone(),
            self.meter_handle(def.meter_id)?,
        ));
        let ul_key = UlKey {
            s1u_sgw_teid,
            rid: rule_id,
        };
        let dl_key = DlKey {
            ue_ipv4: u32::from(entry.bearer.ue.ue_ipv4),
            rid: rule_id,
        };
        self.fabric.uplink.insert(ul_key, sdf.clone())?;
        if let Err(e) = self.fabric.downlink.insert(dl_key, sdf.clone()) {
            self.fabric.uplink.remove(&ul_key);
            return Err(e.into());
        }
        if !entry.sdf_rule_ids.contains(&rule_id) {
            entry.sdf_rule_ids.push(rule_id);
        }
        Ok(sdf)
    }

    /// Turn on application detection for a subscriber under an ADC rule.
    pub fn enable_adc(&self, ue_ipv4: Ipv4Addr, adc_rule_id: u32) -> Result<Arc<AdcUeInfo>> {
        let Some(rating_group) = self.adc_rules.get(&adc_rule_id).map(|r| r.rating_group) else {
            bail!("Unknown ADC rule {adc_rule_id}");
        };
        let Some(mut session) = self.sessions.get_mut(&u32::from(ue_ipv4)) else {
            bail!("No session {ue_ipv4}");
        };
        let info = Arc::new(AdcUeInfo {
            rating_group,
            ..Default::default()
        });
        let key = DlKey {
            ue_ipv4: u32::from(ue_ipv4),
            rid: adc_rule_id,
        };
        self.fabric.adc_ue.insert(key, info.clone())?;
        if !session.adc_rule_ids.contains(&adc_rule_id) {
            session.adc_rule_ids.push(adc_rule_id);
        }
        Ok(info)
    }

    pub fn delete_bearer(&self, s1u_sgw_teid: u32) -> Result<()> {
        let Some((_, entry)) = self.bearers.remove(&s1u_sgw_teid) else {
            bail!("No bearer with TEID {s1u_sgw_teid:#x}");
        };
        let ue_ipv4 = u32::from(entry.bearer.ue.ue_ipv4);
        for rid in entry.sdf_rule_ids {
            self.fabric.uplink.remove(&UlKey { s1u_sgw_teid, rid });
            self.fabric.downlink.remove(&DlKey { ue_ipv4, rid });
        }
        info!(self.logger, "Deleted bearer {s1u_sgw_teid:#x}");
        Ok(())
    }

    /// Delete a subscriber with all its bearers and ADC state.
    pub fn delete_session(&self, ue_ipv4: Ipv4Addr) -> Result<()> {
        let key = u32::from(ue_ipv4);
        let Some((_, session)) = self.sessions.remove(&key) else {
            bail!("No session {ue_ipv4}");
        };
        let teids: Vec<u32> = self
            .bearers
            .iter()
            .filter(|e| Arc::ptr_eq(&e.bearer.ue, &session.ue))
            .map(|e| *e.key())
            .collect();
        for teid in teids {
            if let Err(e) = self.delete_bearer(teid) {
                warn!(self.logger, "Bearer {teid:#x} of {ue_ipv4}: {e}");
            }
        }
        for rid in session.adc_rule_ids {
            self.fabric.adc_ue.remove(&DlKey { ue_ipv4: key, rid });
        }
        self.fabric.ue_sessions.remove(&key);
        info!(self.logger, "Deleted session {ue_ipv4}");
        Ok(())
    }

    pub fn session(&self, ue_ipv4: Ipv4Addr) -> Option<Arc<UeSession>> {
        self.sessions.get(&u32::from(ue_ipv4)).map(|s| s.ue.clone())
    }

    pub fn bearer(&self, s1u_sgw_teid: u32) -> Option<Arc<BearerSession>> {
        self.bearers.get(&s1u_sgw_teid).map(|b| b.bearer.clone())
    }

    pub fn adc_rule(&self, rule_id: u32) -> Option<Arc<AdcRule>> {
        self.adc_rules.get(&rule_id).map(|r| r.clone())
    }

    pub fn pcc_rule(&self, rule_id: u32) -> Option<PccRuleDef> {
        self.pcc_rules.get(&rule_id).map(|d| *d)
    }
}
