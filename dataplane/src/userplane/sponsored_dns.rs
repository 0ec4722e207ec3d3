//! sponsored_dns - learns the addresses of sponsored domains from DNS responses
//!
//! Workers copy DNS packets onto a side channel.  A single consumer reads them, and
//! for each A record answering a query under a sponsored domain installs that address
//! into the ADC domain store, bound to the domain's ADC rule.  Subsequent traffic to
//! the address is then charged and gated by that rule.

use super::DNS_PORT;
use super::batch::PacketBuf;
use super::fabric::ResolutionFabric;
use super::headers::Ipv4Hdr;
use crate::{AdcRule, SponsoredDomainConfig};
use async_channel::Receiver;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{DNSClass, RData};
use hickory_proto::serialize::binary::BinDecodable;
use slog::{Logger, debug, info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SponsoredDnsError {
    #[error("{count} sponsored domains configured, capacity is {capacity}")]
    CapacityExceeded { count: usize, capacity: usize },

    #[error("Invalid sponsored domain name '{0}'")]
    InvalidName(String),

    #[error("Sponsored domain '{0}' refers to unknown ADC rule {1}")]
    UnknownRule(String, u32),
}

struct SponsoredDomain {
    name: String,
    rule: Arc<AdcRule>,
}

pub struct SponsoredDomains {
    domains: Vec<SponsoredDomain>,
}

impl SponsoredDomains {
    /// Build the domain list.  `adc_rule` supplies the installed ADC rule for a rule
    /// id, so that learned addresses share it with the control path.
    pub fn create(
        capacity: usize,
        configs: &[SponsoredDomainConfig],
        adc_rule: impl Fn(u32) -> Option<Arc<AdcRule>>,
    ) -> Result<Self, SponsoredDnsError> {
        if configs.len() > capacity {
            return Err(SponsoredDnsError::CapacityExceeded {
                count: configs.len(),
                capacity,
            });
        }
        let domains = configs
            .iter()
            .map(|c| {
                let name = c.name.trim_end_matches('.').to_ascii_lowercase();
                if name.is_empty() || name.split('.').any(str::is_empty) {
                    return Err(SponsoredDnsError::InvalidName(c.name.clone()));
                }
                let rule = adc_rule(c.rule_id)
                    .ok_or_else(|| SponsoredDnsError::UnknownRule(c.name.clone(), c.rule_id))?;
                Ok(SponsoredDomain { name, rule })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SponsoredDomains { domains })
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// The ADC rule of the sponsored domain that `name` falls under, if any.
    pub fn rule_for(&self, name: &str) -> Option<&Arc<AdcRule>> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        self.domains
            .iter()
            .find(|d| {
                name == d.name
                    || name
                        .strip_suffix(d.name.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            })
            .map(|d| &d.rule)
    }

    /// Install the addresses from one DNS response.  Returns the number of addresses
    /// installed.  Anything that is not a well formed successful response for a
    /// sponsored name is ignored.
    pub fn learn(&self, pkt: &PacketBuf, fabric: &ResolutionFabric, logger: &Logger) -> usize {
        let Some(msg) = Ipv4Hdr::new(pkt.l3())
            .and_then(|ip| ip.udp())
            .filter(|udp| udp.src_port() == DNS_PORT)
            .map(|udp| udp.payload())
        else {
            return 0;
        };
        let Some(response) = parse_response(msg) else {
            debug!(logger, "Ignoring DNS packet that is not a usable response");
            return 0;
        };
        let Some(rule) = self.rule_for(&response.qname) else {
            return 0;
        };

        let mut installed = 0;
        for addr in response.addrs {
            match fabric.adc_domain.insert(u32::from(addr), rule.clone()) {
                Ok(()) => {
                    info!(
                        logger,
                        "Sponsored domain {} -> {addr}, ADC rule {}", response.qname, rule.rule_id
                    );
                    installed += 1;
                }
                Err(e) => warn!(logger, "Failed to install {addr} for {}: {e}", response.qname),
            }
        }
        installed
    }
}

/// Drain the DNS side channel until every sender is gone.
pub async fn run_dns_consumer(
    rx: Receiver<PacketBuf>,
    domains: Arc<SponsoredDomains>,
    fabric: Arc<ResolutionFabric>,
    logger: Logger,
) {
    info!(logger, "DNS consumer started, {} sponsored domains", domains.len());
    while let Ok(pkt) = rx.recv().await {
        domains.learn(&pkt, &fabric, &logger);
    }
    info!(logger, "DNS consumer exiting");
}

struct DnsResponse {
    qname: String,
    addrs: Vec<Ipv4Addr>,
}

fn parse_response(msg: &[u8]) -> Option<DnsResponse> {
    let msg = Message::from_bytes(msg).ok()?;
    if msg.message_type() != MessageType::Response
        || msg.response_code() != ResponseCode::NoError
    {
        return None;
    }
    let [query] = msg.queries() else {
        return None;
    };
    let qname = query
        .name()
        .to_ascii()
        .trim_end_matches('.')
        .to_ascii_lowercase();
    let addrs = msg
        .answers()
        .iter()
        .filter(|r| r.dns_class() == DNSClass::IN)
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(a.0),
            _ => None,
        })
        .collect();
    Some(DnsResponse { qname, addrs })
}
