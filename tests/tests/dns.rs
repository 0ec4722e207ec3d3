use async_std::future;
use dataplane::Dataplane;
use dataplane_tests::{DNS_PORT, dns_query, dns_response, framework::*};
use std::net::Ipv4Addr;
use std::time::Duration;

#[test]
fn dns_query_cloned_once() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    attach(&dp, &[], Some(ENB_TEID))?;

    let mut batch = batch_of(&[
        uplink_frame(SGW_TEID, DNS_SERVER_IP, DNS_PORT, &dns_query("example.com")),
        uplink_frame(SGW_TEID, PDN_SERVER_IP, 80, b"not dns"),
    ]);
    let worker = dp.worker(0).unwrap();
    worker.process_uplink(&mut batch);

    assert_eq!(worker.dns().num_dns_packets(), 1);
    assert_eq!(batch.mask.bits(), 0b11);
    Ok(())
}

#[test]
fn dns_to_other_servers_not_cloned() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    attach(&dp, &[], Some(ENB_TEID))?;

    let mut batch = batch_of(&[uplink_frame(
        SGW_TEID,
        Ipv4Addr::new(9, 9, 9, 9),
        DNS_PORT,
        &dns_query("example.com"),
    )]);
    let worker = dp.worker(0).unwrap();
    worker.process_uplink(&mut batch);
    assert_eq!(worker.dns().num_dns_packets(), 0);
    assert_eq!(batch.mask.bits(), 0b1);
    Ok(())
}

const VIDEO_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
const SPONSORED_RULE: u32 = 40;

async fn start_sponsored() -> anyhow::Result<Dataplane> {
    let mut config = test_config();
    config.sponsored_domains = vec![sponsored("example.com", SPONSORED_RULE)];
    let logger = init_logging();
    let dp = Dataplane::start(config, None, logger).await?;
    attach(&dp, &[], Some(ENB_TEID))?;
    Ok(dp)
}

// Send the DNS answer for video.example.com towards the UE and wait for the
// consumer to install it.  Returns the rule id the address was bound to.
async fn learn_video_address(dp: &Dataplane) -> anyhow::Result<u32> {
    let response = dns_response("video.example.com", &[VIDEO_IP]);
    let mut batch = batch_of(&[downlink_frame(DNS_SERVER_IP, DNS_PORT, &response)]);
    dp.worker(0).unwrap().process_downlink(&mut batch);
    assert_eq!(batch.mask.bits(), 0b1);

    let learned = future::timeout(Duration::from_secs(1), async {
        loop {
            if let Some(rule) = dp.fabric().adc_domain.get(&u32::from(VIDEO_IP)) {
                return rule.rule_id;
            }
            async_std::task::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(learned)
}

#[async_std::test]
async fn sponsored_domain_learned_from_response() -> anyhow::Result<()> {
    let dp = start_sponsored().await?;
    assert_eq!(learn_video_address(&dp).await?, SPONSORED_RULE);
    dp.graceful_shutdown().await;
    Ok(())
}

#[async_std::test]
async fn learned_address_follows_control_gate() -> anyhow::Result<()> {
    let dp = start_sponsored().await?;
    learn_video_address(&dp).await?;
    let adc = dp.control().enable_adc(UE_IP, SPONSORED_RULE)?;

    let worker = dp.worker(0).unwrap();
    let mut batch = batch_of(&[uplink_frame(SGW_TEID, VIDEO_IP, 443, b"play")]);
    worker.process_uplink(&mut batch);
    assert_eq!(batch.mask.bits(), 0b1);
    assert_eq!(adc.adc_cdr.snapshot().ul_cdr.pkt_count, 1);

    dp.control()
        .set_adc_gate(SPONSORED_RULE, dataplane::GateStatus::Closed)?;
    let mut batch = batch_of(&[uplink_frame(SGW_TEID, VIDEO_IP, 443, b"play")]);
    worker.process_uplink(&mut batch);
    assert!(batch.mask.is_empty());
    assert_eq!(adc.adc_cdr.snapshot().ul_drop.pkt_count, 1);
    assert_eq!(dp.control().adc_rule(SPONSORED_RULE).unwrap().drop_pkt_count(), 1);

    dp.graceful_shutdown().await;
    Ok(())
}
