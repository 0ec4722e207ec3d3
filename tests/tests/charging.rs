use dataplane::{AdcUeInfo, DlKey, GateStatus, Volume};
use dataplane_tests::{eth_frame, framework::*, gtpu_packet, ipv4_udp};
use std::net::Ipv4Addr;
use std::sync::Arc;

const VIDEO_RULE: u32 = 50;
const VIDEO_RG: u32 = 30;

fn adc_ue(dp: &dataplane::Dataplane) -> Arc<AdcUeInfo> {
    dp.fabric()
        .adc_ue
        .get(&DlKey {
            ue_ipv4: u32::from(UE_IP),
            rid: VIDEO_RULE,
        })
        .unwrap()
}

#[test]
fn adc_hit_not_charged_at_sdf() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    let bearer = attach(&dp, &[VIDEO_RG], Some(ENB_TEID))?;
    dp.control()
        .install_adc_rule(VIDEO_RULE, GateStatus::Open, VIDEO_RG, &[PDN_SERVER_IP])?;
    dp.control().enable_adc(UE_IP, VIDEO_RULE)?;

    let mut batch = batch_of(&[
        uplink_frame(SGW_TEID, PDN_SERVER_IP, 443, b"video"),
        uplink_frame(SGW_TEID, Ipv4Addr::new(198, 51, 100, 1), 443, b"other"),
    ]);
    dp.worker(0).unwrap().process_uplink(&mut batch);
    assert_eq!(batch.mask.bits(), 0b11);

    let charged = Volume {
        bytes: 33,
        pkt_count: 1,
    };
    // The video packet at ADC level only, the other at SDF level only.
    assert_eq!(adc_ue(&dp).adc_cdr.snapshot().ul_cdr, charged);
    let sdf = bearer_sdf(&dp);
    assert_eq!(sdf.sdf_cdr.snapshot().ul_cdr, charged);
    assert_eq!(sdf.sdf_cdr.snapshot().total_pkts(), 1);

    // The bearer sees both.  The rating group bucket sees the video packet.
    assert_eq!(bearer.bearer_cdr.snapshot().ul_cdr.pkt_count, 2);
    let rg = bearer.ue.rating_group_index(VIDEO_RG).unwrap();
    assert_eq!(bearer.ue.rating_group_cdr(rg).unwrap().snapshot().ul_cdr, charged);
    Ok(())
}

#[test]
fn adc_closed_gate() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    let bearer = attach(&dp, &[], Some(ENB_TEID))?;
    dp.control()
        .install_adc_rule(VIDEO_RULE, GateStatus::Closed, 0, &[PDN_SERVER_IP])?;
    dp.control().enable_adc(UE_IP, VIDEO_RULE)?;

    let mut batch = batch_of(&[downlink_frame(PDN_SERVER_IP, 443, b"video")]);
    let queue_mask = dp.worker(0).unwrap().process_downlink(&mut batch);
    assert!(batch.mask.is_empty());
    assert!(queue_mask.is_empty());

    let rule = dp.control().adc_rule(VIDEO_RULE).unwrap();
    assert_eq!(rule.drop_pkt_count(), 1);
    let adc = adc_ue(&dp).adc_cdr.snapshot();
    assert_eq!(adc.dl_drop.pkt_count, 1);
    assert_eq!(adc.total_pkts(), 1);
    assert_eq!(bearer_sdf(&dp).sdf_cdr.snapshot().total_pkts(), 0);
    assert_eq!(bearer.bearer_cdr.snapshot().dl_drop.pkt_count, 1);

    // Reopening the gate lets traffic through without reprovisioning.
    dp.control().set_adc_gate(VIDEO_RULE, GateStatus::Open)?;
    let mut batch = batch_of(&[downlink_frame(PDN_SERVER_IP, 443, b"video")]);
    dp.worker(0).unwrap().process_downlink(&mut batch);
    assert_eq!(batch.mask.bits(), 0b1);
    Ok(())
}

#[test]
fn link_padding_not_charged() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    let bearer = attach(&dp, &[], Some(ENB_TEID))?;

    // 28 byte inner packet, padded by the eNB link layer to a 60 byte frame.
    let inner = ipv4_udp(UE_IP, PDN_SERVER_IP, TEST_UDP_PORT, 80, b"");
    let outer = gtpu_packet(ENB_IP, S1U_IP, dataplane_tests::GTPU_PORT, SGW_TEID, &inner);
    let mut frame = eth_frame(S1U_MAC, ENB_MAC, &outer);
    frame.extend_from_slice(&[0u8; 18]);

    let mut batch = batch_of(&[frame]);
    dp.worker(0).unwrap().process_uplink(&mut batch);
    assert_eq!(batch.mask.bits(), 0b1);
    assert_eq!(
        bearer.bearer_cdr.snapshot().ul_cdr,
        Volume {
            bytes: 28,
            pkt_count: 1
        }
    );
    Ok(())
}

fn bearer_sdf(dp: &dataplane::Dataplane) -> Arc<dataplane::SdfBearerContext> {
    dp.fabric()
        .uplink
        .get(&dataplane::UlKey {
            s1u_sgw_teid: SGW_TEID,
            rid: CATCH_ALL_RULE,
        })
        .unwrap()
}
