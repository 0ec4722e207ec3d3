use atomic_counter::AtomicCounter;
use dataplane::userplane::uplink_counter_indices::*;
use dataplane::{GateStatus, Volume};
use dataplane_tests::{framework::*, ipv4_udp};

#[test]
fn two_of_four_on_wrong_port() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    attach(&dp, &[], Some(ENB_TEID))?;

    let good = uplink_frame(SGW_TEID, PDN_SERVER_IP, 80, b"hello");
    let mut wrong_port = uplink_frame(SGW_TEID, PDN_SERVER_IP, 80, b"hello");
    // Outer UDP destination port.
    wrong_port[36..38].copy_from_slice(&2153u16.to_be_bytes());

    let mut batch = batch_of(&[good.clone(), wrong_port.clone(), good.clone(), wrong_port]);
    let worker = dp.worker(0).unwrap();
    worker.process_uplink(&mut batch);

    assert_eq!(batch.mask.bits(), 0b0101);
    assert_eq!(worker.ul_counters()[UL_DROP_DECAP].get(), 2);
    assert_eq!(worker.ul_counters()[UL_TX_PKTS].get(), 2);

    // Forwarded packets are the inner packet behind a new Ethernet header.
    let inner = ipv4_udp(UE_IP, PDN_SERVER_IP, TEST_UDP_PORT, 80, b"hello");
    for pkt in batch.into_forwarded() {
        assert_eq!(&pkt.data()[0..6], &PDN_GW_MAC);
        assert_eq!(&pkt.data()[6..12], &SGI_MAC);
        assert_eq!(&pkt.data()[14..], &inner[..]);
    }
    Ok(())
}

#[test]
fn zero_and_unknown_teid_dropped() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    let bearer = attach(&dp, &[], Some(ENB_TEID))?;

    let mut batch = batch_of(&[
        uplink_frame(0, PDN_SERVER_IP, 80, b"x"),
        uplink_frame(0x999, PDN_SERVER_IP, 80, b"x"),
    ]);
    let worker = dp.worker(0).unwrap();
    worker.process_uplink(&mut batch);

    assert!(batch.mask.is_empty());
    assert_eq!(worker.ul_counters()[UL_DROP_DECAP].get(), 1);
    assert_eq!(worker.ul_counters()[UL_DROP_NO_BEARER].get(), 1);
    assert_eq!(bearer.bearer_cdr.snapshot().total_pkts(), 0);
    Ok(())
}

#[test]
fn closed_gate_drops_and_bills_drop() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    let bearer = attach(&dp, &[], Some(ENB_TEID))?;
    dp.control().set_pcc_gate(CATCH_ALL_RULE, GateStatus::Closed)?;

    let frame = uplink_frame(SGW_TEID, PDN_SERVER_IP, 80, b"1234");
    let mut batch = batch_of(&[frame]);
    let worker = dp.worker(0).unwrap();
    worker.process_uplink(&mut batch);

    assert!(batch.mask.is_empty());
    assert_eq!(worker.ul_counters()[UL_DROP_GATED].get(), 1);

    let sdf = dp.fabric().uplink.get(&dataplane::UlKey {
        s1u_sgw_teid: SGW_TEID,
        rid: CATCH_ALL_RULE,
    });
    let sdf = sdf.unwrap();
    assert_eq!(sdf.pcc.drop_pkt_count(), 1);

    // 20 byte IP header, 8 byte UDP header, 4 bytes of payload.
    let dropped = Volume {
        bytes: 32,
        pkt_count: 1,
    };
    assert_eq!(sdf.sdf_cdr.snapshot().ul_drop, dropped);
    assert_eq!(bearer.bearer_cdr.snapshot().ul_drop, dropped);
    assert_eq!(bearer.bearer_cdr.snapshot().ul_cdr.pkt_count, 0);
    Ok(())
}

#[test]
fn deleted_session_no_longer_resolves() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    attach(&dp, &[], Some(ENB_TEID))?;
    dp.control().delete_session(UE_IP)?;

    let mut batch = batch_of(&[uplink_frame(SGW_TEID, PDN_SERVER_IP, 80, b"x")]);
    let worker = dp.worker(0).unwrap();
    worker.process_uplink(&mut batch);
    assert!(batch.mask.is_empty());
    assert_eq!(worker.ul_counters()[UL_DROP_NO_BEARER].get(), 1);
    Ok(())
}
