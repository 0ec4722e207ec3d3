use atomic_counter::AtomicCounter;
use dataplane::userplane::downlink_counter_indices::*;
use dataplane_tests::{GTPU_PORT, framework::*, ipv4_udp, parse_gtpu_frame};
use std::net::Ipv4Addr;

#[test]
fn encapsulated_towards_enb() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    let bearer = attach(&dp, &[], Some(ENB_TEID))?;

    let mut batch = batch_of(&[downlink_frame(PDN_SERVER_IP, 80, b"response")]);
    let worker = dp.worker(0).unwrap();
    let queue_mask = worker.process_downlink(&mut batch);

    assert!(queue_mask.is_empty());
    assert_eq!(batch.mask.bits(), 0b1);
    let pkts = batch.into_forwarded();
    let frame = parse_gtpu_frame(pkts[0].data()).unwrap();
    assert_eq!(frame.eth_dst, ENB_MAC);
    assert_eq!(frame.eth_src, S1U_MAC);
    assert_eq!(frame.outer_src, S1U_IP);
    assert_eq!(frame.outer_dst, ENB_IP);
    assert_eq!((frame.udp_src, frame.udp_dst), (GTPU_PORT, GTPU_PORT));
    assert_eq!(frame.teid, ENB_TEID);
    assert_eq!(
        frame.inner,
        ipv4_udp(PDN_SERVER_IP, UE_IP, 80, TEST_UDP_PORT, b"response")
    );
    assert_eq!(bearer.bearer_cdr.snapshot().dl_cdr.pkt_count, 1);
    Ok(())
}

#[test]
fn unknown_subscriber_misses() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    attach(&dp, &[], Some(ENB_TEID))?;

    // Addressed to a subscriber with no session.
    let ip = ipv4_udp(PDN_SERVER_IP, Ipv4Addr::new(10, 45, 0, 99), 80, TEST_UDP_PORT, b"x");
    let frame = dataplane_tests::eth_frame(SGI_MAC, PDN_GW_MAC, &ip);
    let mut batch = batch_of(&[frame, downlink_frame(PDN_SERVER_IP, 80, b"y")]);
    let worker = dp.worker(0).unwrap();
    let queue_mask = worker.process_downlink(&mut batch);

    assert_eq!(batch.mask.bits(), 0b10);
    assert!(queue_mask.is_empty());
    assert_eq!(worker.dl_counters()[DL_DROP_NO_BEARER].get(), 1);
    Ok(())
}

#[test]
fn no_downlink_tunnel_is_queued() -> anyhow::Result<()> {
    let (dp, _logger) = init(test_config())?;
    let bearer = attach(&dp, &[], None)?;

    let mut batch = batch_of(&[downlink_frame(PDN_SERVER_IP, 80, b"early")]);
    let worker = dp.worker(0).unwrap();
    let queue_mask = worker.process_downlink(&mut batch);

    assert!(batch.mask.is_empty());
    assert_eq!(queue_mask.bits(), 0b1);
    assert_eq!(worker.dl_counters()[DL_QUEUED].get(), 1);
    assert_eq!(worker.dl_counters()[DL_DROP_ENCAP].get(), 0);

    // Once the eNB end is known, downlink flows.
    dp.control().modify_bearer(SGW_TEID, ENB_TEID, ENB_IP)?;
    let mut batch = batch_of(&[downlink_frame(PDN_SERVER_IP, 80, b"later")]);
    let queue_mask = worker.process_downlink(&mut batch);
    assert!(queue_mask.is_empty());
    assert_eq!(batch.mask.bits(), 0b1);
    assert_eq!(bearer.downlink_tunnel(), Some((ENB_TEID, ENB_IP)));
    Ok(())
}
