use instmux::engine::{ACK, ENQ, NAK};
use instmux::{CommandTable, Endpoint, LinkConfig, LoopbackLink, MuxError, PortRegistry};

fn tpg_registry(link: &LoopbackLink) -> PortRegistry {
    let registry = PortRegistry::new();
    registry
        .register(
            "tpg",
            Endpoint::Loopback(link.clone()),
            CommandTable::tpg261().expect("tpg261 table"),
            LinkConfig::default(),
        )
        .expect("register");
    registry
}

#[tokio::test(start_paused = true)]
async fn pressure_is_fetched_with_enquiry() {
    let link = LoopbackLink::new();
    let registry = tpg_registry(&link);

    link.push_reply(ACK);
    link.push_reply("TPR");
    let pressure = registry.bind("tpg", 0, 1).await.expect("bind pressure");
    let status = registry.bind("tpg", 0, 2).await.expect("bind status");
    assert_eq!(pressure.port().identity(), "TPR");
    assert!(pressure.port().is_initialized());

    link.push_reply(ACK);
    link.push_reply("1,8.3400E-03");
    let p = pressure.read_float().await.expect("pressure");
    assert!((p - 8.34e-3).abs() < 1e-12, "{p}");
    assert_eq!(status.read_int().await.expect("status"), 1);

    assert_eq!(link.sent(), ["TID", ENQ, "PR1", ENQ]);
    assert_eq!(pressure.port().counters().completed_exchanges, 4);
}

#[tokio::test(start_paused = true)]
async fn nak_is_a_rejection_without_enquiry() {
    let link = LoopbackLink::new();
    let registry = tpg_registry(&link);
    link.push_reply(ACK);
    link.push_reply("TPR");
    let unit = registry.bind("tpg", 0, 10).await.expect("bind unit");

    link.push_reply(NAK);
    let err = unit.write_int(7).await.unwrap_err();
    assert!(matches!(&err, MuxError::DeviceRejected { reply } if reply == NAK), "{err}");
    assert_eq!(link.sent().last().map(String::as_str), Some("UNI,7"));
    assert_eq!(unit.port().counters().connection_drops, 0);

    link.push_reply(ACK);
    link.push_reply("1");
    unit.write_int(1).await.expect("write accepted");
    assert_eq!(link.sent()[link.sent().len() - 2..], ["UNI,1", ENQ]);
}

#[tokio::test(start_paused = true)]
async fn missing_identification_leaves_gauge_uninitialized() {
    let link = LoopbackLink::new();
    let registry = tpg_registry(&link);
    link.push_reply(NAK);
    let pressure = registry.bind("tpg", 0, 1).await.expect("bind");
    assert!(!pressure.port().is_initialized());
    assert!(matches!(pressure.read_float().await, Err(MuxError::NotInitialized)));
}
