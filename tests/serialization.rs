use std::sync::Arc;
use std::time::Duration;

use instmux::{CommandTable, Endpoint, LinkConfig, LoopbackLink, PortRegistry};

const GAUGE: &str = r#"
[instrument]
name = "Test gauge"
acknowledge = "ok"
turnaround_ms = 1

[[command]]
id = 1
read = "P?"
read_kind = "float"
write = "P %.2f"
write_kind = "float"
description = "Pressure setpoint"

[[command]]
id = 2
read = "T?"
read_kind = "int"
description = "Temperature"
"#;

fn gauge_link() -> LoopbackLink {
    LoopbackLink::new()
        .with_responder(|req| match req {
            "P?" => Some("1.50".to_string()),
            "T?" => Some("21".to_string()),
            r if r.starts_with("P ") => Some("OK".to_string()),
            _ => Some("ERR".to_string()),
        })
        .with_latency(Duration::from_millis(5))
}

#[tokio::test(start_paused = true)]
async fn concurrent_channels_never_overlap_on_the_link() {
    let link = gauge_link();
    let table: CommandTable = GAUGE.parse().expect("gauge table");
    let registry = Arc::new(PortRegistry::new());
    registry
        .register("gauge", Endpoint::Loopback(link.clone()), Arc::new(table), LinkConfig::default())
        .expect("register");

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            let setpoint = registry.bind("gauge", 0, 1).await.expect("bind 1");
            let temp = registry.bind("gauge", 0, 2).await.expect("bind 2");
            for _ in 0..5 {
                setpoint.write_float(f64::from(i)).await.expect("write");
                assert!((setpoint.read_float().await.expect("read") - 1.5).abs() < 1e-9);
                assert_eq!(temp.read_int().await.expect("read"), 21);
            }
        }));
    }
    for t in tasks {
        t.await.expect("task");
    }

    assert_eq!(link.overlaps(), 0);
    assert_eq!(registry.port_count(), 1);
    let port = registry.port("gauge", 0).expect("port");
    let counters = port.counters();
    assert_eq!(counters.completed_exchanges, 8 * 5 * 3);
    assert_eq!(counters.connection_drops, 0);
    assert_eq!(link.sent().len(), 8 * 5 * 3);
}

#[tokio::test(start_paused = true)]
async fn pair_edit_holds_the_lock_across_both_exchanges() {
    let link = LoopbackLink::new().with_latency(Duration::from_millis(2));
    link.push_reply("SRS,DG645,mock");
    let registry = Arc::new(PortRegistry::new());
    registry
        .register(
            "dg",
            Endpoint::Loopback(link.clone()),
            CommandTable::dg645().expect("dg645"),
            LinkConfig::default(),
        )
        .expect("register");
    let delay = registry.bind("dg", 0, 101).await.expect("bind delay");
    let status = registry.bind("dg", 0, 1).await.expect("bind status");

    // the pair read for the delay write, then the status query
    link.push_reply("3,+0.000001000000");
    link.push_reply("0");
    let (w, s) = tokio::join!(delay.write_float(2.5e-6), status.read_text(40));
    w.expect("write");
    assert_eq!(s.expect("status"), "STATUS OK");

    let sent = link.sent();
    let n = sent.len();
    assert_eq!(sent[n - 3], "DLAY?2");
    assert_eq!(sent[n - 2], "DLAY 2,3,2.500000e-06");
    assert_eq!(sent[n - 1], "LERR?");
    assert_eq!(link.overlaps(), 0);
}

#[tokio::test(start_paused = true)]
async fn addresses_on_one_link_share_its_lock() {
    let link = gauge_link();
    let table: CommandTable = GAUGE.parse().expect("gauge table");
    let registry = PortRegistry::new();
    registry
        .register("gauge", Endpoint::Loopback(link.clone()), Arc::new(table), LinkConfig::default())
        .expect("register");

    let first = registry.bind("gauge", 0, 1).await.expect("bind address 0");
    let second = registry.bind("gauge", 1, 1).await.expect("bind address 1");
    assert!(!Arc::ptr_eq(first.port(), second.port()));
    assert!(Arc::ptr_eq(first.port().link(), second.port().link()));

    for _ in 0..3 {
        let (a, b) = tokio::join!(first.read_float(), second.read_float());
        assert!((a.expect("address 0") - 1.5).abs() < 1e-9);
        assert!((b.expect("address 1") - 1.5).abs() < 1e-9);
    }

    assert_eq!(link.overlaps(), 0);
    assert_eq!(link.count(&instmux::loopback::LinkEvent::Connect), 1);
    assert_eq!(first.port().counters().completed_exchanges, 6);
    assert_eq!(registry.port_count(), 2);
}
