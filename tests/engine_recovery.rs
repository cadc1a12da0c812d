use std::time::Duration;

use instmux::loopback::LinkEvent;
use instmux::{CommandTable, Endpoint, LinkConfig, LoopbackLink, MuxError, PortRegistry};
use tokio::time::Instant;

async fn bound_rate(link: &LoopbackLink) -> (PortRegistry, instmux::ChannelHandle) {
    link.push_reply("SDG ready");
    let registry = PortRegistry::new();
    registry
        .register(
            "sdg",
            Endpoint::Loopback(link.clone()),
            CommandTable::coherent_sdg().expect("sdg table"),
            LinkConfig::default(),
        )
        .expect("register");
    let rate = registry.bind("sdg", 0, 1).await.expect("bind rate");
    (registry, rate)
}

#[tokio::test(start_paused = true)]
async fn short_write_pulses_link_and_counts_a_drop() {
    let link = LoopbackLink::new();
    let (_registry, rate) = bound_rate(&link).await;
    let connects = link.count(&LinkEvent::Connect);

    link.push_short_write(7);
    let err = rate.read_int().await.unwrap_err();
    assert!(
        matches!(err, MuxError::TransportWriteShort { requested: 10, written: 7 }),
        "{err}"
    );

    assert_eq!(link.count(&LinkEvent::Disconnect), 1);
    assert_eq!(link.count(&LinkEvent::Connect), connects + 1);
    assert_eq!(link.events().last(), Some(&LinkEvent::Connect));
    assert!(link.is_connected());

    let counters = rate.port().counters();
    assert_eq!(counters.connection_drops, 1);
    let report = rate.port().report(0);
    assert!(report.contains("drops 1"), "{report}");
}

#[tokio::test(start_paused = true)]
async fn failed_exchange_is_not_retried() {
    let link = LoopbackLink::new();
    let (_registry, rate) = bound_rate(&link).await;
    let before = link.count(&LinkEvent::Sent("read:rate?".into()));

    link.push_failure("line noise");
    assert!(matches!(rate.read_int().await, Err(MuxError::TransportFailure(_))));
    assert_eq!(link.count(&LinkEvent::Sent("read:rate?".into())), before + 1);

    // the pulsed link serves the next call normally
    link.push_reply("0042");
    assert_eq!(rate.read_int().await.expect("read after recovery"), 42);
}

#[tokio::test(start_paused = true)]
async fn rejected_write_does_not_touch_the_link() {
    let link = LoopbackLink::new();
    let (_registry, rate) = bound_rate(&link).await;

    link.push_reply("ERR");
    let err = rate.write_int(5).await.unwrap_err();
    assert!(matches!(&err, MuxError::DeviceRejected { reply } if reply == "ERR"), "{err}");
    assert_eq!(rate.port().counters().connection_drops, 0);
    assert_eq!(link.count(&LinkEvent::Disconnect), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_reconnect_leaves_link_down_until_next_pulse() {
    let link = LoopbackLink::new();
    let (_registry, rate) = bound_rate(&link).await;

    link.push_failure("cable pulled");
    link.fail_next_connects(1);
    assert!(rate.read_int().await.is_err());
    assert!(!link.is_connected());

    // fails fast on the dead link, pulses again, this time successfully
    assert!(rate.read_int().await.is_err());
    assert!(link.is_connected());
    assert_eq!(rate.port().counters().connection_drops, 2);

    link.push_reply("7");
    assert_eq!(rate.read_int().await.expect("read"), 7);
}

#[tokio::test(start_paused = true)]
async fn turnaround_follows_success_and_failure() {
    let link = LoopbackLink::new();
    let (_registry, rate) = bound_rate(&link).await;
    // the SDG table asks for 100 ms between transactions
    let turnaround = Duration::from_millis(100);

    link.push_reply("1");
    let t0 = Instant::now();
    rate.read_int().await.expect("read");
    assert!(t0.elapsed() >= turnaround);

    link.push_failure("boom");
    let t1 = Instant::now();
    assert!(rate.read_int().await.is_err());
    assert!(t1.elapsed() >= turnaround);
}

#[tokio::test(start_paused = true)]
async fn write_only_instrument_skips_turnaround() {
    let link = LoopbackLink::new();
    link.push_reply("Stanford Research Systems,DG645,s/n001234,ver1.14.10E");
    let registry = PortRegistry::new();
    registry
        .register(
            "dg",
            Endpoint::Loopback(link.clone()),
            CommandTable::dg645().expect("dg645 table"),
            LinkConfig::default().with_turnaround(Duration::from_millis(50)),
        )
        .expect("register");
    let clear = registry.bind("dg", 0, 3).await.expect("bind *CLS");

    let t0 = Instant::now();
    clear.write_int(0).await.expect("write-only");
    assert_eq!(t0.elapsed(), Duration::ZERO);
    assert_eq!(clear.port().counters().write_onlys, 2);
    assert_eq!(link.sent().last().map(String::as_str), Some("*CLS"));
}
