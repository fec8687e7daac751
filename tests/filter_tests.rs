//! End-to-end filter behavior: delay, staged delay, reroute, cloning and
//! random drop, all over the in-process transport.

mod common;

use std::sync::Arc;

use conflux::{ops, Time};

fn secs(s: f64) -> Time {
    Time::from_seconds(s)
}

/// A source filter with delay 2.5 holds a time-0 message until simulated
/// time 2.5; nothing is visible at 1.0 or 2.0.
#[test_log::test(tokio::test)]
async fn delay_filter_shifts_delivery() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let fed_a = common::fed(&cores[0], "fedA").await;
    let fed_b = common::fed(&cores[0], "fedB").await;

    let port1 = fed_a.register_global_endpoint("port1", "").await.unwrap();
    let port2 = fed_b.register_global_endpoint("port2", "").await.unwrap();

    let filter = fed_a.register_filter("filter1").await.unwrap();
    filter
        .set_operator(Arc::new(ops::DelayFilter::new(secs(2.5))))
        .unwrap();
    filter.add_source_target("port1").unwrap();

    common::start(&[&fed_a, &fed_b]).await;

    port1.send_to(&[0xAB; 500], "port2").unwrap();

    common::step_all(&[&fed_a, &fed_b], secs(1.0)).await;
    assert_eq!(port2.pending_count().await.unwrap(), 0, "nothing at t=1");

    common::step_all(&[&fed_a, &fed_b], secs(2.0)).await;
    assert_eq!(port2.pending_count().await.unwrap(), 0, "nothing at t=2");

    let granted = common::step_all(&[&fed_a, &fed_b], secs(3.0)).await;
    assert_eq!(granted[0], secs(3.0));
    // The receiver is woken at the message's effective time.
    assert_eq!(granted[1], secs(2.5));

    let message = port2.receive().await.unwrap().expect("delayed message");
    assert_eq!(message.time, secs(2.5));
    assert_eq!(message.source, "port1");
    assert_eq!(message.original_source, "port1");
    assert_eq!(message.dest, "port2");
    assert_eq!(message.payload.len(), 500);
    // Causal: delivery no earlier than send time plus the filter delay.
    assert!(message.time >= secs(0.0) + secs(2.5));

    fed_a.finalize().await.unwrap();
    fed_b.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// Two staged delay filters of 1.25 each compose to an end-to-end delay of
/// 2.5.
#[test_log::test(tokio::test)]
async fn two_stage_delay_filters_compose() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let fed_a = common::fed(&cores[0], "fedA").await;
    let fed_b = common::fed(&cores[0], "fedB").await;

    let port1 = fed_a.register_global_endpoint("port1", "").await.unwrap();
    let port2 = fed_b.register_global_endpoint("port2", "").await.unwrap();

    for name in ["stage1", "stage2"] {
        let filter = fed_a.register_filter(name).await.unwrap();
        filter
            .set_operator(Arc::new(ops::DelayFilter::new(secs(1.25))))
            .unwrap();
        filter.add_source_target("port1").unwrap();
    }

    common::start(&[&fed_a, &fed_b]).await;
    port1.send_to(b"staged", "port2").unwrap();

    common::step_all(&[&fed_a, &fed_b], secs(1.0)).await;
    assert_eq!(port2.pending_count().await.unwrap(), 0);
    common::step_all(&[&fed_a, &fed_b], secs(2.0)).await;
    assert_eq!(port2.pending_count().await.unwrap(), 0);

    let granted = common::step_all(&[&fed_a, &fed_b], secs(3.0)).await;
    assert!(granted[1] >= secs(2.5), "no delivery before 2.5");

    let message = port2.receive().await.unwrap().expect("staged message");
    assert_eq!(message.time, secs(2.5));

    fed_a.finalize().await.unwrap();
    fed_b.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// A reroute filter with a matching condition diverts traffic to another
/// endpoint, preserving the original destination.
#[test_log::test(tokio::test)]
async fn reroute_filter_diverts_matching_messages() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let fed_a = common::fed(&cores[0], "fedA").await;
    let fed_b = common::fed(&cores[0], "fedB").await;

    let port1 = fed_a.register_global_endpoint("port1", "").await.unwrap();
    let endpt2 = fed_b.register_global_endpoint("endpt2", "").await.unwrap();
    let port3 = fed_b.register_global_endpoint("port3", "").await.unwrap();

    let filter = fed_a.register_filter("reroute1").await.unwrap();
    filter
        .set_operator(Arc::new(
            ops::RerouteFilter::new("port3").with_condition("end"),
        ))
        .unwrap();
    filter.add_source_target("port1").unwrap();

    common::start(&[&fed_a, &fed_b]).await;
    port1.send_to(b"diverted", "endpt2").unwrap();

    common::step_all(&[&fed_a, &fed_b], secs(1.0)).await;

    assert_eq!(endpt2.pending_count().await.unwrap(), 0, "original target stays empty");
    let message = port3.receive().await.unwrap().expect("rerouted message");
    assert_eq!(message.dest, "port3");
    assert_eq!(message.original_dest, "endpt2");
    assert_eq!(message.original_source, "port1");

    fed_a.finalize().await.unwrap();
    fed_b.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// A cloning filter delivers the primary message unchanged and a copy to
/// the delivery endpoint with the original destination preserved.
#[test_log::test(tokio::test)]
async fn cloning_filter_copies_to_delivery_endpoints() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let sender = common::fed(&cores[0], "sender").await;
    let receiver = common::fed(&cores[0], "receiver").await;
    let monitor = common::fed(&cores[0], "monitor").await;

    let src = sender.register_global_endpoint("src", "").await.unwrap();
    let dest = receiver.register_global_endpoint("dest", "").await.unwrap();
    let cm = monitor.register_global_endpoint("cm", "").await.unwrap();

    let filter = sender.register_cloning_filter("watcher").await.unwrap();
    filter.set_operator(Arc::new(ops::CloneFilter)).unwrap();
    filter.add_delivery_endpoint("cm").unwrap();
    filter.add_source_target("src").unwrap();

    common::start(&[&sender, &receiver, &monitor]).await;
    src.send_to(&[7u8; 500], "dest").unwrap();

    common::step_all(&[&sender, &receiver, &monitor], secs(1.0)).await;

    let primary = dest.receive().await.unwrap().expect("primary message");
    assert_eq!(primary.dest, "dest");
    assert_eq!(primary.original_dest, "dest");
    assert_eq!(primary.payload.len(), 500);

    let copy = cm.receive().await.unwrap().expect("cloned copy");
    assert_eq!(copy.dest, "cm");
    assert_eq!(copy.original_dest, "dest");
    assert_eq!(copy.original_source, "src");
    assert_eq!(copy.payload, primary.payload);

    sender.finalize().await.unwrap();
    receiver.finalize().await.unwrap();
    monitor.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// A random-drop filter with p = 0.75 over 200 trials keeps the observed
/// drop fraction inside the 4.5-sigma band.
#[test_log::test(tokio::test)]
async fn random_drop_filter_statistics() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let fed_a = common::fed(&cores[0], "fedA").await;
    let fed_b = common::fed(&cores[0], "fedB").await;

    let tx = fed_a.register_global_endpoint("tx", "").await.unwrap();
    let rx = fed_b.register_global_endpoint("rx", "").await.unwrap();

    let filter = fed_a.register_filter("lossy").await.unwrap();
    filter
        .set_operator(Arc::new(ops::RandomDropFilter::new(0.75)))
        .unwrap();
    filter.add_source_target("tx").unwrap();

    common::start(&[&fed_a, &fed_b]).await;

    const TRIALS: usize = 200;
    for _ in 0..TRIALS {
        tx.send_to(b"trial", "rx").unwrap();
    }
    common::step_all(&[&fed_a, &fed_b], secs(1.0)).await;

    let delivered = rx.pending_count().await.unwrap() as f64;
    let dropped_fraction = 1.0 - delivered / TRIALS as f64;
    let sigma = (0.75 * 0.25 / TRIALS as f64).sqrt();
    let band = 4.5 * sigma;
    assert!(
        (dropped_fraction - 0.75).abs() <= band,
        "drop fraction {dropped_fraction} outside 0.75 +/- {band}"
    );

    fed_a.finalize().await.unwrap();
    fed_b.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// Filters keep working when source and destination live on different
/// cores: the message detours through the hosting core's operator federate.
#[test_log::test(tokio::test)]
async fn delay_filter_across_cores() {
    let (broker, cores) = common::federation(&["core1", "core2"]).await;
    let fed_a = common::fed(&cores[0], "fedA").await;
    let fed_b = common::fed(&cores[1], "fedB").await;

    let port1 = fed_a.register_global_endpoint("port1", "").await.unwrap();
    let port2 = fed_b.register_global_endpoint("port2", "").await.unwrap();

    let filter = fed_a.register_filter("wirelag").await.unwrap();
    filter
        .set_operator(Arc::new(ops::DelayFilter::new(secs(2.5))))
        .unwrap();
    filter.add_source_target("port1").unwrap();

    common::start(&[&fed_a, &fed_b]).await;
    port1.send_to(b"cross-core", "port2").unwrap();

    common::step_all(&[&fed_a, &fed_b], secs(1.0)).await;
    assert_eq!(port2.pending_count().await.unwrap(), 0);

    let granted = common::step_all(&[&fed_a, &fed_b], secs(3.0)).await;
    assert!(granted[1] >= secs(2.5));
    let message = port2.receive().await.unwrap().expect("cross-core message");
    assert_eq!(message.time, secs(2.5));
    assert_eq!(message.original_source, "port1");

    fed_a.finalize().await.unwrap();
    fed_b.finalize().await.unwrap();
    for core in &cores {
        core.disconnect().await;
    }
    broker.wait_for_disconnect().await;
}
