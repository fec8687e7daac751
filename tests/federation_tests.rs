//! End-to-end federation behavior: registration, barriers, values,
//! translators, queries, errors and teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use conflux::{
    ops, Error, FederateConfig, FederateMode, IterationRequest, IterationResult, Sequencing,
    Time,
};

fn secs(s: f64) -> Time {
    Time::from_seconds(s)
}

/// A duplicate global endpoint key is rejected at the root; the first
/// registration stays usable.
#[test_log::test(tokio::test)]
async fn duplicate_global_endpoint_registration_fails() {
    let (broker, cores) = common::federation(&["core1", "core2"]).await;
    let fed_a = common::fed(&cores[0], "fedA").await;
    let fed_b = common::fed(&cores[1], "fedB").await;

    let first = fed_a.register_global_endpoint("shared", "").await.unwrap();
    let err = fed_b.register_global_endpoint("shared", "").await.unwrap_err();
    assert!(matches!(err, Error::Registration(_)), "got {err:?}");

    // The first endpoint still works end to end.
    let sink = fed_b.register_global_endpoint("sink", "").await.unwrap();
    common::start(&[&fed_a, &fed_b]).await;
    first.send_to(b"still alive", "sink").unwrap();
    common::step_all(&[&fed_a, &fed_b], secs(1.0)).await;
    assert_eq!(sink.pending_count().await.unwrap(), 1);

    fed_a.finalize().await.unwrap();
    fed_b.finalize().await.unwrap();
    for core in &cores {
        core.disconnect().await;
    }
    broker.wait_for_disconnect().await;
}

/// Duplicate federate names are rejected federation-wide.
#[test_log::test(tokio::test)]
async fn duplicate_federate_name_fails() {
    let (broker, cores) = common::federation(&["core1", "core2"]).await;
    let _first = common::fed(&cores[0], "twin").await;
    let err = conflux::Federate::create(&cores[1], &FederateConfig::named("twin"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Registration(_)), "got {err:?}");
    broker.disconnect().await;
}

/// Disconnect is idempotent and wakes blocked requests with a connection
/// failure.
#[test_log::test(tokio::test)]
async fn disconnect_is_idempotent_and_wakes_waiters() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let fed_a = common::fed(&cores[0], "fedA").await;
    let fed_b = common::fed(&cores[0], "fedB").await;

    // Both own endpoints, so each constrains the other.
    let _a = fed_a.register_global_endpoint("a", "").await.unwrap();
    let _b = fed_b.register_global_endpoint("b", "").await.unwrap();
    common::start(&[&fed_a, &fed_b]).await;

    // fedA blocks: fedB never requests time.
    let ticket = fed_a.request_time_async(secs(5.0)).unwrap();

    cores[0].disconnect().await;
    let err = ticket.complete().await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {err:?}");

    // A second disconnect lands in the same terminal state.
    cores[0].disconnect().await;
    assert!(cores[0].is_disconnected());

    broker.wait_for_disconnect().await;
}

/// Liveness over an acyclic value graph: every federate that keeps
/// requesting reaches the horizon.
#[test_log::test(tokio::test)]
async fn dag_federation_reaches_the_horizon() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let source = common::fed(&cores[0], "source").await;
    let middle = common::fed(&cores[0], "middle").await;
    let sink = common::fed(&cores[0], "sink").await;

    let p1 = source
        .register_global_publication("stage1", "double", "")
        .await
        .unwrap();
    let i1 = middle.register_global_input("in1", "double", "").await.unwrap();
    i1.subscribe("stage1").unwrap();
    let p2 = middle
        .register_global_publication("stage2", "double", "")
        .await
        .unwrap();
    let i2 = sink.register_global_input("in2", "double", "").await.unwrap();
    i2.subscribe("stage2").unwrap();

    common::start(&[&source, &middle, &sink]).await;

    for step in 1..=5 {
        let t = secs(step as f64);
        p1.publish(format!("s{step}").as_bytes()).unwrap();
        let granted = common::step_all(&[&source, &middle, &sink], t).await;
        for g in granted {
            assert_eq!(g, t);
        }
        p2.publish(&i1.value().await.unwrap().unwrap_or_default()).unwrap();
    }

    // The last published value has propagated down the chain.
    assert_eq!(i2.value().await.unwrap().as_deref(), Some(&b"s4"[..]));

    source.finalize().await.unwrap();
    middle.finalize().await.unwrap();
    sink.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// Values propagate across cores, honoring change suppression.
#[test_log::test(tokio::test)]
async fn values_propagate_across_cores() {
    let (broker, cores) = common::federation(&["pub_core", "sub_core"]).await;
    let publisher = common::fed_with(
        &cores[0],
        FederateConfig {
            only_transmit_on_change: true,
            ..FederateConfig::named("publisher")
        },
    )
    .await;
    let subscriber = common::fed(&cores[1], "subscriber").await;

    let pressure = publisher
        .register_global_publication("pressure", "double", "Pa")
        .await
        .unwrap();
    let gauge = subscriber
        .register_input("gauge", "double", "Pa")
        .await
        .unwrap();
    gauge.subscribe("pressure").unwrap();
    gauge.set_default(b"0").unwrap();

    common::start(&[&publisher, &subscriber]).await;

    // Default value answers before any update arrives.
    assert_eq!(gauge.value().await.unwrap().as_deref(), Some(&b"0"[..]));

    pressure.publish(b"101325").unwrap();
    common::step_all(&[&publisher, &subscriber], secs(1.0)).await;
    assert_eq!(gauge.value().await.unwrap().as_deref(), Some(&b"101325"[..]));
    assert!(gauge.is_updated().await.unwrap());

    // An identical publish is suppressed; the input sees no new update.
    pressure.publish(b"101325").unwrap();
    common::step_all(&[&publisher, &subscriber], secs(2.0)).await;
    assert!(!gauge.is_updated().await.unwrap());

    publisher.finalize().await.unwrap();
    subscriber.finalize().await.unwrap();
    for core in &cores {
        core.disconnect().await;
    }
    broker.wait_for_disconnect().await;
}

/// A translator bridges a publication into the message domain and back.
#[test_log::test(tokio::test)]
async fn translator_bridges_values_and_messages() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let producer = common::fed(&cores[0], "producer").await;
    let consumer = common::fed(&cores[0], "consumer").await;

    let volts = producer
        .register_global_publication("volts", "double", "V")
        .await
        .unwrap();
    let mailbox = consumer.register_global_endpoint("mailbox", "").await.unwrap();
    let reading = producer
        .register_global_input("reading", "double", "V")
        .await
        .unwrap();

    let translator = producer
        .register_translator("xlate", "double", "V")
        .await
        .unwrap();
    translator.set_operator(Arc::new(ops::JsonTranslator)).unwrap();
    // Value side listens to the publication; endpoint side feeds the
    // mailbox; the publication side feeds the input back.
    translator.add_publication_source("volts").unwrap();
    translator.add_destination_target("mailbox").unwrap();
    reading.subscribe("xlate").unwrap();

    common::start(&[&producer, &consumer]).await;

    volts.publish(b"230").unwrap();
    common::step_all(&[&producer, &consumer], secs(1.0)).await;

    let message = mailbox.receive().await.unwrap().expect("translated message");
    assert_eq!(message.source, "xlate");
    let decoded: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
    assert!(decoded.get("value").is_some(), "payload is JSON: {decoded}");

    // Message domain back into the value domain.
    mailbox.send_to(&message.payload, "xlate").unwrap();
    common::step_all(&[&producer, &consumer], secs(2.0)).await;
    assert_eq!(reading.value().await.unwrap().as_deref(), Some(&b"230"[..]));

    producer.finalize().await.unwrap();
    consumer.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// Ordered queries reflect federation state; fast queries answer without
/// the command loop.
#[test_log::test(tokio::test)]
async fn queries_answer_across_the_tree() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let fed_a = common::fed(&cores[0], "fedA").await;
    let fed_b = common::fed(&cores[0], "fedB").await;
    let _ep = fed_a.register_global_endpoint("porta", "").await.unwrap();

    assert_eq!(
        cores[0].query("core1", "name", Sequencing::Fast).await.unwrap(),
        "\"core1\""
    );

    let federates = cores[0]
        .query("core1", "federates", Sequencing::Ordered)
        .await
        .unwrap();
    assert!(federates.contains("fedA") && federates.contains("fedB"));

    let from_broker = broker
        .query("root", "federates", Sequencing::Ordered)
        .await
        .unwrap();
    assert!(from_broker.contains("fedA"));

    common::start(&[&fed_a, &fed_b]).await;
    let state = fed_a.query("fedA", "state").await.unwrap();
    assert_eq!(state, "\"executing\"");

    common::step_all(&[&fed_a, &fed_b], secs(4.0)).await;
    let time = fed_b.query("fedB", "current_time").await.unwrap();
    assert_eq!(time, "4.0");

    fed_a.finalize().await.unwrap();
    fed_b.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// `delay_init_entry` holds the init barrier until the core is released.
#[test_log::test(tokio::test)]
async fn delayed_init_holds_until_released() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let gated = common::fed_with(
        &cores[0],
        FederateConfig {
            delay_init_entry: true,
            ..FederateConfig::named("gated")
        },
    )
    .await;

    let pending = tokio::spawn({
        let gated = gated.clone();
        async move { gated.enter_initializing_mode().await }
    });

    // The barrier must not open on its own.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished(), "init granted despite the hold");
    assert_eq!(gated.mode(), FederateMode::Created);

    cores[0].set_ready_to_init().await.unwrap();
    pending.await.unwrap().unwrap();
    assert_eq!(gated.mode(), FederateMode::Initializing);

    gated.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// A blocked request past its wall-clock deadline errors out and puts the
/// federate into the error state.
#[test_log::test(tokio::test)]
async fn grant_timeout_fails_the_federate() {
    let (broker, cores) = {
        let broker = conflux::loopback::broker(conflux::BaseConfig::named("root"));
        let mut config = conflux::BaseConfig::named("core1");
        config.tick_period = Duration::from_millis(25);
        let core = conflux::loopback::core(config, &broker);
        core.connect().await.unwrap();
        (broker, vec![core])
    };
    let impatient = common::fed_with(
        &cores[0],
        FederateConfig {
            grant_timeout: Some(100),
            ..FederateConfig::named("impatient")
        },
    )
    .await;
    let silent = common::fed(&cores[0], "silent").await;
    let _a = impatient.register_global_endpoint("a", "").await.unwrap();
    let _b = silent.register_global_endpoint("b", "").await.unwrap();

    common::start(&[&impatient, &silent]).await;

    // `silent` never requests time, so this request can only time out.
    let err = impatient.request_time(secs(10.0)).await.unwrap_err();
    assert!(matches!(err, Error::TimeCoordinationTimeout(_)), "got {err:?}");
    assert_eq!(impatient.mode(), FederateMode::Error);

    // Subsequent requests fail fast; finalize still succeeds.
    assert!(impatient.request_time(secs(11.0)).await.is_err());
    impatient.finalize().await.unwrap();
    silent.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// A global error aborts every federate; finalize still succeeds.
#[test_log::test(tokio::test)]
async fn global_error_aborts_the_federation() {
    let (broker, cores) = common::federation(&["core1", "core2"]).await;
    let fed_a = common::fed(&cores[0], "fedA").await;
    let fed_b = common::fed(&cores[1], "fedB").await;
    let _a = fed_a.register_global_endpoint("a", "").await.unwrap();
    let _b = fed_b.register_global_endpoint("b", "").await.unwrap();

    common::start(&[&fed_a, &fed_b]).await;

    let ticket = fed_b.request_time_async(secs(5.0)).unwrap();
    fed_a.global_error(17, "operator abort").unwrap();

    let err = ticket.complete().await.unwrap_err();
    assert!(
        matches!(err, Error::Global { .. } | Error::Local { .. } | Error::Connection(_)),
        "got {err:?}"
    );

    // Both federates land in the error state, on both cores.
    for fed in [&fed_a, &fed_b] {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while fed.mode() != FederateMode::Error {
            assert!(tokio::time::Instant::now() < deadline, "never reached error state");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fed_a.finalize().await.unwrap();
    fed_b.finalize().await.unwrap();
    for core in &cores {
        core.disconnect().await;
    }
    broker.wait_for_disconnect().await;
}

/// Iterative requests re-enter the granted time with a bumped iteration
/// counter; granted times stay non-decreasing throughout.
#[test_log::test(tokio::test)]
async fn iteration_re_enters_the_same_time() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let fed = common::fed(&cores[0], "solo").await;
    common::start(&[&fed]).await;

    let granted = fed.request_time(secs(1.0)).await.unwrap();
    assert_eq!(granted, secs(1.0));

    let (time, result) = fed
        .request_time_iterative(secs(1.0), IterationRequest::ForceIteration)
        .await
        .unwrap();
    assert_eq!(time, secs(1.0));
    assert_eq!(result, IterationResult::Iterating);

    let (time, result) = fed
        .request_time_iterative(secs(1.0), IterationRequest::IterateIfNeeded)
        .await
        .unwrap();
    assert_eq!(time, secs(1.0));
    assert_eq!(result, IterationResult::NextStep);

    let granted = fed.request_time(secs(2.0)).await.unwrap();
    assert_eq!(granted, secs(2.0));

    fed.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// Sending before executing mode is an invalid-state error.
#[test_log::test(tokio::test)]
async fn send_before_executing_is_rejected() {
    let (broker, cores) = common::federation(&["core1"]).await;
    let fed = common::fed(&cores[0], "early").await;
    let ep = fed.register_global_endpoint("port", "").await.unwrap();

    let err = ep.send_to(b"too soon", "nowhere").unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)), "got {err:?}");

    fed.finalize().await.unwrap();
    cores[0].disconnect().await;
    broker.wait_for_disconnect().await;
}

/// Configuration changes are rejected after connect.
#[test_log::test(tokio::test)]
async fn reconfigure_after_connect_fails() {
    let broker = conflux::loopback::broker(conflux::BaseConfig::named("root"));
    let core = conflux::loopback::core(conflux::BaseConfig::named("core1"), &broker);

    core.configure(conflux::BaseConfig::named("core1")).await.unwrap();
    core.connect().await.unwrap();
    let err = core
        .configure(conflux::BaseConfig::named("renamed"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "got {err:?}");

    core.disconnect().await;
    broker.wait_for_disconnect().await;
}
