//! Shared setup for the end-to-end federation tests: an in-process broker
//! tree with one or more cores, all over loopback routes.

use conflux::{
    loopback, BaseConfig, BrokerLink, CoreLink, Federate, FederateConfig, IterationRequest,
};

pub async fn federation(core_names: &[&str]) -> (BrokerLink, Vec<CoreLink>) {
    let broker = loopback::broker(BaseConfig::named("root"));
    let mut cores = Vec::new();
    for name in core_names {
        let core = loopback::core(BaseConfig::named(*name), &broker);
        core.connect().await.expect("core connects");
        cores.push(core);
    }
    (broker, cores)
}

pub async fn fed(core: &CoreLink, name: &str) -> Federate {
    Federate::create(core, &FederateConfig::named(name))
        .await
        .expect("federate registers")
}

pub async fn fed_with(core: &CoreLink, config: FederateConfig) -> Federate {
    Federate::create(core, &config).await.expect("federate registers")
}

/// Drive every federate through the init and exec barriers together.
pub async fn start(feds: &[&Federate]) {
    let inits = futures::future::join_all(feds.iter().map(|f| f.enter_initializing_mode())).await;
    for result in inits {
        result.expect("initializing mode");
    }
    let execs = futures::future::join_all(
        feds.iter()
            .map(|f| f.enter_executing_mode(IterationRequest::NoIteration)),
    )
    .await;
    for result in execs {
        result.expect("executing mode");
    }
}

/// Advance every federate to `time` together. Grants earlier than the
/// target (event wake-ups) are re-requested until the target is reached;
/// the returned times are each federate's *first* grant of the step.
pub async fn step_all(feds: &[&Federate], time: conflux::Time) -> Vec<conflux::Time> {
    futures::future::join_all(feds.iter().map(|f| async move {
        let first = f.request_time(time).await.expect("time granted");
        let mut granted = first;
        while granted < time {
            granted = f.request_time(time).await.expect("time granted");
        }
        first
    }))
    .await
}
