//! In-process federation wiring: brokers and cores connected by channel
//! routes inside one process. This is the transport used by the test suite
//! and by single-process federations; external transports only need to
//! supply their own [`BrokerConnector`](crate::broker_base::BrokerConnector)
//! and route implementations.

use conflux_core::RouteId;

use crate::broker::{Broker, BrokerLink};
use crate::broker_base::{BaseConfig, ChannelConnector};
use crate::core::{Core, CoreLink};
use crate::routes::RouteSet;

/// Spawn a root broker.
pub fn broker(config: BaseConfig) -> BrokerLink {
    Broker::spawn(config)
}

/// Spawn an interior broker under a parent.
pub fn sub_broker(config: BaseConfig, parent: &BrokerLink) -> BrokerLink {
    Broker::spawn_child(config, parent)
}

/// Spawn a core attached to a broker over channel routes.
pub fn core(config: BaseConfig, parent: &BrokerLink) -> CoreLink {
    Core::spawn(config, |sender| {
        let routes = RouteSet::default();
        routes.add(RouteId::PARENT, parent.attach_child(sender));
        Box::new(ChannelConnector::new(routes))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::TimeProperties;
    use conflux_core::flags::FederateFlags;
    use conflux_core::{IterationRequest, IterationResult, Time};

    /// A two-federate value federation brought from creation to a granted
    /// time, entirely in-process.
    #[test_log::test(tokio::test)]
    async fn single_core_value_federation() {
        let broker = broker(BaseConfig::named("root"));
        let core = core(BaseConfig::named("core1"), &broker);
        core.connect().await.unwrap();

        let source = core
            .register_federate("src", TimeProperties::default(), FederateFlags::default())
            .await
            .unwrap();
        let sink = core
            .register_federate("snk", TimeProperties::default(), FederateFlags::default())
            .await
            .unwrap();

        let publication = source
            .register_global_publication("pressure", "double", "Pa")
            .await
            .unwrap();
        let input = sink.register_global_input("reading", "double", "Pa").await.unwrap();
        sink.add_publication_source(input, "pressure").unwrap();

        let (a, b) = tokio::join!(
            source.enter_initializing_mode(),
            sink.enter_initializing_mode()
        );
        a.unwrap();
        b.unwrap();

        let (a, b) = tokio::join!(
            source.enter_executing_mode(IterationRequest::NoIteration),
            sink.enter_executing_mode(IterationRequest::NoIteration)
        );
        assert_eq!(a.unwrap(), IterationResult::NextStep);
        assert_eq!(b.unwrap(), IterationResult::NextStep);

        source.publish(publication, b"101325").unwrap();

        let (granted_src, granted_snk) = tokio::join!(
            source.request_time(Time::from_seconds(1.0)),
            sink.request_time(Time::from_seconds(1.0))
        );
        assert_eq!(granted_src.unwrap(), Time::from_seconds(1.0));
        assert_eq!(granted_snk.unwrap(), Time::from_seconds(1.0));

        let value = sink.get_value(input).await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"101325"[..]));

        source.finalize().await.unwrap();
        sink.finalize().await.unwrap();
        core.disconnect().await;
        broker.wait_for_disconnect().await;
    }

    /// Identity negotiation fails cleanly when the parent is gone.
    #[test_log::test(tokio::test)]
    async fn connect_times_out_without_a_parent() {
        let broker = broker(BaseConfig::named("root"));
        let mut config = BaseConfig::named("orphan");
        config.connect_timeout = std::time::Duration::from_millis(100);
        let core = core(config, &broker);
        // Tear the broker down before the core says hello.
        broker.disconnect().await;
        let err = core.connect().await.unwrap_err();
        assert!(matches!(err, crate::errors::Error::Connection(_)));
    }
}
