//! State and contracts shared by cores and brokers: identity, lifecycle
//! mode, ingress queues, the disconnection trigger and the connector trait
//! that role-specific nodes implement for their transport.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use conflux_core::{GlobalBrokerId, RouteId};

use crate::errors::Error;
use crate::frame::ControlFrame;
use crate::queue::CommandSender;
use crate::routes::{Route, RouteSet};

/// Lifecycle of a core or broker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    Created,
    Connecting,
    Connected,
    Operating,
    Terminating,
    Terminated,
    Errored,
}

/// Options common to cores and brokers. Parsed configuration files surface
/// as this structure plus the per-federate properties.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BaseConfig {
    pub name: String,
    /// Period of the timeout monitor's ticks.
    pub tick_period: Duration,
    /// Bound on identity negotiation with the parent.
    pub connect_timeout: Duration,
    /// Bound on an ordered query round trip.
    pub query_timeout: Duration,
    pub log_level: i32,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            tick_period: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(15),
            log_level: 0,
        }
    }
}

impl BaseConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Role-specific transport operations of a node.
///
/// The command loop never touches a transport directly; everything goes
/// through this trait so a core/broker body is transport-agnostic.
pub trait BrokerConnector: Send + 'static {
    /// Send one frame on a route. Errors are routed-around, not returned:
    /// a dead route is handled by the disconnect path.
    fn transmit(&self, rid: RouteId, frame: ControlFrame);
    fn add_route(&mut self, rid: RouteId, route: Arc<dyn Route>);
    fn remove_route(&mut self, rid: RouteId);
    /// Transport-level bring-up before the protocol hello.
    fn broker_connect(&mut self) -> Result<(), Error>;
    /// Transport-level teardown after the command loop drains.
    fn broker_disconnect(&mut self);
}

/// Loopback connector: routes are channel sends into neighbor ingress
/// queues; bring-up and teardown are no-ops.
#[derive(Default, Clone)]
pub struct ChannelConnector {
    routes: RouteSet,
}

impl ChannelConnector {
    pub fn new(routes: RouteSet) -> Self {
        Self { routes }
    }
}

impl BrokerConnector for ChannelConnector {
    fn transmit(&self, rid: RouteId, frame: ControlFrame) {
        if let Err(err) = self.routes.transmit(rid, frame) {
            tracing::warn!(route = %rid, "dropping frame on dead route: {err}");
        }
    }

    fn add_route(&mut self, rid: RouteId, route: Arc<dyn Route>) {
        self.routes.add(rid, route);
    }

    fn remove_route(&mut self, rid: RouteId) {
        self.routes.remove(rid);
    }

    fn broker_connect(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn broker_disconnect(&mut self) {}
}

/// The shared kernel of a core or broker: identity, mode, ingress access
/// and the disconnection trigger.
pub struct BrokerBase {
    pub config: BaseConfig,
    pub global_id: GlobalBrokerId,
    pub mode: NodeMode,
    pub sender: CommandSender,
    disconnect_tx: watch::Sender<bool>,
}

impl BrokerBase {
    pub fn new(config: BaseConfig, sender: CommandSender) -> Self {
        let (disconnect_tx, _) = watch::channel(false);
        Self {
            config,
            global_id: GlobalBrokerId::INVALID,
            mode: NodeMode::Created,
            sender,
            disconnect_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Reconfigure; only legal before the connection hello goes out.
    pub fn reconfigure(&mut self, config: BaseConfig) -> Result<(), Error> {
        if !matches!(self.mode, NodeMode::Created) {
            return Err(Error::Configuration(format!(
                "{} is already connected",
                self.config.name
            )));
        }
        self.config = config;
        Ok(())
    }

    pub fn is_terminating(&self) -> bool {
        matches!(
            self.mode,
            NodeMode::Terminating | NodeMode::Terminated | NodeMode::Errored
        )
    }

    /// Move to `Terminating`; returns false when already on the way down.
    pub fn begin_terminate(&mut self) -> bool {
        if self.is_terminating() {
            return false;
        }
        self.mode = NodeMode::Terminating;
        true
    }

    /// Final transition; wakes everything blocked on the trigger.
    pub fn signal_disconnected(&mut self) {
        if self.mode != NodeMode::Errored {
            self.mode = NodeMode::Terminated;
        }
        let _ = self.disconnect_tx.send(true);
    }

    /// A watch that flips to true once the node has fully disconnected.
    pub fn disconnect_watch(&self) -> watch::Receiver<bool> {
        self.disconnect_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;

    #[test]
    fn reconfigure_is_rejected_after_connect() {
        let (tx, _rx) = queue::channel();
        let mut base = BrokerBase::new(BaseConfig::named("n"), tx);
        base.reconfigure(BaseConfig::named("renamed")).unwrap();
        assert_eq!(base.name(), "renamed");

        base.mode = NodeMode::Connecting;
        assert!(matches!(
            base.reconfigure(BaseConfig::named("again")),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_trigger_wakes_watchers() {
        let (tx, _rx) = queue::channel();
        let mut base = BrokerBase::new(BaseConfig::named("n"), tx);
        let mut watch = base.disconnect_watch();
        assert!(!*watch.borrow());

        assert!(base.begin_terminate());
        assert!(!base.begin_terminate());
        base.signal_disconnected();
        watch.changed().await.unwrap();
        assert!(*watch.borrow());
        assert_eq!(base.mode, NodeMode::Terminated);
    }
}
