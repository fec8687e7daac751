//! conflux is a co-simulation runtime: it federates independent simulators
//! into one logical simulation with globally-consistent virtual time and
//! typed inter-simulator communication.
//!
//! The workspace splits into three layers, re-exported here:
//!
//! * [`conflux_core`] — identifiers, fixed-point simulation time, flags.
//! * [`conflux_runtime`] — brokers, cores, the conservative time protocol,
//!   routing, endpoint queues and the filter/translator machinery.
//! * [`conflux_federate`] — the federate-facing API: typed interfaces,
//!   configuration and the built-in operators.

pub use conflux_core::{
    GlobalBrokerId, GlobalFederateId, GlobalHandle, InterfaceHandle, IterationRequest,
    IterationResult, LocalFederateId, RouteId, Time,
};
pub use conflux_federate::{
    ops, Endpoint, Federate, FederateConfig, Filter, Input, Publication, Translator,
};
pub use conflux_runtime::{
    loopback, BaseConfig, BrokerLink, CoreLink, Error, FederateMode, FilterOperator,
    FilterResult, Message, Sequencing, TimeTicket, TranslatorOperator,
};
