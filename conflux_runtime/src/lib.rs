//! The conflux federation kernel: brokers, cores, conservative time
//! coordination, typed value propagation, addressed messages and the
//! filter/translator machinery.
//!
//! A federation is a tree. [`broker::Broker`] nodes form the interior and
//! the root assigns every identity; [`core::Core`] nodes host federates and
//! own their handle tables, routing and time coordination. User code talks
//! to a core through [`core::CoreLink`] / [`core::FederateHandle`], which
//! post command frames to the core's single command task and await replies.

pub mod broker;
pub mod broker_base;
pub mod command;
pub mod coordination;
pub mod core;
pub mod errors;
pub mod federate;
pub mod frame;
pub mod handles;
pub mod interfaces;
pub mod loopback;
pub mod message;
pub mod query;
pub mod queue;
pub mod routes;
pub mod timeout;

pub use self::broker::{Broker, BrokerLink};
pub use self::broker_base::{BaseConfig, BrokerConnector, NodeMode};
pub use self::coordination::{TimeCoordinator, TimeProperties};
pub use self::core::{Core, CoreLink, FederateHandle, TimeTicket};
pub use self::errors::Error;
pub use self::federate::FederateMode;
pub use self::frame::{Action, ControlFrame, FrameCodec, InterfaceKind};
pub use self::interfaces::{FilterOperator, FilterResult, TranslatorOperator};
pub use self::message::Message;
pub use self::query::Sequencing;
