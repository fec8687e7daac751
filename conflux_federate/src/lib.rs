//! Federate-facing API: typed interface handles over a core link, the
//! configuration surface, and the built-in filter/translator operators.

pub mod config;
pub mod ops;

use std::sync::Arc;

use conflux_core::{InterfaceHandle, IterationRequest, IterationResult, Time};
use conflux_runtime::core::{CoreLink, FederateHandle, TimeTicket};
use conflux_runtime::errors::Error;
use conflux_runtime::federate::FederateMode;
use conflux_runtime::interfaces::{FilterOperator, TranslatorOperator};
use conflux_runtime::message::Message;

pub use config::FederateConfig;

/// A federate participating in a co-simulation.
///
/// Thin typed wrapper over the core-side federate handle; all state lives
/// with the core, and every call posts a command frame.
#[derive(Clone, Debug)]
pub struct Federate {
    handle: FederateHandle,
}

impl Federate {
    /// Register a federate on a connected core.
    pub async fn create(core: &CoreLink, config: &FederateConfig) -> Result<Self, Error> {
        tracing::debug!(federate = %config.name, core = %core.name(), "registering federate");
        let handle = core
            .register_federate(&config.name, config.time_properties(), config.federate_flags())
            .await?;
        Ok(Self { handle })
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn mode(&self) -> FederateMode {
        self.handle.mode()
    }

    /// The raw core-side handle, for operations not wrapped here.
    pub fn raw(&self) -> &FederateHandle {
        &self.handle
    }

    // ---- interface registration ----

    pub async fn register_publication(
        &self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<Publication, Error> {
        let handle = self.handle.register_publication(key, type_name, units).await?;
        Ok(Publication {
            fed: self.handle.clone(),
            handle,
        })
    }

    pub async fn register_global_publication(
        &self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<Publication, Error> {
        let handle = self
            .handle
            .register_global_publication(key, type_name, units)
            .await?;
        Ok(Publication {
            fed: self.handle.clone(),
            handle,
        })
    }

    pub async fn register_input(
        &self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<Input, Error> {
        let handle = self.handle.register_input(key, type_name, units).await?;
        Ok(Input {
            fed: self.handle.clone(),
            handle,
        })
    }

    pub async fn register_global_input(
        &self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<Input, Error> {
        let handle = self.handle.register_global_input(key, type_name, units).await?;
        Ok(Input {
            fed: self.handle.clone(),
            handle,
        })
    }

    pub async fn register_endpoint(&self, key: &str, type_name: &str) -> Result<Endpoint, Error> {
        let handle = self.handle.register_endpoint(key, type_name).await?;
        Ok(Endpoint {
            fed: self.handle.clone(),
            handle,
        })
    }

    pub async fn register_global_endpoint(
        &self,
        key: &str,
        type_name: &str,
    ) -> Result<Endpoint, Error> {
        let handle = self.handle.register_global_endpoint(key, type_name).await?;
        Ok(Endpoint {
            fed: self.handle.clone(),
            handle,
        })
    }

    pub async fn register_filter(&self, key: &str) -> Result<Filter, Error> {
        let handle = self.handle.register_filter(key).await?;
        Ok(Filter {
            fed: self.handle.clone(),
            handle,
        })
    }

    pub async fn register_cloning_filter(&self, key: &str) -> Result<Filter, Error> {
        let handle = self.handle.register_cloning_filter(key).await?;
        Ok(Filter {
            fed: self.handle.clone(),
            handle,
        })
    }

    pub async fn register_translator(
        &self,
        key: &str,
        type_name: &str,
        units: &str,
    ) -> Result<Translator, Error> {
        let handle = self.handle.register_translator(key, type_name, units).await?;
        Ok(Translator {
            fed: self.handle.clone(),
            handle,
        })
    }

    // ---- lifecycle ----

    pub async fn enter_initializing_mode(&self) -> Result<(), Error> {
        self.handle.enter_initializing_mode().await
    }

    pub async fn enter_executing_mode(
        &self,
        iterate: IterationRequest,
    ) -> Result<IterationResult, Error> {
        self.handle.enter_executing_mode(iterate).await
    }

    pub async fn request_time(&self, time: Time) -> Result<Time, Error> {
        self.handle.request_time(time).await
    }

    pub async fn request_time_iterative(
        &self,
        time: Time,
        iterate: IterationRequest,
    ) -> Result<(Time, IterationResult), Error> {
        self.handle.request_time_iterative(time, iterate).await
    }

    /// Submit a time request without blocking; complete it later through
    /// the returned ticket.
    pub fn request_time_async(&self, time: Time) -> Result<TimeTicket, Error> {
        self.handle
            .request_time_async(time, IterationRequest::NoIteration)
    }

    pub async fn current_time(&self) -> Result<Time, Error> {
        self.handle.current_time().await
    }

    pub async fn finalize(&self) -> Result<(), Error> {
        self.handle.finalize().await
    }

    pub fn local_error(&self, code: i32, message: &str) -> Result<(), Error> {
        self.handle.local_error(code, message)
    }

    pub fn global_error(&self, code: i32, message: &str) -> Result<(), Error> {
        self.handle.global_error(code, message)
    }

    pub async fn query(&self, target: &str, query: &str) -> Result<String, Error> {
        self.handle.query(target, query).await
    }

    /// Pop the earliest available message across all of this federate's
    /// endpoints.
    pub async fn receive_any(&self) -> Result<Option<(InterfaceHandle, Message)>, Error> {
        self.handle.receive_any().await
    }

    pub async fn pending_count(&self) -> Result<u64, Error> {
        self.handle.pending_count_any().await
    }
}

/// A registered publication.
#[derive(Clone)]
pub struct Publication {
    fed: FederateHandle,
    handle: InterfaceHandle,
}

impl Publication {
    pub fn handle(&self) -> InterfaceHandle {
        self.handle
    }

    pub fn publish(&self, data: &[u8]) -> Result<(), Error> {
        self.fed.publish(self.handle, data)
    }

    /// Point this publication at a named input.
    pub fn add_target(&self, input: &str) -> Result<(), Error> {
        self.fed.add_value_target(self.handle, input)
    }
}

/// A registered input.
#[derive(Clone)]
pub struct Input {
    fed: FederateHandle,
    handle: InterfaceHandle,
}

impl Input {
    pub fn handle(&self) -> InterfaceHandle {
        self.handle
    }

    /// Subscribe to a named publication.
    pub fn subscribe(&self, publication: &str) -> Result<(), Error> {
        self.fed.add_publication_source(self.handle, publication)
    }

    pub async fn value(&self) -> Result<Option<Vec<u8>>, Error> {
        self.fed.get_value(self.handle).await
    }

    pub async fn is_updated(&self) -> Result<bool, Error> {
        self.fed.is_updated(self.handle).await
    }

    pub fn set_default(&self, data: &[u8]) -> Result<(), Error> {
        self.fed.set_default_value(self.handle, data)
    }
}

/// A registered endpoint.
#[derive(Clone, Debug)]
pub struct Endpoint {
    fed: FederateHandle,
    handle: InterfaceHandle,
}

impl Endpoint {
    pub fn handle(&self) -> InterfaceHandle {
        self.handle
    }

    pub fn send(&self, payload: &[u8]) -> Result<(), Error> {
        self.fed.send(self.handle, payload)
    }

    pub fn send_to(&self, payload: &[u8], dest: &str) -> Result<(), Error> {
        self.fed.send_to(self.handle, payload, dest)
    }

    pub fn send_at(&self, payload: &[u8], time: Time) -> Result<(), Error> {
        self.fed.send_at(self.handle, payload, time)
    }

    pub fn send_to_at(&self, payload: &[u8], dest: &str, time: Time) -> Result<(), Error> {
        self.fed.send_to_at(self.handle, payload, dest, time)
    }

    pub async fn receive(&self) -> Result<Option<Message>, Error> {
        self.fed.receive(self.handle).await
    }

    pub async fn pending_count(&self) -> Result<u64, Error> {
        self.fed.pending_count(self.handle).await
    }

    pub fn add_destination_target(&self, dest: &str) -> Result<(), Error> {
        self.fed.add_destination_target(self.handle, dest)
    }

    pub fn add_source_target(&self, source: &str) -> Result<(), Error> {
        self.fed.add_source_target(self.handle, source)
    }

    pub fn set_default_destination(&self, dest: &str) -> Result<(), Error> {
        self.fed.set_default_destination(self.handle, dest)
    }

    /// Tombstone this endpoint; no further traffic flows through it.
    pub async fn close(&self) -> Result<(), Error> {
        self.fed.close_interface(self.handle).await
    }
}

/// A registered filter; operators run on the hosting core's synthetic
/// federate and participate in time coordination.
#[derive(Clone)]
pub struct Filter {
    fed: FederateHandle,
    handle: InterfaceHandle,
}

impl Filter {
    pub fn handle(&self) -> InterfaceHandle {
        self.handle
    }

    /// Bind into the outbound path of a named endpoint.
    pub fn add_source_target(&self, endpoint: &str) -> Result<(), Error> {
        self.fed.add_filter_source_target(self.handle, endpoint)
    }

    /// Bind into the inbound path of a named endpoint.
    pub fn add_destination_target(&self, endpoint: &str) -> Result<(), Error> {
        self.fed.add_filter_destination_target(self.handle, endpoint)
    }

    /// Add a delivery endpoint (cloning filters only).
    pub fn add_delivery_endpoint(&self, endpoint: &str) -> Result<(), Error> {
        self.fed.add_delivery_endpoint(self.handle, endpoint)
    }

    pub fn set_operator(&self, operator: Arc<dyn FilterOperator>) -> Result<(), Error> {
        self.fed.set_filter_operator(self.handle, Some(operator))
    }

    pub fn clear_operator(&self) -> Result<(), Error> {
        self.fed.set_filter_operator(self.handle, None)
    }
}

/// A registered translator bridging the value and message domains.
#[derive(Clone)]
pub struct Translator {
    fed: FederateHandle,
    handle: InterfaceHandle,
}

impl Translator {
    pub fn handle(&self) -> InterfaceHandle {
        self.handle
    }

    /// Subscribe the translator's input side to a named publication.
    pub fn add_publication_source(&self, publication: &str) -> Result<(), Error> {
        self.fed.add_publication_source(self.handle, publication)
    }

    /// Point the translator's publication side at a named input.
    pub fn add_value_target(&self, input: &str) -> Result<(), Error> {
        self.fed.add_value_target(self.handle, input)
    }

    /// Point the translator's endpoint side at a named endpoint.
    pub fn add_destination_target(&self, endpoint: &str) -> Result<(), Error> {
        self.fed.add_destination_target(self.handle, endpoint)
    }

    pub fn set_operator(&self, operator: Arc<dyn TranslatorOperator>) -> Result<(), Error> {
        self.fed.set_translator_operator(self.handle, Some(operator))
    }
}
