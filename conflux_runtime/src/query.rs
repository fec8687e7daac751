//! The query subsystem. Every node answers a small set of introspection
//! queries with JSON; unknown targets are forwarded along the broker tree.

use itertools::Itertools;
use serde_json::{json, Value};

use conflux_core::LocalFederateId;

use crate::core::Core;
use crate::frame::InterfaceKind;

/// How a query interacts with the command loop.
///
/// `Fast` may race in-flight state changes; `Ordered` is processed as a
/// normal command, strictly ordered with everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequencing {
    Fast,
    Ordered,
}

fn interface_keys(core: &Core, kind: InterfaceKind) -> Value {
    let handles = core.handles.read().unwrap();
    Value::Array(
        handles
            .iter()
            .filter(|h| h.kind == kind)
            .map(|h| h.key.clone())
            .sorted()
            .map(Value::String)
            .collect(),
    )
}

impl Core {
    /// Answer a query addressed to the core itself.
    pub(crate) fn core_query(&self, query: &str) -> String {
        let value = match query {
            "name" => json!(self.base.name()),
            "exists" => json!(true),
            "isinit" => json!(self.init_granted),
            "federates" => Value::Array(
                self.federates
                    .iter()
                    .filter(|f| !f.synthetic)
                    .map(|f| f.name.clone())
                    .sorted()
                    .map(Value::String)
                    .collect(),
            ),
            "publications" => interface_keys(self, InterfaceKind::Publication),
            "inputs" => interface_keys(self, InterfaceKind::Input),
            "endpoints" => interface_keys(self, InterfaceKind::Endpoint),
            "filters" => interface_keys(self, InterfaceKind::Filter),
            "translators" => interface_keys(self, InterfaceKind::Translator),
            "unused_interfaces" => {
                let handles = self.handles.read().unwrap();
                Value::Array(
                    handles
                        .unused_keys()
                        .into_iter()
                        .map(|k| Value::String(k.to_owned()))
                        .collect(),
                )
            }
            "global_time" => Value::Object(
                self.federates
                    .iter()
                    .filter(|f| !f.synthetic)
                    .map(|f| {
                        (
                            f.name.clone(),
                            json!(f.coordinator.granted().as_seconds()),
                        )
                    })
                    .collect(),
            ),
            _ => json!({ "error": format!("unrecognized core query '{query}'") }),
        };
        value.to_string()
    }

    /// Answer a query addressed to one of this core's federates.
    pub(crate) fn federate_query(&self, local: LocalFederateId, query: &str) -> String {
        let Some(fed) = self.fed(local) else {
            return json!({ "error": "unknown federate" }).to_string();
        };
        let value = match query {
            "name" => json!(fed.name),
            "exists" => json!(true),
            "state" => json!(fed.mode.to_string()),
            "current_time" => json!(fed.coordinator.granted().as_seconds()),
            "isinit" => json!(!matches!(fed.mode, crate::federate::FederateMode::Created)),
            "dependencies" => Value::Array(
                fed.coordinator
                    .dependencies()
                    .filter(|d| d.dependency)
                    .map(|d| {
                        json!({
                            "id": d.id.raw(),
                            "delay": d.delay.as_seconds(),
                            "connected": d.connected,
                        })
                    })
                    .collect(),
            ),
            "dependents" => Value::Array(
                fed.coordinator
                    .dependencies()
                    .filter(|d| d.dependent)
                    .map(|d| json!(d.id.raw()))
                    .collect(),
            ),
            "endpoints" => {
                let handles = self.handles.read().unwrap();
                Value::Array(
                    handles
                        .owned_by(local)
                        .filter(|h| h.kind == InterfaceKind::Endpoint)
                        .map(|h| Value::String(h.key.clone()))
                        .collect(),
                )
            }
            _ => json!({ "error": format!("unrecognized federate query '{query}'") }),
        };
        value.to_string()
    }
}
