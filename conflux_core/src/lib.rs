//! Core types shared by every conflux crate: tagged identifiers, fixed-point
//! simulation time, interface flags and iteration modes.

pub mod flags;
pub mod ids;
pub mod iteration;
pub mod time;

pub use ids::{
    GlobalBrokerId, GlobalFederateId, GlobalHandle, InterfaceHandle, LocalFederateId, RouteId,
};
pub use iteration::{IterationRequest, IterationResult};
pub use time::Time;
