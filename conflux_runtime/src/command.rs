//! Commands carried on a node's ingress queues, and the reply plumbing that
//! lets user-facing calls block until the command task resolves them.
//!
//! Operator installation hands trait objects to the command task as tagged
//! variants; everything else is a wire frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use conflux_core::{GlobalHandle, InterfaceHandle, LocalFederateId, Time};

use crate::errors::Error;
use crate::frame::ControlFrame;
use crate::interfaces::{FilterOperator, TranslatorOperator};
use crate::message::Message;
use crate::FederateMode;

/// One unit of work for a command task.
pub enum Command {
    /// A wire frame, either from a route or posted by a local API call.
    Frame(ControlFrame),
    /// A wire frame tagged with the route it arrived on; brokers use the
    /// provenance to learn child routes and to return replies.
    Routed {
        from: conflux_core::RouteId,
        frame: ControlFrame,
    },
    /// A local state read, answered directly from the command task.
    Read(ReadRequest),
    /// Install (or clear) a filter operator.
    SetFilterOperator {
        handle: InterfaceHandle,
        operator: Option<Arc<dyn FilterOperator>>,
    },
    /// Install (or clear) a translator operator.
    SetTranslatorOperator {
        handle: InterfaceHandle,
        operator: Option<Arc<dyn TranslatorOperator>>,
    },
    /// Replace the node's base configuration; rejected once connected.
    Reconfigure {
        config: crate::broker_base::BaseConfig,
        reply: oneshot::Sender<Result<Reply, Error>>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Frame(frame) => f.debug_tuple("Frame").field(frame).finish(),
            Command::Routed { from, frame } => f
                .debug_struct("Routed")
                .field("from", from)
                .field("frame", frame)
                .finish(),
            Command::Read(req) => f.debug_tuple("Read").field(&req.kind).finish(),
            Command::SetFilterOperator { handle, .. } => {
                f.debug_struct("SetFilterOperator").field("handle", handle).finish()
            }
            Command::SetTranslatorOperator { handle, .. } => {
                f.debug_struct("SetTranslatorOperator").field("handle", handle).finish()
            }
            Command::Reconfigure { config, .. } => {
                f.debug_struct("Reconfigure").field("config", config).finish()
            }
        }
    }
}

/// Local state reads available to the user API.
#[derive(Debug, Clone)]
pub enum ReadKind {
    Value {
        federate: LocalFederateId,
        handle: InterfaceHandle,
    },
    NextMessage {
        federate: LocalFederateId,
        handle: InterfaceHandle,
    },
    NextMessageAny {
        federate: LocalFederateId,
    },
    PendingCount {
        federate: LocalFederateId,
        handle: InterfaceHandle,
    },
    PendingCountAny {
        federate: LocalFederateId,
    },
    CurrentTime {
        federate: LocalFederateId,
    },
    Mode {
        federate: LocalFederateId,
    },
    InputUpdated {
        federate: LocalFederateId,
        handle: InterfaceHandle,
    },
}

pub struct ReadRequest {
    pub kind: ReadKind,
    pub reply: oneshot::Sender<Result<Reply, Error>>,
}

/// Replies produced by the command task for awaited calls.
#[derive(Debug)]
pub enum Reply {
    Ack,
    Federate {
        local: LocalFederateId,
        global: conflux_core::GlobalFederateId,
    },
    Interface {
        handle: InterfaceHandle,
        global: GlobalHandle,
    },
    TimeGrant {
        time: Time,
        result: conflux_core::IterationResult,
        iteration: u32,
    },
    Exec {
        result: conflux_core::IterationResult,
    },
    Value(Option<Vec<u8>>),
    Message(Option<Box<Message>>),
    MessageAny(Option<(InterfaceHandle, Box<Message>)>),
    Count(u64),
    Flag(bool),
    Time(Time),
    Mode(FederateMode),
    Json(String),
}

/// Table of in-flight awaited calls, keyed by frame `message_id`.
///
/// Disconnect drains the table so every blocked caller wakes with a
/// connection failure.
#[derive(Default)]
pub struct Waiters {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Reply, Error>>>>,
}

impl Waiters {
    pub fn register(&self) -> (u32, oneshot::Receiver<Result<Reply, Error>>) {
        // Start above zero so an unset message_id never matches a waiter.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    /// Resolve a waiter; returns false when nobody is waiting on `id`.
    pub fn resolve(&self, id: u32, result: Result<Reply, Error>) -> bool {
        match self.pending.lock().unwrap().remove(&id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, id: u32) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Wake every outstanding waiter with the given error.
    pub fn drain_with(&self, make_err: impl Fn() -> Error) {
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_err()));
        }
    }
}

pub type SharedWaiters = Arc<Waiters>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiters_resolve_by_id() {
        let waiters = Waiters::default();
        let (id, rx) = waiters.register();
        assert!(waiters.resolve(id, Ok(Reply::Ack)));
        assert!(matches!(rx.await.unwrap(), Ok(Reply::Ack)));
        assert!(!waiters.resolve(id, Ok(Reply::Ack)));
    }

    #[tokio::test]
    async fn drain_wakes_everyone_with_the_error() {
        let waiters = Waiters::default();
        let (_, rx1) = waiters.register();
        let (_, rx2) = waiters.register();
        waiters.drain_with(|| Error::Connection("shutting down".into()));
        assert!(matches!(rx1.await.unwrap(), Err(Error::Connection(_))));
        assert!(matches!(rx2.await.unwrap(), Err(Error::Connection(_))));
    }
}
