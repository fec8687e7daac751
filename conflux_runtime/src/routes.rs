//! Abstract routes: "send one framed control message to a neighbor".
//!
//! The kernel never talks to a transport directly; it hands frames to a
//! [`Route`]. Transports guarantee per-route ordering and atomicity of
//! frames. Two implementations live here: a loopback channel route (posts
//! straight into the neighbor's ingress queues) and a framed route over any
//! `AsyncWrite` using [`FrameCodec`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::FramedWrite;

use conflux_core::{GlobalFederateId, RouteId};

use crate::command::Command;
use crate::frame::{ControlFrame, FrameCodec};
use crate::queue::CommandSender;

#[derive(Debug, thiserror::Error)]
#[error("route closed")]
pub struct RouteClosed;

/// One-way send channel towards a neighboring node.
pub trait Route: Send + Sync {
    fn send(&self, frame: ControlFrame) -> Result<(), RouteClosed>;
}

/// In-process route: frames land directly on the destination's ingress.
#[derive(Clone)]
pub struct ChannelRoute {
    target: CommandSender,
}

impl ChannelRoute {
    pub fn new(target: CommandSender) -> Self {
        Self { target }
    }
}

impl Route for ChannelRoute {
    fn send(&self, frame: ControlFrame) -> Result<(), RouteClosed> {
        self.target.send(Command::Frame(frame)).map_err(|_| RouteClosed)
    }
}

/// In-process route that stamps its identity on every delivered frame, so
/// the receiving broker knows which child the frame came from.
#[derive(Clone)]
pub struct TaggedRoute {
    target: CommandSender,
    rid: RouteId,
}

impl TaggedRoute {
    pub fn new(target: CommandSender, rid: RouteId) -> Self {
        Self { target, rid }
    }
}

impl Route for TaggedRoute {
    fn send(&self, frame: ControlFrame) -> Result<(), RouteClosed> {
        self.target
            .send(Command::Routed {
                from: self.rid,
                frame,
            })
            .map_err(|_| RouteClosed)
    }
}

/// Route over a byte transport. A writer task owns the sink; `send` stays
/// synchronous by handing frames through an unbounded channel, the way the
/// kernel's other senders do.
pub struct FramedRoute {
    tx: mpsc::UnboundedSender<ControlFrame>,
}

impl FramedRoute {
    pub fn spawn<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Forward frames from the channel into the framed sink, the same
            // shape as wrapping a split sink behind an unbounded sender.
            let sink = FramedWrite::new(writer, FrameCodec);
            if let Err(err) = UnboundedReceiverStream::new(rx).map(Ok).forward(sink).await {
                tracing::warn!("framed route writer terminated: {err}");
            }
        });
        Self { tx }
    }
}

impl Route for FramedRoute {
    fn send(&self, frame: ControlFrame) -> Result<(), RouteClosed> {
        self.tx.send(frame).map_err(|_| RouteClosed)
    }
}

/// The routes a node can transmit on, shared between the command task and
/// the connection side that opens routes.
#[derive(Clone, Default)]
pub struct RouteSet {
    routes: Arc<RwLock<HashMap<RouteId, Arc<dyn Route>>>>,
}

impl RouteSet {
    pub fn add(&self, rid: RouteId, route: Arc<dyn Route>) {
        self.routes.write().unwrap().insert(rid, route);
    }

    pub fn remove(&self, rid: RouteId) {
        self.routes.write().unwrap().remove(&rid);
    }

    pub fn transmit(&self, rid: RouteId, frame: ControlFrame) -> Result<(), RouteClosed> {
        let route = self
            .routes
            .read()
            .unwrap()
            .get(&rid)
            .cloned()
            .ok_or(RouteClosed)?;
        route.send(frame)
    }

    pub fn has(&self, rid: RouteId) -> bool {
        self.routes.read().unwrap().contains_key(&rid)
    }
}

/// `GlobalFederateId -> RouteId` with a parent fallback. Populated as
/// registrations propagate.
#[derive(Debug, Default)]
pub struct RouteTable {
    map: HashMap<GlobalFederateId, RouteId>,
}

impl RouteTable {
    pub fn set(&mut self, fed: GlobalFederateId, rid: RouteId) {
        self.map.insert(fed, rid);
    }

    /// Route for a federate, falling back to the parent route.
    pub fn get(&self, fed: GlobalFederateId) -> RouteId {
        self.map.get(&fed).copied().unwrap_or(RouteId::PARENT)
    }

    pub fn known(&self, fed: GlobalFederateId) -> bool {
        self.map.contains_key(&fed)
    }

    pub fn remove_route(&mut self, rid: RouteId) {
        self.map.retain(|_, r| *r != rid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Action;
    use crate::queue;
    use bytes::BytesMut;
    use tokio_util::codec::Decoder;

    #[tokio::test]
    async fn channel_route_reaches_the_ingress() {
        let (tx, mut rx) = queue::channel();
        let route = ChannelRoute::new(tx);
        route.send(ControlFrame::new(Action::Ping)).unwrap();
        match rx.next().await.unwrap() {
            Command::Frame(frame) => assert_eq!(frame.action, Action::Ping),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn framed_route_writes_decodable_frames() {
        let (client, mut server) = tokio::io::duplex(4096);
        let route = FramedRoute::spawn(client);
        let frame = ControlFrame::new(Action::Query).name("root").info("federates");
        route.send(frame.clone()).unwrap();

        let mut buf = BytesMut::new();
        let mut codec = FrameCodec;
        loop {
            use tokio::io::AsyncReadExt;
            let mut chunk = [0u8; 256];
            let n = server.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(decoded) = codec.decode(&mut buf).unwrap() {
                assert_eq!(decoded, frame);
                break;
            }
        }
    }

    #[test]
    fn route_table_falls_back_to_parent() {
        let mut table = RouteTable::default();
        let fed = GlobalFederateId::new(GlobalFederateId::BASE);
        assert_eq!(table.get(fed), RouteId::PARENT);
        table.set(fed, RouteId::new(3));
        assert_eq!(table.get(fed), RouteId::new(3));
        table.remove_route(RouteId::new(3));
        assert_eq!(table.get(fed), RouteId::PARENT);
    }
}
