//! Control frames: the wire protocol spoken between federates, cores and
//! brokers, plus the fixed-width little-endian codec used on framed routes.
//!
//! Layout, in order: `action` (4B), `source` (8B), `dest` (8B),
//! `message_id` (4B), `time` (8B), `flags` (2B), `counter` (2B), then three
//! length-prefixed variable fields `name`, `info`, `payload`. Frames are
//! atomic per route; the codec never emits a partial frame.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use conflux_core::{GlobalFederateId, GlobalHandle, InterfaceHandle, Time};

/// Frame kinds. The discriminant is the 4-byte wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Action {
    // Connection / identity negotiation.
    Hello = 1,
    HelloAck = 2,
    HelloReject = 3,

    // Registration conversations.
    RegisterFederate = 10,
    FederateAck = 11,
    RegisterInterface = 12,
    InterfaceAck = 13,
    ErrorReply = 14,

    // Named-interface linkage.
    AddTarget = 20,
    TargetLink = 21,
    AddDependency = 22,
    FilterTiming = 23,

    // Lifecycle barriers.
    InitReady = 30,
    InitGrant = 31,
    ExecRequest = 32,
    ExecGrant = 33,

    // Time coordination.
    RequestTime = 40,
    TimeUpdate = 41,
    TimeGrant = 42,

    // Data plane.
    Message = 50,
    SetValue = 51,
    Publish = 52,
    Send = 53,

    // Queries.
    Query = 60,
    QueryReply = 61,

    // Errors and teardown.
    LocalError = 70,
    GlobalError = 71,
    Disconnect = 72,
    DisconnectAck = 73,

    // Liveness.
    Ping = 80,
    Pong = 81,
    Tick = 82,
}

impl Action {
    pub fn from_wire(raw: u32) -> Option<Self> {
        use Action::*;
        Some(match raw {
            1 => Hello,
            2 => HelloAck,
            3 => HelloReject,
            10 => RegisterFederate,
            11 => FederateAck,
            12 => RegisterInterface,
            13 => InterfaceAck,
            14 => ErrorReply,
            20 => AddTarget,
            21 => TargetLink,
            22 => AddDependency,
            23 => FilterTiming,
            30 => InitReady,
            31 => InitGrant,
            32 => ExecRequest,
            33 => ExecGrant,
            40 => RequestTime,
            41 => TimeUpdate,
            42 => TimeGrant,
            50 => Message,
            51 => SetValue,
            52 => Publish,
            53 => Send,
            60 => Query,
            61 => QueryReply,
            70 => LocalError,
            71 => GlobalError,
            72 => Disconnect,
            73 => DisconnectAck,
            80 => Ping,
            81 => Pong,
            82 => Tick,
            _ => return None,
        })
    }

    /// Whether frames of this kind take the priority ingress queue.
    ///
    /// Time-coordination and data frames must stay ordered with each other,
    /// so they are always normal. Queries follow their `FAST` flag.
    pub fn is_priority(self, flags: u16) -> bool {
        use Action::*;
        match self {
            Hello | HelloAck | HelloReject | RegisterFederate | FederateAck
            | RegisterInterface | InterfaceAck | ErrorReply | AddTarget | TargetLink
            | AddDependency | FilterTiming | InitReady | InitGrant | ExecRequest | ExecGrant
            | LocalError | GlobalError | Disconnect | DisconnectAck | Ping | Pong | Tick => true,
            Query | QueryReply => flags & conflux_core::flags::frame::FAST != 0,
            RequestTime | TimeUpdate | TimeGrant | Message | SetValue | Publish | Send => false,
        }
    }
}

/// One framed control message.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlFrame {
    pub action: Action,
    pub source: GlobalHandle,
    pub dest: GlobalHandle,
    pub message_id: u32,
    pub time: Time,
    pub flags: u16,
    pub counter: u16,
    pub name: String,
    pub info: String,
    pub payload: Vec<u8>,
}

impl ControlFrame {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            source: GlobalHandle::INVALID,
            dest: GlobalHandle::INVALID,
            message_id: 0,
            time: Time::ZERO,
            flags: 0,
            counter: 0,
            name: String::new(),
            info: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn source(mut self, federate: GlobalFederateId, handle: InterfaceHandle) -> Self {
        self.source = GlobalHandle::new(federate, handle);
        self
    }

    pub fn source_federate(mut self, federate: GlobalFederateId) -> Self {
        self.source = GlobalHandle::new(federate, InterfaceHandle::INVALID);
        self
    }

    pub fn dest(mut self, dest: GlobalHandle) -> Self {
        self.dest = dest;
        self
    }

    pub fn dest_federate(mut self, federate: GlobalFederateId) -> Self {
        self.dest = GlobalHandle::new(federate, InterfaceHandle::INVALID);
        self
    }

    pub fn message_id(mut self, id: u32) -> Self {
        self.message_id = id;
        self
    }

    pub fn time(mut self, time: Time) -> Self {
        self.time = time;
        self
    }

    pub fn flag(mut self, bit: u16) -> Self {
        self.flags |= bit;
        self
    }

    pub fn counter(mut self, counter: u16) -> Self {
        self.counter = counter;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn has_flag(&self, bit: u16) -> bool {
        self.flags & bit != 0
    }

    pub fn is_priority(&self) -> bool {
        self.action.is_priority(self.flags)
    }
}

/// Kind tag stored on interface registrations and handle records.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Publication,
    Input,
    Endpoint,
    Filter,
    Translator,
}

impl std::fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InterfaceKind::Publication => "publication",
            InterfaceKind::Input => "input",
            InterfaceKind::Endpoint => "endpoint",
            InterfaceKind::Filter => "filter",
            InterfaceKind::Translator => "translator",
        };
        write!(f, "{s}")
    }
}

/// Bincode payload of a [`Action::RegisterInterface`] frame.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InterfaceReg {
    pub kind: InterfaceKind,
    pub type_name: String,
    pub units: String,
    pub global: bool,
    pub cloning: bool,
}

/// Bincode payload of a [`Action::RegisterFederate`] frame.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FederateReg {
    pub props: crate::coordination::TimeProperties,
    pub flags: conflux_core::flags::FederateFlags,
    pub synthetic: bool,
}

/// How two interfaces are being linked by an [`Action::AddTarget`] request.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    /// Value flow: publication into input.
    PublicationToInput,
    /// Message flow: source endpoint to destination endpoint.
    EndpointToEndpoint,
    /// Bind a filter into the outbound path of an endpoint.
    SourceFilter,
    /// Bind a filter into the inbound path of an endpoint.
    DestinationFilter,
    /// Add a delivery endpoint to a cloning filter.
    DeliveryEndpoint,
    /// Set an endpoint's default destination; resolved locally by the
    /// owning core.
    DefaultDestination,
}

/// Bincode payload of an [`Action::AddTarget`] frame.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TargetRequest {
    pub relationship: Relationship,
    pub origin: GlobalHandle,
    pub origin_key: String,
    pub origin_kind: InterfaceKind,
    pub target_name: String,
    /// Whether the origin sits on the sending side of the resolved link.
    pub origin_is_source: bool,
}

/// One side of a resolved link.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LinkEnd {
    pub handle: GlobalHandle,
    pub key: String,
    pub kind: InterfaceKind,
}

/// Bincode payload of an [`Action::TargetLink`] frame, sent to both owning
/// cores once a named target resolves.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LinkNotice {
    pub relationship: Relationship,
    pub source: LinkEnd,
    pub target: LinkEnd,
    /// For filter bindings: whether the bound filter clones.
    pub cloning: bool,
}

/// Bincode payload of an [`Action::AddDependency`] frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct DependencyNotice {
    pub partner: GlobalFederateId,
    pub delay: Time,
    /// The partner can affect the destination federate.
    pub dependency: bool,
    /// The destination federate can affect the partner.
    pub dependent: bool,
}

/// Bincode payload of [`Action::TimeUpdate`] / [`Action::TimeGrant`] frames.
///
/// Each floor names the federate *grounding* it, so a receiver can discard
/// floors that are echoes of its own state looping through a dependency
/// cycle. An invalid origin marks a floor grounded in a real queued event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingUpdate {
    /// Earliest time the sender may still emit an event.
    pub te: Time,
    pub te_origin: GlobalFederateId,
    /// Earliest outstanding-request floor in the sender's upstream closure.
    pub minde: Time,
    pub minde_origin: GlobalFederateId,
}

const HEADER_LEN: usize = 4 + 8 + 8 + 4 + 8 + 2 + 2;
const MAX_VAR_FIELD: usize = 64 * 1024 * 1024;

/// Codec for [`ControlFrame`]s over any `AsyncRead + AsyncWrite` transport.
#[derive(Debug, Default)]
pub struct FrameCodec;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown frame action {0}")]
    UnknownAction(u32),
    #[error("variable field of {0} bytes exceeds the frame limit")]
    FieldTooLarge(usize),
    #[error("frame field is not valid UTF-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn put_handle(buf: &mut BytesMut, handle: GlobalHandle) {
    buf.put_u32_le(handle.federate.raw());
    buf.put_u32_le(handle.handle.raw());
}

fn get_handle(buf: &mut BytesMut) -> GlobalHandle {
    let fed = GlobalFederateId::new(buf.get_u32_le());
    let handle = InterfaceHandle::new(buf.get_u32_le());
    GlobalHandle::new(fed, handle)
}

impl Encoder<ControlFrame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: ControlFrame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let var_len = 12 + frame.name.len() + frame.info.len() + frame.payload.len();
        buf.reserve(HEADER_LEN + var_len);
        buf.put_u32_le(frame.action as u32);
        put_handle(buf, frame.source);
        put_handle(buf, frame.dest);
        buf.put_u32_le(frame.message_id);
        buf.put_i64_le(frame.time.as_ns());
        buf.put_u16_le(frame.flags);
        buf.put_u16_le(frame.counter);
        for field in [frame.name.as_bytes(), frame.info.as_bytes(), &frame.payload] {
            if field.len() > MAX_VAR_FIELD {
                return Err(CodecError::FieldTooLarge(field.len()));
            }
            buf.put_u32_le(field.len() as u32);
            buf.put_slice(field);
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = ControlFrame;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A frame is only consumed once all three variable fields are
        // resident; the scan below never advances the buffer.
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut offset = HEADER_LEN;
        for _ in 0..3 {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            if len > MAX_VAR_FIELD {
                return Err(CodecError::FieldTooLarge(len));
            }
            offset += 4 + len;
        }
        if buf.len() < offset {
            return Ok(None);
        }

        let mut frame = buf.split_to(offset);
        let raw_action = frame.get_u32_le();
        let action =
            Action::from_wire(raw_action).ok_or(CodecError::UnknownAction(raw_action))?;
        let source = get_handle(&mut frame);
        let dest = get_handle(&mut frame);
        let message_id = frame.get_u32_le();
        let time = Time::from_ns(frame.get_i64_le());
        let flags = frame.get_u16_le();
        let counter = frame.get_u16_le();

        let mut take_field = |frame: &mut BytesMut| {
            let len = frame.get_u32_le() as usize;
            frame.split_to(len).to_vec()
        };
        let name = String::from_utf8(take_field(&mut frame))?;
        let info = String::from_utf8(take_field(&mut frame))?;
        let payload = take_field(&mut frame);

        Ok(Some(ControlFrame {
            action,
            source,
            dest,
            message_id,
            time,
            flags,
            counter,
            name,
            info,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ControlFrame {
        ControlFrame::new(Action::Message)
            .source(GlobalFederateId::new(0x0001_0003), InterfaceHandle::new(7))
            .dest(GlobalHandle::new(
                GlobalFederateId::new(0x0001_0004),
                InterfaceHandle::new(9),
            ))
            .message_id(55)
            .time(Time::from_seconds(2.5))
            .flag(conflux_core::flags::frame::FILTERED_SOURCE)
            .counter(3)
            .name("fedA/port1")
            .info("fedB/port2")
            .payload(vec![0xAB; 500])
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(sample(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample());
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_a_complete_frame() {
        let mut codec = FrameCodec;
        let mut full = BytesMut::new();
        codec.encode(sample(), &mut full).unwrap();

        // Feed the bytes one at a time; no prefix may produce a frame.
        let mut partial = BytesMut::new();
        let total = full.len();
        for (i, byte) in full.iter().enumerate() {
            partial.put_u8(*byte);
            let decoded = codec.decode(&mut partial).unwrap();
            if i + 1 < total {
                assert!(decoded.is_none(), "frame produced after {} bytes", i + 1);
            } else {
                assert_eq!(decoded.unwrap(), sample());
            }
        }
    }

    #[test]
    fn back_to_back_frames_stay_separate() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let a = sample();
        let b = ControlFrame::new(Action::Tick);
        codec.encode(a.clone(), &mut buf).unwrap();
        codec.encode(b.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_action_is_an_error() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(ControlFrame::new(Action::Ping), &mut buf).unwrap();
        buf[0] = 0xFF;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::UnknownAction(_))
        ));
    }

    #[test]
    fn priority_classification() {
        assert!(Action::Disconnect.is_priority(0));
        assert!(Action::RegisterInterface.is_priority(0));
        assert!(!Action::Message.is_priority(0));
        assert!(!Action::TimeUpdate.is_priority(0));
        assert!(!Action::Query.is_priority(0));
        assert!(Action::Query.is_priority(conflux_core::flags::frame::FAST));
    }
}
