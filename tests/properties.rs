//! Property tests over the kernel's pure pieces: the frame codec, endpoint
//! queue invariants, and grant monotonicity.

use proptest::prelude::*;

use conflux_core::flags::FederateFlags;
use conflux_core::{GlobalFederateId, GlobalHandle, InterfaceHandle, IterationRequest, Time};
use conflux_runtime::coordination::{GrantOutcome, TimeCoordinator, TimeProperties};
use conflux_runtime::frame::{Action, ControlFrame, FrameCodec, TimingUpdate};
use conflux_runtime::interfaces::EndpointInfo;
use conflux_runtime::message::Message;

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Hello),
        Just(Action::RegisterInterface),
        Just(Action::Message),
        Just(Action::SetValue),
        Just(Action::TimeUpdate),
        Just(Action::Query),
        Just(Action::Disconnect),
    ]
}

prop_compose! {
    fn arb_frame()(
        action in arb_action(),
        src_fed in 0u32..1 << 20,
        src_handle in 0u32..1 << 10,
        dst_fed in 0u32..1 << 20,
        dst_handle in 0u32..1 << 10,
        message_id in any::<u32>(),
        time_ns in -1_000_000_000_000i64..1_000_000_000_000i64,
        flags in any::<u16>(),
        counter in any::<u16>(),
        name in "[a-z0-9/_]{0,24}",
        info in "[ -~]{0,40}",
        payload in proptest::collection::vec(any::<u8>(), 0..2048),
    ) -> ControlFrame {
        let mut frame = ControlFrame::new(action)
            .source(GlobalFederateId::new(src_fed), InterfaceHandle::new(src_handle))
            .dest(GlobalHandle::new(
                GlobalFederateId::new(dst_fed),
                InterfaceHandle::new(dst_handle),
            ))
            .message_id(message_id)
            .time(Time::from_ns(time_ns))
            .counter(counter)
            .name(name)
            .info(info)
            .payload(payload);
        frame.flags = flags;
        frame
    }
}

proptest! {
    /// Frames survive the codec bit-exactly, alone and back to back.
    #[test]
    fn codec_round_trips(frames in proptest::collection::vec(arb_frame(), 1..8)) {
        let buf = codec_util::encode_all(&frames);
        let decoded = codec_util::decode_all(buf);
        prop_assert_eq!(decoded, frames);
    }

    /// The decoder never yields a frame from a strict prefix.
    #[test]
    fn codec_waits_for_full_frames(frame in arb_frame(), cut in 0usize..usize::MAX) {
        use bytes::BytesMut;
        use tokio_util::codec::{Decoder, Encoder};
        let mut codec = FrameCodec;
        let mut full = BytesMut::new();
        codec.encode(frame, &mut full).unwrap();
        let cut = cut % full.len();
        if cut == 0 {
            return Ok(());
        }
        let mut prefix = BytesMut::from(&full[..cut]);
        prop_assert!(codec.decode(&mut prefix).unwrap().is_none());
    }

    /// Endpoint queues expose messages in `(time, original_source)` order
    /// and the available count never exceeds the matching prefix.
    #[test]
    fn endpoint_queue_invariants(
        mut entries in proptest::collection::vec(
            (0i64..1_000, "[a-f]{1,4}", any::<u16>()),
            0..64,
        ),
        horizon in 0i64..1_000,
    ) {
        let mut endpoint = EndpointInfo::default();
        for (ns, source, tag) in entries.drain(..) {
            let mut message = Message::new(source, "dst", vec![0]);
            message.time = Time::from_ns(ns);
            message.message_id = tag as u32;
            endpoint.add_message(message);
        }
        let horizon = Time::from_ns(horizon);
        endpoint.update_time_inclusive(horizon);
        let available = endpoint.available_messages();
        prop_assert_eq!(available, endpoint.queue_size(horizon));

        let mut previous: Option<(Time, String)> = None;
        let mut drained = 0usize;
        while let Some(message) = endpoint.get_message(horizon) {
            drained += 1;
            prop_assert!(message.time <= horizon);
            if let Some((ptime, psource)) = &previous {
                prop_assert!(
                    (*ptime, psource.as_str())
                        <= (message.time, message.original_source.as_str())
                );
            }
            previous = Some((message.time, message.original_source.clone()));
        }
        prop_assert_eq!(drained, available);
        prop_assert_eq!(endpoint.available_messages(), 0);
    }

    /// Messages with equal stamps drain in lexicographic source order
    /// regardless of arrival order.
    #[test]
    fn equal_time_delivery_is_stable(sources in proptest::collection::vec("[a-z]{1,6}", 1..16)) {
        let mut endpoint = EndpointInfo::default();
        for source in &sources {
            let mut message = Message::new(source.clone(), "dst", vec![]);
            message.time = Time::from_ns(42);
            endpoint.add_message(message);
        }
        endpoint.update_time_inclusive(Time::from_ns(42));
        let mut drained: Vec<String> = Vec::new();
        while let Some(message) = endpoint.get_message(Time::MAXIMUM) {
            drained.push(message.original_source);
        }
        let mut expected = sources.clone();
        expected.sort();
        prop_assert_eq!(drained, expected);
    }

    /// Granted times never decrease, whatever the partner advertises and
    /// whatever gets requested.
    #[test]
    fn grants_are_monotonic(
        steps in proptest::collection::vec(
            (0i64..10_000, 0i64..10_000, any::<bool>()),
            1..40,
        ),
    ) {
        let me = GlobalFederateId::new(GlobalFederateId::BASE);
        let partner = GlobalFederateId::new(GlobalFederateId::BASE + 1);
        let mut coordinator = TimeCoordinator::new(
            me,
            TimeProperties::default(),
            FederateFlags::default(),
        );
        coordinator.enter_executing(Time::ZERO);
        coordinator.set_edge(partner, Time::ZERO, true, false);

        let mut last_granted = Time::ZERO;
        for (request_ns, advert_ns, grounded_in_me) in steps {
            let origin = if grounded_in_me { me } else { partner };
            coordinator.partner_update(
                partner,
                TimingUpdate {
                    te: Time::from_ns(advert_ns),
                    te_origin: origin,
                    minde: Time::from_ns(advert_ns),
                    minde_origin: origin,
                },
            );
            coordinator.request(Time::from_ns(request_ns), IterationRequest::NoIteration);
            if let GrantOutcome::Granted { time, .. } =
                coordinator.evaluate(Time::MAXIMUM, false)
            {
                prop_assert!(time >= last_granted);
                last_granted = time;
            }
        }
    }
}

mod codec_util {
    use super::*;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    pub fn encode_all(frames: &[ControlFrame]) -> BytesMut {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        for frame in frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }
        buf
    }

    pub fn decode_all(mut buf: BytesMut) -> Vec<ControlFrame> {
        let mut codec = FrameCodec;
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }
}
