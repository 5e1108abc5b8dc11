//! Property-based tests for the frame codec.
//!
//! Decoding must never panic on arbitrary input, and every frame the encoder
//! can produce must decode back to itself.

use bytes::{BufMut, Bytes, BytesMut};
use proptest::prelude::*;
use wsmux::frame::*;

const MAX: u32 = 16 * 1024;

// ─── Strategies ──────────────────────────────────────────────────────────────

fn frame_strategy() -> impl Strategy<Value = Frame> {
    let id = any::<u32>();
    prop_oneof![
        id.prop_map(Frame::syn),
        (id, proptest::collection::vec(any::<u8>(), 0..2048))
            .prop_map(|(id, p)| Frame::data(id, Bytes::from(p))),
        (id, any::<u32>()).prop_map(|(id, c)| Frame::window_update(id, c)),
        id.prop_map(Frame::fin),
        id.prop_map(Frame::rst),
    ]
}

proptest! {
    #[test]
    fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = Frame::decode(Bytes::from(data), MAX);
    }

    #[test]
    fn encoded_frames_decode_unchanged(frame in frame_strategy()) {
        let msg = frame.encode();
        prop_assert_eq!(msg.len(), frame.encoded_len());
        let back = Frame::decode(msg, MAX).unwrap();
        prop_assert_eq!(back, frame);
    }

    #[test]
    fn only_short_messages_are_fatal(data in proptest::collection::vec(any::<u8>(), 0..64)) {
        let len = data.len();
        if let Err(e) = Frame::decode(Bytes::from(data), MAX) {
            prop_assert_eq!(e.is_fatal(), len < HEADER_SIZE);
        }
    }

    #[test]
    fn unknown_types_are_rejected(ty in 5u8..=255, id in any::<u32>()) {
        let mut buf = BytesMut::new();
        buf.put_u8(ty);
        buf.put_u32(id);
        buf.put_u32(0);
        prop_assert_eq!(
            Frame::decode(buf.freeze(), MAX),
            Err(FrameError::UnknownType(ty))
        );
    }

    #[test]
    fn oversized_data_is_rejected(extra in 1u32..1024) {
        let len = MAX + extra;
        let mut buf = BytesMut::new();
        buf.put_u8(FrameType::Data as u8);
        buf.put_u32(1);
        buf.put_u32(len);
        buf.put_bytes(0, len as usize);
        prop_assert_eq!(
            Frame::decode(buf.freeze(), MAX),
            Err(FrameError::TooLarge { stream_id: 1, len, max: MAX })
        );
    }

    #[test]
    fn window_update_credit_survives(id in any::<u32>(), credit in any::<u32>()) {
        let f = Frame::decode(Frame::window_update(id, credit).encode(), MAX).unwrap();
        prop_assert_eq!(f.credit(), Some(credit));
    }
}
