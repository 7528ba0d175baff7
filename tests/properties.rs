//! Property tests for the frame codec.

use bytes::Bytes;
use peerwire::protocol::{encode_message, FrameBuffer, FrameDecoder, Message, MAX_PAYLOAD_SIZE};
use peerwire::PeerwireError;
use proptest::prelude::*;

fn message() -> impl Strategy<Value = Message> {
    (
        prop::collection::vec(any::<u8>(), 0..2048),
        prop::collection::vec(any::<u8>(), 0..256),
    )
        .prop_map(|(payload, metadata)| Message::new(payload, metadata))
}

fn concat(messages: &[Message]) -> Vec<u8> {
    messages
        .iter()
        .flat_map(|m| encode_message(m).unwrap())
        .collect()
}

/// Drive the pull decoder over `wire`, one exact read at a time.
fn pull_all(wire: &[u8]) -> Vec<Message> {
    let wire = Bytes::copy_from_slice(wire);
    let mut decoder = FrameDecoder::new();
    let mut offset = 0;
    let mut out = Vec::new();
    while offset < wire.len() {
        let need = decoder.bytes_needed();
        let chunk = wire.slice(offset..offset + need);
        offset += need;
        if let Some(message) = decoder.advance(chunk).unwrap() {
            out.push(message);
        }
    }
    assert!(decoder.is_at_frame_boundary());
    out
}

proptest! {
    /// Any sequence of messages survives encoding and pull decoding in order.
    #[test]
    fn pull_decoder_preserves_sequence(messages in prop::collection::vec(message(), 0..8)) {
        let wire = concat(&messages);
        prop_assert_eq!(pull_all(&wire), messages);
    }

    /// How the byte stream is split into reads never changes what is decoded.
    #[test]
    fn fragmentation_does_not_matter(
        messages in prop::collection::vec(message(), 1..6),
        cuts in prop::collection::vec(1usize..64, 1..64),
    ) {
        let wire = concat(&messages);
        let mut buffer = FrameBuffer::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        let mut cut = cuts.iter().cycle();
        while offset < wire.len() {
            let end = (offset + cut.next().copied().unwrap_or(1)).min(wire.len());
            decoded.extend(buffer.push(&wire[offset..end]).unwrap());
            offset = end;
        }
        prop_assert!(buffer.is_empty());
        prop_assert_eq!(decoded, messages);
    }

    /// Declared lengths above the cap are rejected before any payload arrives.
    #[test]
    fn oversize_length_rejected(extra in 1u32..1_000_000) {
        let declared = MAX_PAYLOAD_SIZE as u32 + extra;
        let mut header = vec![0x00, 0x00];
        header.extend_from_slice(&declared.to_le_bytes());

        let mut buffer = FrameBuffer::new();
        prop_assert!(matches!(buffer.push(&header), Err(PeerwireError::CorruptMessage(_))));
    }
}

/// Boundary sizes that random generation rarely hits.
#[test]
fn boundary_sizes_round_trip() {
    let cases = [
        Message::default(),
        Message::new(Bytes::new(), vec![0u8; 65_535]),
        Message::new(vec![1u8; 1], Bytes::new()),
        Message::new(vec![2u8; MAX_PAYLOAD_SIZE], Bytes::new()),
    ];
    for message in cases {
        let wire = encode_message(&message).unwrap();
        assert_eq!(wire.len(), message.encoded_len());
        assert_eq!(pull_all(&wire), vec![message]);
    }
}

#[test]
fn payload_over_cap_cannot_be_encoded() {
    let message = Message::from_payload(vec![0u8; MAX_PAYLOAD_SIZE + 1]);
    assert!(matches!(
        encode_message(&message),
        Err(PeerwireError::CorruptMessage(_))
    ));
}
