//! Encoding and decoding of the container envelope.
//!
//! This is the only place raw bytes and protobuf meet: channels hand every
//! received frame to [`decode`] and every outgoing container to [`encode`].
//! No additional framing is applied; ZeroMQ frames delimit messages on the
//! wire.

use bytes::Bytes;
use machinetalk_proto::Container;
use prost::Message;

/// Serialise a container for transmission.
pub(crate) fn encode(container: &Container) -> Bytes {
    Bytes::from(container.encode_to_vec())
}

/// Parse a received frame.
///
/// Malformed frames are reported to the owning channel, logged and dropped
/// there; a decode failure never transitions a channel state machine.
pub(crate) fn decode(frame: &[u8]) -> Result<Container, prost::DecodeError> {
    Container::decode(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use machinetalk_proto::{ContainerType, ProtocolParameters};

    #[test]
    fn round_trip_preserves_fields() {
        let mut container = Container::with_type(ContainerType::MtEmcstatFullUpdate);
        container.ticket = Some(7);
        container.note.push("first".to_owned());
        container.note.push("second".to_owned());
        container.pparams = Some(ProtocolParameters {
            keepalive_timer: Some(1500),
        });

        let encoded = encode(&container);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, container);

        // and the other direction
        assert_eq!(encode(&decoded), encoded);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn empty_frame_is_a_default_container() {
        let decoded = decode(&[]).unwrap();
        assert_eq!(decoded, Container::default());
    }
}
