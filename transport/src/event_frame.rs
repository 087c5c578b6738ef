//! Frames of the continuous event path. The sequence number is a single byte, packed with the
//!  region id into the first payload word:
//!
//! ```ascii
//! HOST_SEND_SEQUENCED: region << 8 | seq, timestamp, key*
//! EVENT_STOP:          region << 8 | seq
//! REQUEST_BUFFERS:     region, last received seq, space available (bytes)
//! ```

use crate::commands::CommandId;
use crate::frame::{Datagram, Frame, FrameCodec};

fn pack(region: u8, seq: u8) -> u32 {
    ((region as u32) << 8) | seq as u32
}

fn unpack(word: u32) -> (u8, u8) {
    ((word >> 8) as u8, word as u8)
}

pub fn encode_event(codec: &FrameCodec, transaction_id: u32, region: u8, seq: u8, timestamp: u32, keys: &[u32]) -> Datagram {
    let mut words = Vec::with_capacity(keys.len() + 2);
    words.push(pack(region, seq));
    words.push(timestamp);
    words.extend_from_slice(keys);
    codec.encode_control(CommandId::HostSendSequenced, transaction_id, &words)
}

pub fn encode_event_stop(codec: &FrameCodec, transaction_id: u32, region: u8, seq: u8) -> Datagram {
    codec.encode_control(CommandId::EventStop, transaction_id, &[pack(region, seq)])
}

pub fn encode_buffer_request(codec: &FrameCodec, transaction_id: u32, request: BufferRequest) -> Datagram {
    codec.encode_control(CommandId::RequestBuffers, transaction_id, &[
        request.region as u32,
        request.last_received_seq as u32,
        request.space_available,
    ])
}

/// A message on the event path as the device sees it
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SequencedEvent {
    pub region: u8,
    pub seq: u8,
    /// `None` for the end of the stream
    pub payload: Option<(u32, Vec<u32>)>,
}

impl SequencedEvent {
    /// `None` for frames that are not event messages
    pub fn parse(frame: &Frame) -> Option<SequencedEvent> {
        let words = frame.words();
        let (region, seq) = unpack(*words.first()?);
        match frame.command {
            CommandId::HostSendSequenced => Some(SequencedEvent {
                region,
                seq,
                payload: Some((*words.get(1)?, words[2..].to_vec())),
            }),
            CommandId::EventStop => Some(SequencedEvent { region, seq, payload: None }),
            _ => None,
        }
    }
}

/// The device's cumulative acknowledgement, asking for more data
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BufferRequest {
    pub region: u8,
    pub last_received_seq: u8,
    pub space_available: u32,
}

impl BufferRequest {
    pub fn parse(frame: &Frame) -> Option<BufferRequest> {
        if frame.command != CommandId::RequestBuffers {
            return None;
        }
        match frame.words()[..] {
            [region, seq, space_available] => Some(BufferRequest {
                region: region as u8,
                last_received_seq: seq as u8,
                space_available,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(272)
    }

    #[test]
    fn test_event() {
        let codec = codec();
        let datagram = encode_event(&codec, 9, 3, 255, 1000, &[7, 8, 9]);
        let frame = codec.decode(datagram.as_ref()).unwrap();
        assert_eq!(frame.transaction_id, 9);
        assert_eq!(SequencedEvent::parse(&frame), Some(SequencedEvent {
            region: 3,
            seq: 255,
            payload: Some((1000, vec![7, 8, 9])),
        }));
        assert_eq!(BufferRequest::parse(&frame), None);
    }

    #[test]
    fn test_full_event_fits() {
        let codec = codec();
        let keys = vec![1; 61];
        let datagram = encode_event(&codec, 1, 0, 0, 0, &keys);
        assert!(datagram.len() <= codec.datagram_capacity());
    }

    #[test]
    fn test_stop() {
        let codec = codec();
        let frame = codec.decode(encode_event_stop(&codec, 1, 2, 17).as_ref()).unwrap();
        assert_eq!(SequencedEvent::parse(&frame), Some(SequencedEvent { region: 2, seq: 17, payload: None }));
    }

    #[test]
    fn test_buffer_request() {
        let codec = codec();
        let request = BufferRequest { region: 4, last_received_seq: 200, space_available: 4096 };
        let frame = codec.decode(encode_buffer_request(&codec, 5, request).as_ref()).unwrap();
        assert_eq!(BufferRequest::parse(&frame), Some(request));
        assert_eq!(SequencedEvent::parse(&frame), None);
    }
}
