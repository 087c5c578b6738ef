//! Serialization of the fixed-size datagrams exchanged with the monitor firmware.
//!
//! All numbers are little-endian u32 words:
//!
//! ```ascii
//! 0: command id
//! 4: transaction id
//! 8: sequence number (sequenced commands only), bit 31 marks the last packet of a round
//! *: payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::{Debug, Formatter};
use crate::commands::{CommandId, TransferDirection};
use crate::core_location::ChipLocation;
use crate::error::{TransferError, TransferResult};
use crate::safe_converter::PrecheckedCast;

pub const WORD_LEN: usize = std::mem::size_of::<u32>();
/// command id + transaction id
pub const HEADER_LEN: usize = 2 * WORD_LEN;
pub const SEQUENCE_LEN: usize = WORD_LEN;

pub const LAST_OF_ROUND_FLAG: u32 = 0x8000_0000;
pub const SEQUENCE_MASK: u32 = !LAST_OF_ROUND_FLAG;

/// A single encoded datagram, ready to be handed to a socket
#[derive(Clone, Eq, PartialEq)]
pub struct Datagram(Bytes);

impl Datagram {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for Datagram {
    fn from(value: Bytes) -> Self {
        Datagram(value)
    }
}

impl From<Vec<u8>> for Datagram {
    fn from(value: Vec<u8>) -> Self {
        Datagram(Bytes::from(value))
    }
}

impl AsRef<[u8]> for Datagram {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Datagram {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DGRAM{{{} bytes}}", self.0.len())
    }
}

/// A decoded datagram
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub command: CommandId,
    pub transaction_id: u32,
    pub sequence: Option<u32>,
    /// Either the sequence word's last-of-round bit or an explicit end flag command
    pub is_end: bool,
    pub payload: Bytes,
}

impl Frame {
    /// The payload interpreted as u32 words. Decoding guarantees word alignment for all
    ///  commands except the sequenced data commands, where trailing bytes are ignored.
    pub fn words(&self) -> Vec<u32> {
        let mut buf = self.payload.clone();
        let mut result = Vec::with_capacity(buf.len() / WORD_LEN);
        while buf.remaining() >= WORD_LEN {
            result.push(buf.get_u32_le());
        }
        result
    }
}

/// Encoder / decoder for a given datagram capacity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameCodec {
    datagram_capacity: usize,
}

impl FrameCodec {
    /// NB: the capacity is validated as part of the transfer configuration
    pub fn new(datagram_capacity: usize) -> FrameCodec {
        FrameCodec { datagram_capacity }
    }

    pub fn datagram_capacity(&self) -> usize {
        self.datagram_capacity
    }

    /// The number of data bytes a single sequenced datagram carries
    pub fn chunk_payload_bytes(&self) -> usize {
        self.datagram_capacity - HEADER_LEN - SEQUENCE_LEN
    }

    pub fn words_per_datagram(&self) -> usize {
        self.datagram_capacity / WORD_LEN
    }

    /// the number of sequenced chunks needed for a transfer of the given length
    pub fn max_sequence(&self, length_bytes: usize) -> u32 {
        length_bytes.div_ceil(self.chunk_payload_bytes()).prechecked_cast()
    }

    /// The byte offset of a chunk inside the transferred range. This depends on the sequence
    ///  number alone so that any chunk can be re-sent at any time.
    pub fn chunk_offset(&self, sequence: u32) -> usize {
        sequence as usize * self.chunk_payload_bytes()
    }

    /// The byte range a chunk covers in a transfer of `length_bytes`
    pub fn chunk_range(&self, sequence: u32, length_bytes: usize) -> std::ops::Range<usize> {
        let start = self.chunk_offset(sequence).min(length_bytes);
        let end = (start + self.chunk_payload_bytes()).min(length_bytes);
        start..end
    }

    fn start_frame(&self, command: CommandId, transaction_id: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.datagram_capacity);
        buf.put_u32_le(command.into());
        buf.put_u32_le(transaction_id);
        buf
    }

    /// The first packet of a session. For extraction it asks the monitor to start streaming the
    ///  range; for injection it tells the monitor where to write and how many chunks follow.
    pub fn encode_start(
        &self,
        direction: TransferDirection,
        transaction_id: u32,
        address: u32,
        length_bytes: u32,
        destination: ChipLocation,
    ) -> Datagram {
        match direction {
            TransferDirection::Extract => {
                let mut buf = self.start_frame(CommandId::StartSending, transaction_id);
                buf.put_u32_le(address);
                buf.put_u32_le(length_bytes);
                Datagram(buf.freeze())
            }
            TransferDirection::Inject => {
                let mut buf = self.start_frame(CommandId::SendDataToLocation, transaction_id);
                buf.put_u32_le(address);
                buf.put_u32_le(destination.packed());
                buf.put_u32_le(self.max_sequence(length_bytes as usize).saturating_sub(1));
                Datagram(buf.freeze())
            }
        }
    }

    pub fn encode_chunk(
        &self,
        command: CommandId,
        transaction_id: u32,
        sequence: u32,
        last_of_round: bool,
        payload: &[u8],
    ) -> Datagram {
        assert!(command.is_sequenced(), "{:?} is not a sequenced command", command);
        assert!(payload.len() <= self.chunk_payload_bytes(),
                "chunk of {} bytes exceeds the chunk payload size of {}", payload.len(), self.chunk_payload_bytes());
        assert_eq!(sequence & LAST_OF_ROUND_FLAG, 0, "sequence number {} collides with the end flag", sequence);

        let mut buf = self.start_frame(command, transaction_id);
        let flag = if last_of_round { LAST_OF_ROUND_FLAG } else { 0 };
        buf.put_u32_le(sequence | flag);
        buf.put_slice(payload);
        Datagram(buf.freeze())
    }

    pub fn encode_end_flag(&self, direction: TransferDirection, transaction_id: u32) -> Datagram {
        Datagram(self.start_frame(CommandId::end_command(direction), transaction_id).freeze())
    }

    /// A control frame carrying a list of words, e.g. missing sequence numbers. The caller is
    ///  responsible for keeping the words inside the datagram capacity.
    pub fn encode_control(&self, command: CommandId, transaction_id: u32, words: &[u32]) -> Datagram {
        assert!(HEADER_LEN + words.len() * WORD_LEN <= self.datagram_capacity,
                "{} words do not fit into a datagram of {} bytes", words.len(), self.datagram_capacity);

        let mut buf = self.start_frame(command, transaction_id);
        for &w in words {
            buf.put_u32_le(w);
        }
        Datagram(buf.freeze())
    }

    pub fn decode(&self, datagram: &[u8]) -> TransferResult<Frame> {
        if datagram.len() < HEADER_LEN {
            return Err(TransferError::MalformedFrame(format!("datagram of {} bytes is shorter than the frame header", datagram.len())));
        }
        if datagram.len() > self.datagram_capacity {
            return Err(TransferError::MalformedFrame(format!("datagram of {} bytes exceeds the capacity of {}", datagram.len(), self.datagram_capacity)));
        }

        let mut buf = Bytes::copy_from_slice(datagram);
        let raw_command = buf.get_u32_le();
        let transaction_id = buf.get_u32_le();
        let command = CommandId::try_from(raw_command)
            .map_err(|_| TransferError::MalformedFrame(format!("unknown command id {}", raw_command)))?;

        if command.is_sequenced() {
            if buf.remaining() < SEQUENCE_LEN {
                return Err(TransferError::MalformedFrame(format!("{:?} without a sequence number", command)));
            }
            let sequence_word = buf.get_u32_le();
            return Ok(Frame {
                command,
                transaction_id,
                sequence: Some(sequence_word & SEQUENCE_MASK),
                is_end: sequence_word & LAST_OF_ROUND_FLAG != 0,
                payload: buf,
            });
        }

        if buf.remaining() % WORD_LEN != 0 {
            return Err(TransferError::MalformedFrame(format!("{:?} with a payload of {} bytes, which is not word aligned", command, buf.remaining())));
        }

        let payload_words = buf.remaining() / WORD_LEN;
        let length_ok = match command {
            CommandId::StartSending => payload_words == 2,
            CommandId::SendDataToLocation => payload_words == 3,
            CommandId::RequestBuffers => payload_words == 3,
            CommandId::EventStop => payload_words == 1,
            CommandId::HostSendSequenced => payload_words >= 2,
            CommandId::StartMissingSeq | CommandId::MissingSeq | CommandId::ReceiveMissingSeqData => payload_words >= 1,
            CommandId::EndOfStream | CommandId::SendTell | CommandId::ReceiveFinished | CommandId::Clear => payload_words == 0,
            CommandId::SequencedData | CommandId::SendSeqData => true,
        };
        if !length_ok {
            return Err(TransferError::MalformedFrame(format!("{:?} with an inconsistent payload of {} words", command, payload_words)));
        }

        Ok(Frame {
            command,
            transaction_id,
            sequence: None,
            is_end: command.is_end_flag(),
            payload: buf,
        })
    }
}
