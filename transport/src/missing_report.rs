//! Reports of missing sequence numbers, in both directions.
//!
//! Host to device (extraction): the first packet is `START_MISSING_SEQ{n_packets, seq...}`,
//!  followed by `MISSING_SEQ{seq...}` continuations if the report does not fit into a single
//!  datagram.
//!
//! Device to host (injection): one or more `RECEIVE_MISSING_SEQ_DATA{seq...}` packets, the last
//!  of which ends with [MISSING_SEQ_END_FLAG]. A report consisting of [ALL_MISSING_FLAG] asks for
//!  a complete resend.

use bit_set::BitSet;
use crate::commands::CommandId;
use crate::frame::{Datagram, Frame, FrameCodec};
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub const MISSING_SEQ_END_FLAG: u32 = 0xFFFF_FFFF;
pub const ALL_MISSING_FLAG: u32 = 0xFFFF_FFFE;

/// header words: command id, transaction id
const HEADER_WORDS: usize = 2;

/// Encodes the host's report of missing sequence numbers during extraction. An empty list
///  yields no packets.
pub fn encode_host_missing_report(codec: &FrameCodec, transaction_id: u32, missing: &[u32]) -> Vec<Datagram> {
    if missing.is_empty() {
        return Vec::new();
    }

    let per_first = codec.words_per_datagram() - HEADER_WORDS - 1;
    let per_continuation = codec.words_per_datagram() - HEADER_WORDS;

    let num_packets = if missing.len() <= per_first {
        1
    }
    else {
        1 + (missing.len() - per_first).div_ceil(per_continuation)
    };

    let mut result = Vec::with_capacity(num_packets);

    let (first, mut rest) = missing.split_at(missing.len().min(per_first));
    let mut words = Vec::with_capacity(first.len() + 1);
    words.push(num_packets.prechecked_cast());
    words.extend_from_slice(first);
    result.push(codec.encode_control(CommandId::StartMissingSeq, transaction_id, &words));

    while !rest.is_empty() {
        let (chunk, remainder) = rest.split_at(rest.len().min(per_continuation));
        result.push(codec.encode_control(CommandId::MissingSeq, transaction_id, chunk));
        rest = remainder;
    }

    result
}

/// Device side reassembly of a multi-packet host report, used by the device simulator
#[derive(Debug, Default)]
pub struct HostReportAssembler {
    expected_packets: Option<u32>,
    received_packets: u32,
    missing: Vec<u32>,
}

impl HostReportAssembler {
    /// Returns the complete list of missing sequence numbers once all packets arrived
    pub fn absorb(&mut self, frame: &Frame) -> Option<Vec<u32>> {
        let words = frame.words();
        match frame.command {
            CommandId::StartMissingSeq => {
                let (&num_packets, seqs) = words.split_first()?;
                self.expected_packets = Some(num_packets);
                self.received_packets = 1;
                self.missing = seqs.to_vec();
            }
            CommandId::MissingSeq => {
                self.expected_packets?;
                self.received_packets += 1;
                self.missing.extend_from_slice(&words);
            }
            _ => return None,
        }

        if Some(self.received_packets) == self.expected_packets {
            self.expected_packets = None;
            return Some(std::mem::take(&mut self.missing));
        }
        None
    }
}

/// Encodes the device's report during injection, used by the device simulator
pub fn encode_device_missing_report(codec: &FrameCodec, transaction_id: u32, missing: &[u32], max_sequence: u32) -> Vec<Datagram> {
    let max_sequence: usize = max_sequence.safe_cast();
    if missing.len() == max_sequence {
        return vec![codec.encode_control(CommandId::ReceiveMissingSeqData, transaction_id, &[ALL_MISSING_FLAG])];
    }

    let per_packet = codec.words_per_datagram() - HEADER_WORDS;
    let mut words = missing.to_vec();
    words.push(MISSING_SEQ_END_FLAG);
    words.chunks(per_packet)
        .map(|chunk| codec.encode_control(CommandId::ReceiveMissingSeqData, transaction_id, chunk))
        .collect()
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReportProgress {
    Partial,
    Complete,
}

/// Host side accumulation of the device's missing report during injection
#[derive(Debug, Default)]
pub struct DeviceReportCollector {
    missing: BitSet,
    all_missing: bool,
    has_content: bool,
}

impl DeviceReportCollector {
    /// true once at least one report packet arrived since the last [DeviceReportCollector::take]
    pub fn has_content(&self) -> bool {
        self.has_content
    }

    /// Returns `Err(seq)` for a sequence number outside `[0, max_sequence)`
    pub fn absorb(&mut self, words: &[u32], max_sequence: u32) -> Result<ReportProgress, u32> {
        self.has_content = true;
        for &w in words {
            match w {
                MISSING_SEQ_END_FLAG => return Ok(ReportProgress::Complete),
                ALL_MISSING_FLAG => {
                    self.all_missing = true;
                    return Ok(ReportProgress::Complete);
                }
                seq if seq >= max_sequence => return Err(seq),
                seq => { self.missing.insert(seq.safe_cast()); }
            }
        }
        Ok(ReportProgress::Partial)
    }

    /// The accumulated sequence numbers in ascending order, resetting the collector
    pub fn take(&mut self, max_sequence: u32) -> Vec<u32> {
        let result = if self.all_missing {
            (0..max_sequence).collect()
        }
        else {
            self.missing.iter().map(|s| s.prechecked_cast()).collect()
        };
        *self = DeviceReportCollector::default();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn codec() -> FrameCodec {
        FrameCodec::new(272)
    }

    #[rstest]
    #[case::empty(0, 0)]
    #[case::single(1, 1)]
    #[case::full_first(65, 1)]
    #[case::one_continuation(66, 2)]
    #[case::full_continuation(131, 2)]
    #[case::two_continuations(132, 3)]
    fn test_host_report_packets(#[case] num_missing: u32, #[case] expected_packets: usize) {
        let missing = (0..num_missing).map(|i| i * 3).collect::<Vec<_>>();
        let dgrams = encode_host_missing_report(&codec(), 5, &missing);
        assert_eq!(dgrams.len(), expected_packets);

        let mut assembler = HostReportAssembler::default();
        let mut assembled = None;
        for (i, dgram) in dgrams.iter().enumerate() {
            assert!(dgram.len() <= 272);
            let frame = codec().decode(dgram.as_ref()).unwrap();
            assert_eq!(frame.transaction_id, 5);
            let expected_command = if i == 0 { CommandId::StartMissingSeq } else { CommandId::MissingSeq };
            assert_eq!(frame.command, expected_command);

            assembled = assembler.absorb(&frame);
            assert_eq!(assembled.is_some(), i == dgrams.len() - 1);
        }
        if num_missing > 0 {
            assert_eq!(assembled, Some(missing));
        }
    }

    #[test]
    fn test_assembler_ignores_orphan_continuation() {
        let frame = codec().decode(codec().encode_control(CommandId::MissingSeq, 1, &[1, 2]).as_ref()).unwrap();
        let mut assembler = HostReportAssembler::default();
        assert_eq!(assembler.absorb(&frame), None);
    }

    fn collect(dgrams: &[Datagram], max_sequence: u32) -> (Vec<ReportProgress>, Vec<u32>) {
        let mut collector = DeviceReportCollector::default();
        let progress = dgrams.iter()
            .map(|d| codec().decode(d.as_ref()).unwrap())
            .map(|f| collector.absorb(&f.words(), max_sequence).unwrap())
            .collect();
        (progress, collector.take(max_sequence))
    }

    #[test]
    fn test_device_report_single_packet() {
        let dgrams = encode_device_missing_report(&codec(), 1, &[3, 7, 9], 20);
        assert_eq!(dgrams.len(), 1);
        let (progress, missing) = collect(&dgrams, 20);
        assert_eq!(progress, vec![ReportProgress::Complete]);
        assert_eq!(missing, vec![3, 7, 9]);
    }

    #[test]
    fn test_device_report_multi_packet() {
        let missing = (0..150).map(|i| 2 * i).collect::<Vec<_>>();
        let dgrams = encode_device_missing_report(&codec(), 1, &missing, 1000);
        assert_eq!(dgrams.len(), 3);
        let (progress, collected) = collect(&dgrams, 1000);
        assert_eq!(progress, vec![ReportProgress::Partial, ReportProgress::Partial, ReportProgress::Complete]);
        assert_eq!(collected, missing);
    }

    #[test]
    fn test_device_report_all_missing() {
        let dgrams = encode_device_missing_report(&codec(), 1, &[0, 1, 2, 3], 4);
        assert_eq!(codec().decode(dgrams[0].as_ref()).unwrap().words(), vec![ALL_MISSING_FLAG]);
        let (_, collected) = collect(&dgrams, 4);
        assert_eq!(collected, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_device_report_insane() {
        let mut collector = DeviceReportCollector::default();
        assert_eq!(collector.absorb(&[1, 20], 20), Err(20));
    }
}
