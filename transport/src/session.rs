use std::fmt::{Display, Formatter};
use std::time::Duration;
use bit_set::BitSet;
use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use crate::clock::Clock;
use crate::commands::TransferDirection;
use crate::config::TransferConfig;
use crate::core_location::CoreLocation;
use crate::datagram_socket::DatagramSocket;
use crate::device_access::DeviceAccess;
use crate::error::{TransferError, TransferResult};
use crate::frame::{Datagram, FrameCodec};
use crate::retry::{RetryPolicy, RetryState};
use crate::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Sending,
    AwaitingReply,
    Retransmitting,
    Complete,
    Failed,
}

/// How a transfer of a given size is carried out
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransferPath {
    /// nothing to move, no connection is opened
    Empty,
    /// a single read or write through the device access layer
    Direct,
    Streamed,
}

impl TransferPath {
    pub fn choose(length_bytes: u32, config: &TransferConfig) -> TransferPath {
        let length_bytes: usize = length_bytes.safe_cast();
        if length_bytes == 0 {
            TransferPath::Empty
        }
        else if length_bytes < config.small_transfer_threshold {
            TransferPath::Direct
        }
        else {
            TransferPath::Streamed
        }
    }
}

/// What happened during a session, for logging and provenance
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TransferStats {
    pub elapsed: Duration,
    pub bytes: u32,
    /// number of datagrams carrying data, including retransmissions
    pub data_packets: u32,
    /// number of missing sequence numbers in each retransmission round
    pub lost_per_round: Vec<usize>,
}

impl TransferStats {
    pub fn rounds(&self) -> usize {
        self.lost_per_round.len()
    }

    /// Rate in megabit per second, `None` if no time elapsed
    pub fn mbits_per_second(&self) -> Option<f64> {
        if self.elapsed.is_zero() {
            return None;
        }
        Some(self.bytes as f64 * 8.0 / self.elapsed.as_secs_f64() / 1_000_000.0)
    }
}

impl Display for TransferStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} bytes in {:?}, {} data packets, {} retransmission rounds", self.bytes, self.elapsed, self.data_packets, self.rounds())
    }
}

/// The collaborators a streamed session works with
pub struct TransferContext<'a> {
    pub config: &'a TransferConfig,
    pub socket: &'a dyn DatagramSocket,
    pub device: &'a dyn DeviceAccess,
    pub clock: &'a dyn Clock,
    pub cancel: &'a CancellationToken,
}

impl TransferContext<'_> {
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.config.datagram_capacity)
    }

    pub fn retry_state(&self) -> RetryState {
        RetryState::new(RetryPolicy {
            base_timeout: self.config.receive_timeout,
            backoff: self.config.backoff,
            retry_limit: self.config.timeout_retry_limit,
        })
    }

    pub async fn send(&self, datagram: &Datagram) -> TransferResult<()> {
        self.socket.send(datagram.as_ref()).await?;
        Ok(())
    }

    /// sends a sequence of datagrams, pausing between them
    pub async fn send_throttled(&self, datagrams: &[Datagram], delay: Duration) -> TransferResult<()> {
        for (i, datagram) in datagrams.iter().enumerate() {
            if i > 0 {
                self.clock.sleep(delay).await;
            }
            self.send(datagram).await?;
        }
        Ok(())
    }

    /// Best-effort read of the remote core's state before a session fails, so that the reason
    ///  for the silence shows up in the log
    pub async fn log_core_diagnostics(&self, core: CoreLocation) {
        match self.device.read_core_state(core).await {
            Ok(state) => error!("state of unresponsive core: {}", state),
            Err(e) => warn!("could not read the state of unresponsive core {}: {}", core, e),
        }
    }
}

/// One in-flight bulk move. The session tracks which chunks are confirmed: received chunks when
///  extracting, chunks the device did not report missing when injecting.
pub struct TransferSession {
    pub direction: TransferDirection,
    pub target_core: CoreLocation,
    pub address: u32,
    pub length: u32,
    pub transaction_id: u32,
    codec: FrameCodec,
    max_sequence: u32,
    payload: BytesMut,
    confirmed: BitSet,
    state: SessionState,
    started: Option<Instant>,
    stats: TransferStats,
}

impl TransferSession {
    fn new(direction: TransferDirection, target_core: CoreLocation, address: u32, payload: BytesMut, transaction_id: u32, codec: FrameCodec) -> TransferSession {
        let length: u32 = payload.len().prechecked_cast();
        let max_sequence = codec.max_sequence(payload.len());
        TransferSession {
            direction,
            target_core,
            address,
            length,
            transaction_id,
            codec,
            max_sequence,
            payload,
            confirmed: BitSet::with_capacity(max_sequence.safe_cast()),
            state: SessionState::Idle,
            started: None,
            stats: TransferStats {
                bytes: length,
                ..TransferStats::default()
            },
        }
    }

    pub fn new_extract(target_core: CoreLocation, address: u32, length: u32, transaction_id: u32, codec: FrameCodec) -> TransferSession {
        TransferSession::new(TransferDirection::Extract, target_core, address, BytesMut::zeroed(length.safe_cast()), transaction_id, codec)
    }

    pub fn new_inject(target_core: CoreLocation, address: u32, data: &[u8], transaction_id: u32, codec: FrameCodec) -> TransferSession {
        TransferSession::new(TransferDirection::Inject, target_core, address, BytesMut::from(data), transaction_id, codec)
    }

    pub fn max_sequence(&self) -> u32 {
        self.max_sequence
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Leaves `Idle`; the session's elapsed time is measured from `now`
    pub fn start(&mut self, now: Instant) {
        self.started = Some(now);
        self.transition(SessionState::Sending);
    }

    pub fn transition(&mut self, state: SessionState) {
        if self.state != state {
            trace!("session {} on {}: {:?} -> {:?}", self.transaction_id, self.target_core, self.state, state);
            self.state = state;
        }
    }

    pub fn is_complete(&self) -> bool {
        let max_sequence: usize = self.max_sequence.safe_cast();
        self.confirmed.len() == max_sequence
    }

    pub fn num_confirmed(&self) -> usize {
        self.confirmed.len()
    }

    /// Unconfirmed sequence numbers in ascending order
    pub fn missing(&self) -> Vec<u32> {
        (0..self.max_sequence)
            .filter(|&seq| !self.confirmed.contains(seq.safe_cast()))
            .collect()
    }

    pub fn insane_sequence_error(&self, sequence: u32) -> TransferError {
        TransferError::InsaneSequenceNumber {
            core: self.target_core,
            address: self.address,
            length: self.length,
            sequence,
            max_sequence: self.max_sequence,
        }
    }

    fn check_sequence(&self, sequence: u32) -> TransferResult<()> {
        if sequence >= self.max_sequence {
            return Err(self.insane_sequence_error(sequence));
        }
        Ok(())
    }

    /// Stores a received chunk at its position. Returns `false` for duplicates, which are
    ///  ignored.
    pub fn record_chunk(&mut self, sequence: u32, data: &[u8]) -> TransferResult<bool> {
        self.check_sequence(sequence)?;
        self.stats.data_packets += 1;

        if !self.confirmed.insert(sequence.safe_cast()) {
            trace!("duplicate chunk {}", sequence);
            return Ok(false);
        }

        let range = self.codec.chunk_range(sequence, self.payload.len());
        if data.len() < range.len() {
            self.confirmed.remove(sequence.safe_cast());
            return Err(TransferError::MalformedFrame(format!("chunk {} has {} bytes, expected {}", sequence, data.len(), range.len())));
        }
        let len = range.len();
        self.payload[range].copy_from_slice(&data[..len]);
        Ok(true)
    }

    /// The data of a chunk for sending
    pub fn chunk(&self, sequence: u32) -> &[u8] {
        &self.payload[self.codec.chunk_range(sequence, self.payload.len())]
    }

    pub fn count_sent_chunk(&mut self) {
        self.stats.data_packets += 1;
    }

    /// Injection: everything except the reported sequence numbers arrived
    pub fn confirm_all_except(&mut self, missing: &[u32]) -> TransferResult<()> {
        for &seq in missing {
            self.check_sequence(seq)?;
        }
        let max_sequence: usize = self.max_sequence.safe_cast();
        self.confirmed = (0..max_sequence).collect();
        for &seq in missing {
            self.confirmed.remove(seq.safe_cast());
        }
        Ok(())
    }

    pub fn record_round(&mut self, num_missing: usize, minor_loss_threshold: usize) {
        let round = self.stats.lost_per_round.len() + 1;
        if num_missing > minor_loss_threshold {
            warn!("session {} on {}: round {} lost {} of {} packets", self.transaction_id, self.target_core, round, num_missing, self.max_sequence);
        }
        else {
            debug!("session {} on {}: round {} lost {} packets", self.transaction_id, self.target_core, round, num_missing);
        }
        self.stats.lost_per_round.push(num_missing);
    }

    pub fn timeout_error(&self, attempts: u32) -> TransferError {
        TransferError::TransferTimeout {
            core: self.target_core,
            address: self.address,
            length: self.length,
            attempts,
        }
    }

    pub fn cancelled_error(&self) -> TransferError {
        TransferError::Cancelled {
            core: self.target_core,
            address: self.address,
            length: self.length,
        }
    }

    pub fn fail(&mut self) {
        self.transition(SessionState::Failed);
    }

    /// Completes the session, handing out the payload and the statistics
    pub fn finish(mut self, now: Instant) -> (Bytes, TransferStats) {
        self.transition(SessionState::Complete);
        self.stats.elapsed = self.started
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        info!("session {} on {} ({:?}) complete: {}", self.transaction_id, self.target_core, self.direction, self.stats);
        (self.payload.freeze(), self.stats)
    }
}
