use std::time::Duration;
use anyhow::bail;
use crate::frame::{HEADER_LEN, SEQUENCE_LEN, WORD_LEN};
use crate::retry::Backoff;

pub struct TransferConfig {
    /// The number of bytes that fit into a single datagram on the fabric, including the frame
    ///  header. The hardware's SDP packets carry 272 bytes of payload after the routing header.
    ///
    /// This must be a multiple of the word size since the monitor firmware reads and writes
    ///  whole words.
    pub datagram_capacity: usize,

    /// Transfers shorter than this are done as a single direct read or write through the device
    ///  access layer rather than a streamed session. The protocol's setup cost (start packet,
    ///  end flag, missing report) dominates for small ranges.
    pub small_transfer_threshold: usize,

    /// Base timeout for a single receive attempt. Whether it grows between attempts depends on
    ///  the backoff.
    pub receive_timeout: Duration,
    pub backoff: Backoff,

    /// The number of consecutive receive timeouts after which a session fails. Any valid frame
    ///  resets the counter.
    pub timeout_retry_limit: u32,

    /// The delay between consecutive data packets, throttling the sender so that the monitor's
    ///  receive buffers are not overrun
    pub send_delay: Duration,

    /// The delay between the packets of a multi-packet missing report
    pub missing_report_delay: Duration,

    /// Retransmission rounds that lose more than this number of packets are logged as warnings
    pub minor_loss_threshold: usize,

    /// The maximum number of unacknowledged messages on the continuous event path
    pub window_size: usize,
}

impl TransferConfig {
    /// Settings for the standard hardware: 272 byte SDP payloads, a monitor core per chip
    pub fn default_spinnaker() -> TransferConfig {
        TransferConfig {
            datagram_capacity: 272,
            small_transfer_threshold: 40 * 1024,
            receive_timeout: Duration::from_secs(1),
            backoff: Backoff::Fixed,
            timeout_retry_limit: 100,
            send_delay: Duration::from_micros(1),
            missing_report_delay: Duration::from_millis(10),
            minor_loss_threshold: 10,
            window_size: 64,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.datagram_capacity % WORD_LEN != 0 {
            bail!("datagram capacity {} is not a multiple of the word size", self.datagram_capacity);
        }
        if self.datagram_capacity < HEADER_LEN + SEQUENCE_LEN + 4 * WORD_LEN {
            bail!("datagram capacity {} is too small to carry data", self.datagram_capacity);
        }
        if self.receive_timeout.is_zero() {
            bail!("receive timeout must be positive");
        }
        if self.window_size == 0 || self.window_size > 128 {
            // sequence numbers are a single byte, and acknowledgements are only unambiguous if
            //  the window covers at most half of them
            bail!("window size {} is outside of the range 1..=128", self.window_size);
        }
        self.backoff.validate()?;

        Ok(())
    }

    pub fn chunk_payload_bytes(&self) -> usize {
        self.datagram_capacity - HEADER_LEN - SEQUENCE_LEN
    }
}
