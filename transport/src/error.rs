use crate::core_location::CoreLocation;
use thiserror::Error;

/// The typed failures of the data movement protocol.
///
/// Framing and window errors are expected under an unreliable transport and are handled where
///  they occur (dropped, ignored or backed off from). Timeouts and insane sequence numbers end
///  a session and reach the caller, carrying the target core and byte range for diagnostics.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("sequence window is full: {window_size} messages are awaiting acknowledgement")]
    WindowFull { window_size: usize },

    #[error("timestamp {timestamp} precedes the last recorded timestamp {last} for {core} region {region}")]
    OutOfOrderTimestamp {
        core: CoreLocation,
        region: u8,
        timestamp: u32,
        last: u32,
    },

    #[error("no reply from {core} after {attempts} attempts while moving {length} bytes at {address:#010x}")]
    TransferTimeout {
        core: CoreLocation,
        address: u32,
        length: u32,
        attempts: u32,
    },

    #[error("insane sequence number {sequence} from {core} (expected less than {max_sequence}) while moving {length} bytes at {address:#010x}")]
    InsaneSequenceNumber {
        core: CoreLocation,
        address: u32,
        length: u32,
        sequence: u32,
        max_sequence: u32,
    },

    #[error("transfer of {length} bytes at {address:#010x} on {core} was cancelled")]
    Cancelled {
        core: CoreLocation,
        address: u32,
        length: u32,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device access failed: {0}")]
    Device(anyhow::Error),
}

impl From<anyhow::Error> for TransferError {
    fn from(e: anyhow::Error) -> TransferError {
        TransferError::Device(e)
    }
}

impl TransferError {
    /// true for failures that end a session, as opposed to the ones handled inside a component
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransferError::MalformedFrame(_) | TransferError::WindowFull { .. })
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
