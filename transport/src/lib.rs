//! Reliable bulk data movement between the host and the memory of a many-core machine.
//!
//! The machine's fabric carries small datagrams that may be dropped silently and arrive in any
//!  order. Each chip has a monitor core that streams memory ranges to the host (extraction)
//!  and writes streamed data into memory (injection). This crate implements the host side of
//!  that protocol.
//!
//! ## Design goals
//!
//! * Throughput for large ranges: data is sent without waiting for acknowledgements, the
//!   receiver reports what is missing at the end of a round and only that is re-sent
//! * Any chunk can be re-sent at any time: a chunk's position follows from its sequence number
//!   alone, never from a running cursor
//! * Sessions on different cores are independent and run concurrently, each with its own socket
//! * Small ranges do not pay for the protocol's setup: they are read or written directly
//! * Timeouts are bounded and retried; a session that gets no reply fails with the core and the
//!   byte range, after a diagnostic read of the core's state
//!
//! ## Frames
//!
//! All numbers are little-endian u32 words:
//!
//! ```ascii
//! 0: command id
//! 4: transaction id - frames of other transactions are stale and ignored
//! 8: (data commands only) sequence number, bit 31 marks the last packet of a round
//! *: payload
//! ```
//!
//! The hardware's datagrams are 272 bytes, leaving 260 bytes of data per chunk.
//!
//! ## Extraction (device to host)
//!
//! ```ascii
//! host                                   monitor
//!  |-- START_SENDING{address, length} ----->|
//!  |<------------- SEQUENCED_DATA{seq, ...} |  (all chunks, last one flagged)
//!  |-- START_MISSING_SEQ{n, seq...} ------->|
//!  |-- MISSING_SEQ{seq...} --------------->|  (continuations if needed)
//!  |<------------- SEQUENCED_DATA{seq, ...} |  (the missing chunks, last one flagged)
//!  |-- CLEAR ------------------------------>|  (when complete)
//! ```
//!
//! ## Injection (host to device)
//!
//! ```ascii
//! host                                   monitor
//!  |-- SEND_DATA_TO_LOCATION{address, chip, last seq} -->|
//!  |-- SEND_SEQ_DATA{seq, ...} ------------------------->|  (all chunks)
//!  |-- SEND_TELL --------------------------------------->|
//!  |<-------------------- RECEIVE_MISSING_SEQ_DATA{...} |  (ends with 0xFFFFFFFF)
//!  |-- SEND_SEQ_DATA{seq, ...}, SEND_TELL -------------->|  (the missing chunks)
//!  |<------------------------------- RECEIVE_FINISHED   |
//! ```
//!
//! ## Continuous event delivery
//!
//! Event payloads are streamed into a circular buffer on the device as `HOST_SEND_SEQUENCED`
//!  messages with one-byte sequence numbers. The device acknowledges cumulatively with
//!  `REQUEST_BUFFERS{region, last received seq, space available}`, and a [sequence_window]
//!  limits the number of unacknowledged messages.

pub mod clock;
pub mod commands;
pub mod config;
pub mod core_location;
pub mod datagram_socket;
pub mod device_access;
pub mod error;
pub mod event_frame;
pub mod extract;
pub mod frame;
pub mod inject;
pub mod missing_report;
pub mod monitor;
pub mod retry;
pub mod safe_converter;
pub mod sequence_window;
pub mod session;
pub mod test_util;
