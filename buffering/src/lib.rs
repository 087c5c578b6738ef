//! Host side bookkeeping of the circular buffer regions on the cores: keys waiting to be sent
//!  into a region while the application runs, the state of recording regions as reported by the
//!  device at the end of a run, and the persisted record of what was extracted.

pub mod pending_payload;
pub mod region_state;
pub mod region_store;
pub mod send_buffers;
pub mod snapshot;
