//! Host side orchestration of data movement to and from a many-core machine: a registry that
//!  serializes sessions per core, the [gatherer::DataGatherer] choosing between direct access
//!  and streamed sessions, the router configuration bracket for streaming, continuous event
//!  delivery into running cores, and extraction of recorded data after a run.

pub mod event_stream;
pub mod extraction;
pub mod gatherer;
pub mod registry;
pub mod streaming;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
