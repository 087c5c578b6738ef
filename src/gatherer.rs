use std::future::Future;
use std::sync::Arc;
use anyhow::anyhow;
use bytes::Bytes;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, Instrument, Level};
use uuid::Uuid;
use transport::clock::Clock;
use transport::config::TransferConfig;
use transport::core_location::CoreLocation;
use transport::datagram_socket::{DatagramConnector, DatagramSocket};
use transport::device_access::DeviceAccess;
use transport::error::{TransferError, TransferResult};
use transport::extract::extract;
use transport::frame::WORD_LEN;
use transport::inject::inject;
use transport::monitor::ReinjectionControllable;
use transport::session::{TransferContext, TransferPath, TransferStats};
use crate::registry::{SessionGuard, SessionRegistry};
use crate::streaming::StreamingScope;

/// A range of memory to extract
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DataRequest {
    pub core: CoreLocation,
    pub address: u32,
    pub length: u32,
}

/// A word aligned range enclosing a byte range, and where the byte range lies inside it
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct AlignedRange {
    address: u32,
    length: u32,
    /// padding before the requested range
    initial: usize,
}

impl AlignedRange {
    fn enclosing(address: u32, length: u32) -> TransferResult<AlignedRange> {
        let word = WORD_LEN as u32;
        let initial = address % word;
        let aligned_length = length.checked_add(initial)
            .and_then(|padded| padded.checked_next_multiple_of(word))
            .ok_or_else(|| TransferError::Device(anyhow!("{} bytes at {:#010x} exceed the address space when word aligned", length, address)))?;
        Ok(AlignedRange {
            address: address - initial,
            length: aligned_length,
            initial: initial as usize,
        })
    }

    fn strip(&self, data: Bytes, length: u32) -> Bytes {
        data.slice(self.initial..self.initial + length as usize)
    }
}

/// A core reserved for a streamed session, with its own connection to the core's monitor
pub struct OpenSession<'a> {
    gatherer: &'a DataGatherer,
    guard: SessionGuard,
    socket: Box<dyn DatagramSocket>,
}

impl OpenSession<'_> {
    pub fn core(&self) -> CoreLocation {
        self.guard.core
    }

    pub fn transaction_id(&self) -> u32 {
        self.guard.transaction_id
    }

    pub fn context(&self) -> TransferContext<'_> {
        TransferContext {
            config: &self.gatherer.config,
            socket: self.socket.as_ref(),
            device: self.gatherer.device.as_ref(),
            clock: self.gatherer.clock.as_ref(),
            cancel: &self.gatherer.cancel,
        }
    }
}

/// Entry point for moving data between the host and the machine's memory.
///
/// Small ranges are read or written directly through the device access layer, larger ones are
///  streamed through the core's monitor with the routers configured for streaming. Sessions on
///  the same core are serialized, sessions on different cores run concurrently.
pub struct DataGatherer {
    config: TransferConfig,
    device: Arc<dyn DeviceAccess>,
    connector: Arc<dyn DatagramConnector>,
    clock: Arc<dyn Clock>,
    registry: SessionRegistry,
    streaming: StreamingScope,
    cancel: CancellationToken,
}

impl DataGatherer {
    pub fn new(
        config: TransferConfig,
        device: Arc<dyn DeviceAccess>,
        connector: Arc<dyn DatagramConnector>,
        monitor: Arc<dyn ReinjectionControllable>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<DataGatherer> {
        config.validate()?;

        Ok(DataGatherer {
            config,
            streaming: StreamingScope::new(monitor, device.clone()),
            device,
            connector,
            clock,
            registry: SessionRegistry::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn device(&self) -> &dyn DeviceAccess {
        self.device.as_ref()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Aborts all running sessions. Cores with abandoned sessions need to be reset.
    pub fn shutdown(&self) {
        info!("cancelling all data transfers");
        self.cancel.cancel();
    }

    /// Keeps the routers configured for streaming while `f` runs, so that a batch of transfers
    ///  does not switch them back and forth between its sessions. `monitor_cores` have their
    ///  state logged if switching back fails.
    pub async fn with_streaming<F, T, E>(&self, monitor_cores: &[CoreLocation], f: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<anyhow::Error>,
    {
        self.streaming.run(monitor_cores, f).await
    }

    /// Waits for the core to be free and connects to its monitor
    pub async fn open_session(&self, core: CoreLocation) -> TransferResult<OpenSession<'_>> {
        let guard = self.registry.acquire(core).await;
        let socket = self.connector.connect(core).await
            .map_err(TransferError::Device)?;
        Ok(OpenSession {
            gatherer: self,
            guard,
            socket,
        })
    }

    /// Reads `length` bytes at `address` from the memory of `core`'s chip
    pub async fn get_data(&self, core: CoreLocation, address: u32, length: u32) -> TransferResult<Bytes> {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::DEBUG, "get_data", ?correlation_id, %core);

        async {
            match TransferPath::choose(length, &self.config) {
                TransferPath::Empty => Ok(Bytes::new()),
                TransferPath::Direct => {
                    debug!("reading {} bytes at {:#010x} directly", length, address);
                    self.device.read_memory(core.chip(), address, length).await
                        .map_err(TransferError::Device)
                }
                TransferPath::Streamed => {
                    let aligned = AlignedRange::enclosing(address, length)?;
                    self.streaming.run(&[core], async {
                        let session = self.open_session(core).await?;
                        let (data, stats) = extract(&session.context(), core, aligned.address, aligned.length, session.transaction_id()).await?;
                        log_stats("extracted", core, &stats);
                        Ok::<_, TransferError>(aligned.strip(data, length))
                    }).await
                }
            }
        }.instrument(span).await
    }

    /// Writes `data` at `address` into the memory of `core`'s chip
    pub async fn send_data_into(&self, core: CoreLocation, address: u32, data: &[u8]) -> TransferResult<()> {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::DEBUG, "send_data_into", ?correlation_id, %core);

        async {
            let length = u32::try_from(data.len())
                .map_err(|_| TransferError::Device(anyhow!("{} bytes do not fit into the address space", data.len())))?;

            match TransferPath::choose(length, &self.config) {
                TransferPath::Empty => Ok(()),
                TransferPath::Direct => {
                    debug!("writing {} bytes at {:#010x} directly", length, address);
                    self.device.write_memory(core.chip(), address, data).await
                        .map_err(TransferError::Device)
                }
                TransferPath::Streamed => {
                    self.streaming.run(&[core], async {
                        let session = self.open_session(core).await?;
                        let stats = inject(&session.context(), core, address, data, session.transaction_id()).await?;
                        log_stats("injected", core, &stats);
                        Ok::<_, TransferError>(())
                    }).await
                }
            }
        }.instrument(span).await
    }

    /// Extracts several ranges concurrently. The results are in the order of the requests.
    pub async fn get_data_concurrently(self: &Arc<Self>, requests: &[DataRequest]) -> Vec<TransferResult<Bytes>> {
        let mut tasks = JoinSet::new();
        for (i, &request) in requests.iter().enumerate() {
            let gatherer = self.clone();
            tasks.spawn(async move {
                (i, gatherer.get_data(request.core, request.address, request.length).await)
            });
        }

        let mut results = requests.iter().map(|_| None).collect::<Vec<_>>();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, result)) => results[i] = Some(result),
                Err(e) => error!("extraction task failed: {}", e),
            }
        }
        results.into_iter()
            .map(|r| r.unwrap_or_else(|| Err(TransferError::Device(anyhow!("extraction task did not complete")))))
            .collect()
    }
}

fn log_stats(what: &str, core: CoreLocation, stats: &TransferStats) {
    match stats.mbits_per_second() {
        Some(rate) => info!("{} {} on {} ({:.1} Mb/s)", what, stats, core, rate),
        None => info!("{} {} on {}", what, stats, core),
    }
}
