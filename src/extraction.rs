use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::{anyhow, bail};
use bytes::Buf;
use buffering::region_state::{BufferedRegionState, LastOperation, RegionStateTable};
use buffering::region_store::RegionStore;
use buffering::snapshot::{ingest_device_snapshot, snapshot_len, HEADER_BYTES};
use tracing::{debug, info, warn};
use transport::core_location::CoreLocation;
use transport::safe_converter::SafeCast;
use crate::gatherer::DataGatherer;

/// What was read from a region in one extraction
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RegionExtraction {
    pub region_id: u8,
    pub bytes_read: usize,
    pub missing: bool,
}

/// Reads the recorded data of cores after a run and keeps it in a [RegionStore].
///
/// Each core has a snapshot of its recording regions in memory. A region either reports the
///  size of its recorded data at its base address, or has unread data in its circular buffer.
///  Recorded data that is already in the store is not read again, so extraction can be repeated
///  after the host restarted.
pub struct RecordingExtractor {
    gatherer: Arc<DataGatherer>,
    store: Arc<dyn RegionStore>,
    states: Mutex<RegionStateTable>,
}

impl RecordingExtractor {
    pub fn new(gatherer: Arc<DataGatherer>, store: Arc<dyn RegionStore>) -> RecordingExtractor {
        RecordingExtractor {
            gatherer,
            store,
            states: Default::default(),
        }
    }

    fn states(&self) -> MutexGuard<'_, RegionStateTable> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn region_state(&self, core: CoreLocation, region_id: u8) -> Option<BufferedRegionState> {
        self.states().get(core, region_id).cloned()
    }

    pub fn any_missing(&self) -> bool {
        self.states().any_missing()
    }

    /// Reads the snapshot at `snapshot_address` and extracts all of the core's regions. The
    ///  routers stay configured for streaming until all regions are read.
    pub async fn extract_core(&self, core: CoreLocation, snapshot_address: u32) -> anyhow::Result<Vec<RegionExtraction>> {
        self.gatherer.with_streaming(&[core], async {
            let header = self.gatherer.get_data(core, snapshot_address, HEADER_BYTES as u32).await?;
            if header.len() < HEADER_BYTES {
                bail!("snapshot header of {} has {} bytes, expected {}", core, header.len(), HEADER_BYTES);
            }
            let n_regions: usize = (&header[..]).get_u32_le().safe_cast();
            let length = u32::try_from(snapshot_len(n_regions))
                .map_err(|_| anyhow!("snapshot of {} claims {} regions", core, n_regions))?;
            let raw = self.gatherer.get_data(core, snapshot_address, length).await?;
            let states = ingest_device_snapshot(core, &raw)?;

            self.states().replace_core(core, states.clone());

            let mut result = Vec::with_capacity(states.len());
            for state in states {
                self.store.store_region_state(&state)?;
                let extraction = if state.recorded_size > 0 {
                    self.extract_recorded(&state).await?
                }
                else {
                    self.extract_buffered(state).await?
                };
                result.push(extraction);
            }
            Ok::<_, anyhow::Error>(result)
        }).await
    }

    async fn extract_recorded(&self, state: &BufferedRegionState) -> anyhow::Result<RegionExtraction> {
        let core = state.core;
        let size: usize = state.recorded_size.safe_cast();
        let stored = self.store.content_length(core, state.region_id)?;
        if stored >= size {
            debug!("{} region {} was extracted before", core, state.region_id);
            return Ok(RegionExtraction { region_id: state.region_id, bytes_read: 0, missing: state.missing });
        }
        if stored > 0 {
            info!("resuming extraction of {} region {} after {} of {} bytes", core, state.region_id, stored, size);
        }

        let offset = stored as u32;
        let data = self.gatherer.get_data(core, state.base_address + offset, state.recorded_size - offset).await?;
        self.store.append_content(core, state.region_id, &data, state.missing)?;
        Ok(RegionExtraction { region_id: state.region_id, bytes_read: data.len(), missing: state.missing })
    }

    /// Reads the unread part of a circular buffer and marks it as read
    async fn extract_buffered(&self, mut state: BufferedRegionState) -> anyhow::Result<RegionExtraction> {
        let core = state.core;
        let mut bytes_read = 0;
        for (address, length) in state.readable_ranges()? {
            let data = self.gatherer.get_data(core, address, length).await?;
            self.store.append_content(core, state.region_id, &data, state.missing)?;
            bytes_read += data.len();
        }

        if state.missing {
            warn!("{} region {}: data is missing from the buffer", core, state.region_id);
        }

        state.current_read = state.current_write;
        state.last_operation = LastOperation::Read;
        self.store.store_region_state(&state)?;
        let result = RegionExtraction { region_id: state.region_id, bytes_read, missing: state.missing };
        self.states().replace_region(state);
        Ok(result)
    }

    /// All data extracted from a region so far, and whether the device reported data as missing
    pub fn region_data(&self, core: CoreLocation, region_id: u8) -> anyhow::Result<(Vec<u8>, bool)> {
        self.store.content(core, region_id)
    }

    pub fn clear_region(&self, core: CoreLocation, region_id: u8) -> anyhow::Result<()> {
        self.states().clear(core, region_id);
        self.store.clear_region(core, region_id)
    }

    /// Forgets all states and data, for a new run
    pub fn reset(&self) -> anyhow::Result<()> {
        info!("resetting recorded data");
        self.states().reset();
        self.store.reset()
    }
}
