use rustc_hash::FxHashMap;
use tracing::{debug, info};
use transport::core_location::CoreLocation;
use transport::error::{TransferError, TransferResult};
use crate::pending_payload::{PendingTimedPayload, TimedKeys};

/// Something that holds timed keys to be sent into device regions while the application runs
pub trait BufferedSource {
    /// the region ids that have buffered data, in ascending order
    fn regions(&self) -> Vec<u8>;

    fn has_next(&self, region: u8) -> bool;

    /// The next timestamp's keys for a region, advancing that region's cursor
    fn next_ready(&mut self, region: u8) -> Option<TimedKeys>;

    /// Moves a region's cursor back by one timestamp
    fn unread(&mut self, region: u8);

    fn rewind(&mut self, region: u8);

    /// `(buffer_cap_bytes, total_bytes)`, see [PendingTimedPayload::required_sdram]
    fn required_sdram(&self, region: u8) -> Option<(usize, usize)>;
}

/// The send buffers of a single core, one payload per region
#[derive(Debug)]
pub struct CoreSendBuffers {
    core: CoreLocation,
    regions: FxHashMap<u8, PendingTimedPayload>,
}

impl CoreSendBuffers {
    pub fn new(core: CoreLocation) -> CoreSendBuffers {
        CoreSendBuffers {
            core,
            regions: Default::default(),
        }
    }

    pub fn core(&self) -> CoreLocation {
        self.core
    }

    pub fn payload(&self, region: u8) -> Option<&PendingTimedPayload> {
        self.regions.get(&region)
    }

    fn payload_mut(&mut self, region: u8, max_buffer_size: usize) -> &mut PendingTimedPayload {
        self.regions.entry(region)
            .or_insert_with(|| PendingTimedPayload::new(max_buffer_size))
    }
}

impl BufferedSource for CoreSendBuffers {
    fn regions(&self) -> Vec<u8> {
        let mut result = self.regions.keys().copied().collect::<Vec<_>>();
        result.sort();
        result
    }

    fn has_next(&self, region: u8) -> bool {
        self.regions.get(&region)
            .map(|p| p.has_next())
            .unwrap_or(false)
    }

    fn next_ready(&mut self, region: u8) -> Option<TimedKeys> {
        self.regions.get_mut(&region)?
            .next_ready()
            .cloned()
    }

    fn unread(&mut self, region: u8) {
        if let Some(p) = self.regions.get_mut(&region) {
            p.unread();
        }
    }

    fn rewind(&mut self, region: u8) {
        if let Some(p) = self.regions.get_mut(&region) {
            p.rewind();
        }
    }

    fn required_sdram(&self, region: u8) -> Option<(usize, usize)> {
        self.regions.get(&region)
            .map(|p| p.required_sdram())
    }
}

/// All cores' send buffers. Regions are created when a core first buffers data for them.
pub struct SendBufferRegistry {
    default_max_buffer_size: usize,
    cores: FxHashMap<CoreLocation, CoreSendBuffers>,
}

impl SendBufferRegistry {
    pub fn new(default_max_buffer_size: usize) -> SendBufferRegistry {
        SendBufferRegistry {
            default_max_buffer_size,
            cores: Default::default(),
        }
    }

    /// Registers a region with a device buffer limit other than the default. This has no effect
    ///  if the region already exists.
    pub fn register_region(&mut self, core: CoreLocation, region: u8, max_buffer_size: usize) {
        debug!("registering send buffer for {} region {} with at most {} bytes", core, region, max_buffer_size);
        self.cores.entry(core)
            .or_insert_with(|| CoreSendBuffers::new(core))
            .payload_mut(region, max_buffer_size);
    }

    /// Timestamps must not decrease per region. A violation is a programming error on the
    ///  caller's side and leaves the buffer unchanged.
    pub fn record_pending(&mut self, core: CoreLocation, region: u8, timestamp: u32, keys: &[u32]) -> TransferResult<()> {
        let default_max_buffer_size = self.default_max_buffer_size;
        self.cores.entry(core)
            .or_insert_with(|| CoreSendBuffers::new(core))
            .payload_mut(region, default_max_buffer_size)
            .add_keys(timestamp, keys)
            .map_err(|last| TransferError::OutOfOrderTimestamp { core, region, timestamp, last })
    }

    pub fn source(&self, core: CoreLocation) -> Option<&CoreSendBuffers> {
        self.cores.get(&core)
    }

    pub fn source_mut(&mut self, core: CoreLocation) -> Option<&mut CoreSendBuffers> {
        self.cores.get_mut(&core)
    }

    pub fn cores(&self) -> Vec<CoreLocation> {
        let mut result = self.cores.keys().copied().collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn next_ready(&mut self, core: CoreLocation, region: u8) -> Option<TimedKeys> {
        self.cores.get_mut(&core)?
            .next_ready(region)
    }

    pub fn rewind(&mut self, core: CoreLocation, region: u8) {
        if let Some(source) = self.cores.get_mut(&core) {
            source.rewind(region);
        }
    }

    /// Rewinds every region, e.g. before the application is run again
    pub fn rewind_all(&mut self) {
        for source in self.cores.values_mut() {
            for region in source.regions() {
                source.rewind(region);
            }
        }
    }

    pub fn clear(&mut self, core: CoreLocation, region: u8) {
        info!("clearing send buffer of {} region {}", core, region);
        if let Some(source) = self.cores.get_mut(&core) {
            source.regions.remove(&region);
            if source.regions.is_empty() {
                self.cores.remove(&core);
            }
        }
    }

    pub fn required_sdram(&self, core: CoreLocation, region: u8) -> Option<(usize, usize)> {
        self.cores.get(&core)?
            .required_sdram(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORE: CoreLocation = CoreLocation { x: 0, y: 1, p: 2 };

    #[test]
    fn test_record_pending() {
        let mut registry = SendBufferRegistry::new(1024);
        registry.record_pending(CORE, 3, 10, &[1, 2]).unwrap();
        registry.record_pending(CORE, 3, 10, &[3]).unwrap();
        registry.record_pending(CORE, 3, 12, &[4]).unwrap();
        // regions are independent
        registry.record_pending(CORE, 4, 1, &[5]).unwrap();

        match registry.record_pending(CORE, 3, 11, &[6]) {
            Err(TransferError::OutOfOrderTimestamp { core, region, timestamp, last }) => {
                assert_eq!(core, CORE);
                assert_eq!(region, 3);
                assert_eq!(timestamp, 11);
                assert_eq!(last, 12);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(registry.source(CORE).unwrap().regions(), vec![3, 4]);
        assert_eq!(registry.next_ready(CORE, 3), Some(TimedKeys { timestamp: 10, keys: vec![1, 2, 3] }));
        assert_eq!(registry.next_ready(CORE, 3), Some(TimedKeys { timestamp: 12, keys: vec![4] }));
        assert_eq!(registry.next_ready(CORE, 3), None);

        registry.rewind_all();
        assert_eq!(registry.next_ready(CORE, 3).map(|k| k.timestamp), Some(10));
    }

    #[test]
    fn test_register_region() {
        let mut registry = SendBufferRegistry::new(1024);
        registry.register_region(CORE, 1, 16);
        registry.record_pending(CORE, 1, 0, &[0; 10]).unwrap();
        assert_eq!(registry.required_sdram(CORE, 1), Some((16, 6 + 40 + 2)));
        assert_eq!(registry.required_sdram(CORE, 2), None);
    }

    #[test]
    fn test_clear() {
        let mut registry = SendBufferRegistry::new(1024);
        registry.record_pending(CORE, 1, 0, &[1]).unwrap();
        registry.clear(CORE, 1);
        assert!(registry.source(CORE).is_none());
        assert!(registry.cores().is_empty());
        // clearing an unknown region is harmless
        registry.clear(CORE, 1);
    }

    #[test]
    fn test_unread() {
        let mut source = CoreSendBuffers::new(CORE);
        source.payload_mut(0, 100).add_keys(1, &[1]).unwrap();
        assert!(source.has_next(0));
        source.next_ready(0);
        assert!(!source.has_next(0));
        source.unread(0);
        assert!(source.has_next(0));
        assert!(!source.has_next(9));
    }
}
