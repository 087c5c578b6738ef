use anyhow::bail;
use num_enum::{FromPrimitive, IntoPrimitive};
use rustc_hash::FxHashMap;
use tracing::{info, warn};
use transport::core_location::CoreLocation;

/// The last operation on a circular buffer. It disambiguates `current_read == current_write`:
///  after a read the buffer is empty, after a write it is full.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LastOperation {
    Read = 0,
    #[num_enum(default)]
    Write = 1,
}

/// Host side view of a core's recording region
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BufferedRegionState {
    pub core: CoreLocation,
    pub region_id: u8,
    pub start_address: u32,
    pub end_address: u32,
    pub current_write: u32,
    pub current_dma_write: u32,
    pub current_read: u32,
    pub last_operation: LastOperation,
    /// the device dropped data because the buffer overflowed
    pub missing: bool,
    /// the address of the region's recorded data
    pub base_address: u32,
    /// the number of bytes the region recorded
    pub recorded_size: u32,
}

impl BufferedRegionState {
    /// The pointers come from the device and are only trusted after this check:
    ///  `start_address <= current_read, current_write, current_dma_write <= end_address`
    pub fn check_pointers(&self) -> anyhow::Result<()> {
        let in_buffer = |p: u32| self.start_address <= p && p <= self.end_address;
        if !(in_buffer(self.current_read) && in_buffer(self.current_write) && in_buffer(self.current_dma_write)) {
            bail!("{} region {}: buffer pointers outside of [{:#010x}, {:#010x}]: read {:#010x}, write {:#010x}, DMA write {:#010x}",
                self.core, self.region_id, self.start_address, self.end_address,
                self.current_read, self.current_write, self.current_dma_write);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.current_read == self.current_write && self.last_operation == LastOperation::Read
    }

    /// The `(address, length)` ranges of unread data in the circular buffer, oldest first
    pub fn readable_ranges(&self) -> anyhow::Result<Vec<(u32, u32)>> {
        self.check_pointers()?;
        let read = self.current_read;
        let write = self.current_write;

        let mut result = Vec::with_capacity(2);
        if read < write {
            result.push((read, write - read));
        }
        else if read > write || self.last_operation == LastOperation::Write {
            result.push((read, self.end_address - read));
            result.push((self.start_address, write - self.start_address));
        }
        result.retain(|&(_, len)| len > 0);
        Ok(result)
    }
}

/// The region states of all cores. Each core's states are replaced wholesale when a new
///  snapshot arrives.
#[derive(Debug, Default)]
pub struct RegionStateTable {
    states: FxHashMap<(CoreLocation, u8), BufferedRegionState>,
}

impl RegionStateTable {
    pub fn replace_core(&mut self, core: CoreLocation, states: Vec<BufferedRegionState>) {
        self.states.retain(|(c, _), _| *c != core);
        for state in states {
            if state.missing {
                warn!("{} region {} lost data during the run", core, state.region_id);
            }
            self.states.insert((core, state.region_id), state);
        }
    }

    /// Replaces a single region's state, e.g. after its data was read
    pub fn replace_region(&mut self, state: BufferedRegionState) {
        self.states.insert((state.core, state.region_id), state);
    }

    pub fn get(&self, core: CoreLocation, region_id: u8) -> Option<&BufferedRegionState> {
        self.states.get(&(core, region_id))
    }

    pub fn regions_of(&self, core: CoreLocation) -> Vec<&BufferedRegionState> {
        let mut result = self.states.values()
            .filter(|s| s.core == core)
            .collect::<Vec<_>>();
        result.sort_by_key(|s| s.region_id);
        result
    }

    /// true if any region of any core lost data
    pub fn any_missing(&self) -> bool {
        self.states.values().any(|s| s.missing)
    }

    pub fn clear(&mut self, core: CoreLocation, region_id: u8) {
        if self.states.remove(&(core, region_id)).is_some() {
            info!("cleared the state of {} region {}", core, region_id);
        }
    }

    /// forget everything, for a new run
    pub fn reset(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn state(read: u32, write: u32, last_operation: LastOperation) -> BufferedRegionState {
        BufferedRegionState {
            core: CoreLocation::new(0, 0, 1),
            region_id: 0,
            start_address: 1000,
            end_address: 2000,
            current_write: write,
            current_dma_write: write,
            current_read: read,
            last_operation,
            missing: false,
            base_address: 1000,
            recorded_size: 0,
        }
    }

    #[rstest]
    #[case(0, LastOperation::Read)]
    #[case(1, LastOperation::Write)]
    #[case(7, LastOperation::Write)]
    fn test_last_operation(#[case] raw: u8, #[case] expected: LastOperation) {
        assert_eq!(LastOperation::from(raw), expected);
    }

    #[rstest]
    #[case::empty(1200, 1200, LastOperation::Read, vec![])]
    #[case::full(1200, 1200, LastOperation::Write, vec![(1200, 800), (1000, 200)])]
    #[case::full_at_start(1000, 1000, LastOperation::Write, vec![(1000, 1000)])]
    #[case::linear(1100, 1300, LastOperation::Write, vec![(1100, 200)])]
    #[case::wrapped(1800, 1100, LastOperation::Write, vec![(1800, 200), (1000, 100)])]
    #[case::wrapped_to_start(1800, 1000, LastOperation::Write, vec![(1800, 200)])]
    fn test_readable_ranges(#[case] read: u32, #[case] write: u32, #[case] op: LastOperation, #[case] expected: Vec<(u32, u32)>) {
        assert_eq!(state(read, write, op).readable_ranges().unwrap(), expected);
    }

    #[rstest]
    #[case::read_after_end(2100, 1100)]
    #[case::read_before_start(900, 1100)]
    #[case::write_after_end(1100, 2001)]
    #[case::write_before_start(1100, 0)]
    fn test_pointers_out_of_bounds(#[case] read: u32, #[case] write: u32) {
        let s = state(read, write, LastOperation::Write);
        assert!(s.check_pointers().is_err());
        assert!(s.readable_ranges().is_err());
    }

    #[test]
    fn test_dma_pointer_out_of_bounds() {
        let mut s = state(1100, 1200, LastOperation::Write);
        s.current_dma_write = 3000;
        assert!(s.readable_ranges().is_err());
    }

    #[test]
    fn test_unused_buffer() {
        let mut s = state(0, 0, LastOperation::Read);
        s.start_address = 0;
        s.end_address = 0;
        assert!(s.readable_ranges().unwrap().is_empty());
    }

    #[test]
    fn test_replace_core() {
        let core = CoreLocation::new(0, 0, 1);
        let other = CoreLocation::new(0, 0, 2);
        let mut table = RegionStateTable::default();

        let mut s0 = state(1000, 1000, LastOperation::Read);
        let mut s1 = s0.clone();
        s1.region_id = 1;
        table.replace_core(core, vec![s0.clone(), s1]);
        let mut s_other = s0.clone();
        s_other.core = other;
        table.replace_core(other, vec![s_other]);

        s0.missing = true;
        table.replace_core(core, vec![s0]);
        assert_eq!(table.regions_of(core).len(), 1);
        assert!(table.get(core, 1).is_none());
        assert!(table.any_missing());
        assert!(table.get(other, 0).is_some());

        let mut read = table.get(core, 0).unwrap().clone();
        read.last_operation = LastOperation::Read;
        table.replace_region(read);
        assert_eq!(table.get(core, 0).unwrap().last_operation, LastOperation::Read);

        table.clear(other, 0);
        assert!(table.get(other, 0).is_none());
        table.reset();
        assert!(!table.any_missing());
    }
}
