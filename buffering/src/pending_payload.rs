use std::cell::Cell;
use tracing::{debug, info};

pub const KEY_BYTES: usize = 4;
/// header of an event message with a payload base
pub const EVENT_HEADER_BYTES: usize = 6;
/// header that the continuous path adds to every event message
pub const SEQUENCED_HEADER_BYTES: usize = 4;
pub const MAX_MESSAGE_BYTES: usize = 256;
pub const KEYS_PER_MESSAGE: usize = (MAX_MESSAGE_BYTES - SEQUENCED_HEADER_BYTES - EVENT_HEADER_BYTES) / KEY_BYTES;
/// the stop marker at the end of a region's data
pub const END_MARKER_BYTES: usize = 2;

/// The keys that are due at a given timestamp
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TimedKeys {
    pub timestamp: u32,
    pub keys: Vec<u32>,
}

impl TimedKeys {
    /// The keys split into chunks that fit into a single event message each
    pub fn messages(&self) -> impl Iterator<Item = &[u32]> {
        self.keys.chunks(KEYS_PER_MESSAGE)
    }
}

/// The encoded size of the given number of keys, split into as many messages as needed
pub fn encoded_size(n_keys: usize) -> usize {
    n_keys.div_ceil(KEYS_PER_MESSAGE) * EVENT_HEADER_BYTES + n_keys * KEY_BYTES
}

/// Keys to be sent to a device region at given timestamps. Timestamps must be added in
///  non-decreasing order; keys for the latest timestamp can be added repeatedly.
///
/// The sizes needed on the device are derived lazily and cached until the next insertion.
#[derive(Debug)]
pub struct PendingTimedPayload {
    entries: Vec<TimedKeys>,
    cursor: usize,
    max_buffer_size: usize,
    sizes: Cell<Option<(usize, usize)>>,
}

impl PendingTimedPayload {
    pub fn new(max_buffer_size: usize) -> PendingTimedPayload {
        PendingTimedPayload {
            entries: Vec::new(),
            cursor: 0,
            max_buffer_size,
            sizes: Cell::new(None),
        }
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Returns the last recorded timestamp as an error if `timestamp` precedes it
    pub fn add_keys(&mut self, timestamp: u32, keys: &[u32]) -> Result<(), u32> {
        match self.entries.last_mut() {
            Some(last) if last.timestamp > timestamp => return Err(last.timestamp),
            Some(last) if last.timestamp == timestamp => last.keys.extend_from_slice(keys),
            _ => self.entries.push(TimedKeys { timestamp, keys: keys.to_vec() }),
        }
        self.sizes.set(None);
        Ok(())
    }

    pub fn n_timestamps(&self) -> usize {
        self.entries.len()
    }

    pub fn timestamps(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|e| e.timestamp)
    }

    pub fn n_keys(&self, timestamp: u32) -> usize {
        self.entries.iter()
            .find(|e| e.timestamp == timestamp)
            .map(|e| e.keys.len())
            .unwrap_or(0)
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub fn peek_timestamp(&self) -> Option<u32> {
        self.entries.get(self.cursor).map(|e| e.timestamp)
    }

    /// The next entry in timestamp order, advancing the cursor
    pub fn next_ready(&mut self) -> Option<&TimedKeys> {
        let result = self.entries.get(self.cursor)?;
        self.cursor += 1;
        Some(result)
    }

    /// Moves the cursor back by one entry, e.g. when the entry did not fit into the device's
    ///  buffer after all
    pub fn unread(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    /// Starts sending from the beginning again, e.g. for a new run
    pub fn rewind(&mut self) {
        debug!("rewinding {} timestamps", self.entries.len());
        self.cursor = 0;
    }

    pub fn clear(&mut self) {
        info!("clearing {} pending timestamps", self.entries.len());
        self.entries.clear();
        self.cursor = 0;
        self.sizes.set(None);
    }

    fn sizes(&self) -> (usize, usize) {
        if let Some(sizes) = self.sizes.get() {
            return sizes;
        }

        let total = self.entries.iter()
            .map(|e| encoded_size(e.keys.len()))
            .sum::<usize>() + END_MARKER_BYTES;
        let sizes = (total.min(self.max_buffer_size), total);
        self.sizes.set(Some(sizes));
        sizes
    }

    /// The size of the device buffer needed for this payload, capped at the configured maximum
    pub fn buffer_size_bytes(&self) -> usize {
        self.sizes().0
    }

    /// The size of the complete payload including the end marker
    pub fn total_region_size_bytes(&self) -> usize {
        self.sizes().1
    }

    /// `(buffer_cap_bytes, total_bytes)` that the region needs on the device
    pub fn required_sdram(&self) -> (usize, usize) {
        self.sizes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_keys_per_message() {
        assert_eq!(KEYS_PER_MESSAGE, 61);
    }

    #[rstest]
    #[case::none(0, 0)]
    #[case::one(1, 10)]
    #[case::full_message(61, 6 + 244)]
    #[case::second_message(62, 12 + 248)]
    #[case::many(200, 4 * 6 + 800)]
    fn test_encoded_size(#[case] n_keys: usize, #[case] expected: usize) {
        assert_eq!(encoded_size(n_keys), expected);
    }

    #[test]
    fn test_order() {
        let mut payload = PendingTimedPayload::new(1024);
        payload.add_keys(5, &[1, 2]).unwrap();
        payload.add_keys(5, &[3]).unwrap();
        payload.add_keys(7, &[4]).unwrap();
        assert_eq!(payload.add_keys(6, &[5]), Err(7));

        assert_eq!(payload.n_timestamps(), 2);
        assert_eq!(payload.n_keys(5), 3);
        assert_eq!(payload.timestamps().collect::<Vec<_>>(), vec![5, 7]);

        assert_eq!(payload.next_ready().map(|e| e.timestamp), Some(5));
        assert_eq!(payload.next_ready().map(|e| e.keys.clone()), Some(vec![4]));
        assert!(payload.next_ready().is_none());

        payload.rewind();
        assert_eq!(payload.peek_timestamp(), Some(5));
    }

    #[test]
    fn test_unread() {
        let mut payload = PendingTimedPayload::new(1024);
        payload.add_keys(1, &[1]).unwrap();
        payload.add_keys(2, &[2]).unwrap();
        payload.next_ready();
        payload.next_ready();
        payload.unread();
        assert_eq!(payload.peek_timestamp(), Some(2));
    }

    #[test]
    fn test_sizes_are_invalidated() {
        let mut payload = PendingTimedPayload::new(100);
        assert_eq!(payload.required_sdram(), (2, 2));

        payload.add_keys(1, &[1, 2, 3]).unwrap();
        assert_eq!(payload.required_sdram(), (6 + 12 + 2, 6 + 12 + 2));

        payload.add_keys(2, &[0; 61]).unwrap();
        let total = 20 + 6 + 244;
        assert_eq!(payload.total_region_size_bytes(), total);
        assert_eq!(payload.buffer_size_bytes(), 100);

        payload.clear();
        assert_eq!(payload.required_sdram(), (2, 2));
    }

    #[test]
    fn test_messages() {
        let entry = TimedKeys { timestamp: 1, keys: (0..130).collect() };
        let sizes = entry.messages().map(|m| m.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![61, 61, 8]);
    }
}
