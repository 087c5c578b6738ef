//! The end-of-run snapshot a core writes about its recording regions.
//!
//! ```ascii
//! u32 n_regions
//! u32 last sequence number received on the continuous path
//! n × u32 region data base address
//! n × u32 recorded size (bits 0..30) | missing flag (bit 31)
//! n × channel state (24 bytes):
//!     u32 start, u32 current_write, u32 current_dma_write, u32 current_read, u32 end,
//!     u8 region_id, u8 missing, u8 last_operation (0 = read), u8 padding
//! ```
//!
//! All numbers are little-endian.

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};
use transport::core_location::CoreLocation;
use transport::safe_converter::SafeCast;
use crate::region_state::{BufferedRegionState, LastOperation};

pub const HEADER_BYTES: usize = 8;
pub const REGION_RECORD_BYTES: usize = 8;
pub const CHANNEL_STATE_BYTES: usize = 24;

const MISSING_FLAG: u32 = 0x8000_0000;
const SIZE_MASK: u32 = !MISSING_FLAG;

pub fn snapshot_len(n_regions: usize) -> usize {
    HEADER_BYTES + n_regions * (REGION_RECORD_BYTES + CHANNEL_STATE_BYTES)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RegionRecord {
    pub base_address: u32,
    pub size: u32,
    pub missing: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChannelState {
    pub start_address: u32,
    pub current_write: u32,
    pub current_dma_write: u32,
    pub current_read: u32,
    pub end_address: u32,
    pub region_id: u8,
    pub missing: bool,
    pub last_operation: LastOperation,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceSnapshot {
    pub last_sequence: u32,
    pub regions: Vec<RegionRecord>,
    pub channels: Vec<ChannelState>,
}

impl DeviceSnapshot {
    pub fn parse(raw: &[u8]) -> anyhow::Result<DeviceSnapshot> {
        if raw.len() < HEADER_BYTES {
            bail!("snapshot of {} bytes is shorter than its header", raw.len());
        }
        let mut buf = raw;
        let n_regions: usize = buf.get_u32_le().safe_cast();
        let last_sequence = buf.get_u32_le();

        // NB: checked before allocating, a corrupt count must not cause a huge allocation
        if n_regions > raw.len() || raw.len() != snapshot_len(n_regions) {
            bail!("snapshot of {} bytes is inconsistent with its region count {}", raw.len(), n_regions);
        }

        let base_addresses = (0..n_regions).map(|_| buf.get_u32_le()).collect::<Vec<_>>();
        let regions = base_addresses.into_iter()
            .map(|base_address| {
                let size_word = buf.get_u32_le();
                RegionRecord {
                    base_address,
                    size: size_word & SIZE_MASK,
                    missing: size_word & MISSING_FLAG != 0,
                }
            })
            .collect();

        let channels = (0..n_regions)
            .map(|_| {
                let state = ChannelState {
                    start_address: buf.get_u32_le(),
                    current_write: buf.get_u32_le(),
                    current_dma_write: buf.get_u32_le(),
                    current_read: buf.get_u32_le(),
                    end_address: buf.get_u32_le(),
                    region_id: buf.get_u8(),
                    missing: buf.get_u8() != 0,
                    last_operation: LastOperation::from(buf.get_u8()),
                };
                buf.advance(1);
                state
            })
            .collect();

        Ok(DeviceSnapshot { last_sequence, regions, channels })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(snapshot_len(self.regions.len()));
        buf.put_u32_le(self.regions.len() as u32);
        buf.put_u32_le(self.last_sequence);
        for r in &self.regions {
            buf.put_u32_le(r.base_address);
        }
        for r in &self.regions {
            let flag = if r.missing { MISSING_FLAG } else { 0 };
            buf.put_u32_le((r.size & SIZE_MASK) | flag);
        }
        for c in &self.channels {
            buf.put_u32_le(c.start_address);
            buf.put_u32_le(c.current_write);
            buf.put_u32_le(c.current_dma_write);
            buf.put_u32_le(c.current_read);
            buf.put_u32_le(c.end_address);
            buf.put_u8(c.region_id);
            buf.put_u8(c.missing as u8);
            buf.put_u8(c.last_operation.into());
            buf.put_u8(0);
        }
        buf.to_vec()
    }
}

/// Turns a core's raw snapshot into region states. Missing data is reported as a warning since
///  the data that was recorded is still valid; buffer pointers outside of their buffer are an
///  error.
pub fn ingest_device_snapshot(core: CoreLocation, raw: &[u8]) -> anyhow::Result<Vec<BufferedRegionState>> {
    let snapshot = DeviceSnapshot::parse(raw)?;
    debug!("snapshot of {}: {} regions, last sequence number {}", core, snapshot.regions.len(), snapshot.last_sequence);

    let result: Vec<BufferedRegionState> = snapshot.regions.iter()
        .zip(snapshot.channels.iter())
        .map(|(region, channel)| {
            let missing = region.missing || channel.missing;
            if missing {
                warn!("{} region {}: the device dropped recorded data", core, channel.region_id);
            }
            BufferedRegionState {
                core,
                region_id: channel.region_id,
                start_address: channel.start_address,
                end_address: channel.end_address,
                current_write: channel.current_write,
                current_dma_write: channel.current_dma_write,
                current_read: channel.current_read,
                last_operation: channel.last_operation,
                missing,
                base_address: region.base_address,
                recorded_size: region.size,
            }
        })
        .collect();

    for state in &result {
        state.check_pointers()?;
    }
    Ok(result)
}
