use std::fmt::{Display, Formatter};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::core_location::{ChipLocation, CoreLocation};

/// What a diagnostic read of a core's state reports
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CoreState {
    pub core: CoreLocation,
    pub run_state: String,
    pub software_error_count: u16,
}

impl Display for CoreState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({} software errors)", self.core, self.run_state, self.software_error_count)
    }
}

/// Direct (slow, reliable) access to device memory through the machine's management protocol.
///  This is used for transfers below the size where streaming pays off, and for diagnostics.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeviceAccess: Send + Sync + 'static {
    async fn read_memory(&self, chip: ChipLocation, address: u32, length: u32) -> anyhow::Result<Bytes>;

    async fn write_memory(&self, chip: ChipLocation, address: u32, data: &[u8]) -> anyhow::Result<()>;

    async fn read_core_state(&self, core: CoreLocation) -> anyhow::Result<CoreState>;
}
