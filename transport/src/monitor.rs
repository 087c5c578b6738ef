use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Buf;
use anyhow::bail;
use crate::frame::WORD_LEN;

/// A router timeout as the hardware stores it: an 8 bit float with the mantissa in the low
///  nibble and the exponent in the high nibble.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct RouterTimeout {
    pub mantissa: u8,
    pub exponent: u8,
}

impl RouterTimeout {
    /// for bulk streaming: wait long before dropping a packet
    pub const LONG: RouterTimeout = RouterTimeout::new(14, 14);
    pub const SHORT: RouterTimeout = RouterTimeout::new(1, 1);
    /// intermediate value while switching back
    pub const TEMP: RouterTimeout = RouterTimeout::new(15, 4);
    pub const ZERO: RouterTimeout = RouterTimeout::new(0, 0);

    pub const fn new(mantissa: u8, exponent: u8) -> RouterTimeout {
        RouterTimeout { mantissa, exponent }
    }

    pub fn from_byte(value: u8) -> RouterTimeout {
        RouterTimeout {
            mantissa: value & 0xf,
            exponent: value >> 4,
        }
    }

    pub fn to_byte(&self) -> u8 {
        (self.exponent << 4) | (self.mantissa & 0xf)
    }

    /// The timeout in router clock cycles
    pub fn cycles(&self) -> u32 {
        let mantissa = self.mantissa as u32 + 16;
        let exponent = self.exponent as u32;
        if exponent <= 4 {
            (mantissa - (1 << (4 - exponent))) << exponent
        }
        else {
            mantissa << exponent
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RouterWait {
    Wait1,
    Wait2,
}

bitflags! {
    /// The kinds of dropped packets that a monitor reinjects
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
    pub struct ReinjectionFlags: u32 {
        const MULTICAST = 1;
        const POINT_TO_POINT = 2;
        const NEAREST_NEIGHBOUR = 4;
        const FIXED_ROUTE = 8;
    }
}

/// Status report of a monitor's dropped packet reinjection
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReinjectionStatus {
    pub wait1_timeout: RouterTimeout,
    pub wait2_timeout: RouterTimeout,
    pub n_dropped_packets: u32,
    pub n_missed_dropped_packets: u32,
    pub n_dropped_packet_overflows: u32,
    pub n_reinjected_packets: u32,
    pub n_link_dumps: u32,
    pub n_processor_dumps: u32,
    pub flags: ReinjectionFlags,
    pub link_proc_bits: u32,
}

impl ReinjectionStatus {
    pub const SERIALIZED_LEN: usize = 10 * WORD_LEN;

    pub fn parse(mut buf: impl Buf) -> anyhow::Result<ReinjectionStatus> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("reinjection status of {} bytes, expected {}", buf.remaining(), Self::SERIALIZED_LEN);
        }

        Ok(ReinjectionStatus {
            wait1_timeout: RouterTimeout::from_byte(buf.get_u32_le() as u8),
            wait2_timeout: RouterTimeout::from_byte(buf.get_u32_le() as u8),
            n_dropped_packets: buf.get_u32_le(),
            n_missed_dropped_packets: buf.get_u32_le(),
            n_dropped_packet_overflows: buf.get_u32_le(),
            n_reinjected_packets: buf.get_u32_le(),
            n_link_dumps: buf.get_u32_le(),
            n_processor_dumps: buf.get_u32_le(),
            flags: ReinjectionFlags::from_bits_truncate(buf.get_u32_le()),
            link_proc_bits: buf.get_u32_le(),
        })
    }
}

/// The router / reinjection controls that the extra monitor cores expose. Bulk streaming needs
///  long router timeouts and no reinjection traffic competing for the fabric, and the previous
///  settings must be restored afterwards.
#[async_trait]
pub trait ReinjectionControllable: Send + Sync + 'static {
    async fn set_router_timeout(&self, wait: RouterWait, timeout: RouterTimeout) -> anyhow::Result<()>;

    async fn set_reinjection(&self, flags: ReinjectionFlags) -> anyhow::Result<()>;

    async fn clear_reinjection_queue(&self) -> anyhow::Result<()>;

    /// switches the routers to the application's multicast routes
    async fn install_application_routes(&self) -> anyhow::Result<()>;

    /// switches the routers to the routes needed for data streaming to and from the monitors
    async fn install_system_routes(&self) -> anyhow::Result<()>;

    async fn reinjection_status(&self) -> anyhow::Result<ReinjectionStatus>;
}
