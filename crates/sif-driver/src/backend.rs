//! Bus abstraction for the SIF
//!
//! Everything the driver needs from the platform goes through [`SifBus`]:
//! 32-bit register access, physically addressed DMA memory with explicit
//! cache maintenance, and the hook the SIF0 completion interrupt fires.

use crate::config::MmioConfig;
use crate::error::Result;
use std::fmt::Debug;
use std::sync::Arc;

/// Callback run when the SIF0 (IOP → main) channel completes a transfer.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Platform interface consumed by the driver.
///
/// Addresses are main-processor physical addresses. DMA memory is modelled
/// as a device-visible region per mapping plus a CPU-side staging copy owned
/// by [`crate::DmaBuffer`]; `cache_writeback` publishes staged bytes to the
/// device and `cache_invalidate` refreshes staged bytes from it.
pub trait SifBus: Debug + Send + Sync {
    /// Read a 32-bit register
    fn read32(&self, reg: u32) -> u32;

    /// Write a 32-bit register
    fn write32(&self, reg: u32, value: u32);

    /// Reserve `size` bytes (page granular) of DMA-capable memory
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` if no memory is available.
    fn map_dma(&self, size: usize) -> Result<u32>;

    /// Release a mapping returned by [`SifBus::map_dma`]
    fn unmap_dma(&self, phys: u32);

    /// Make `data` visible to the device at `phys`
    fn cache_writeback(&self, phys: u32, data: &[u8]);

    /// Fill `data` with what the device last wrote at `phys`
    fn cache_invalidate(&self, phys: u32, data: &mut [u8]);

    /// Install or remove the SIF0 completion hook
    fn set_irq_handler(&self, handler: Option<IrqHandler>);

    /// Get bus type for debugging
    fn bus_type(&self) -> BusType;
}

/// Bus type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    /// Physical registers and DMA window through `/dev/mem`
    Mmio,

    /// Simulated IOP, no hardware required
    Software,
}

impl std::fmt::Display for BusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mmio => write!(f, "MMIO (/dev/mem)"),
            Self::Software => write!(f, "Software (simulated IOP)"),
        }
    }
}

/// Bus selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSelection {
    /// Real hardware through `/dev/mem`
    Mmio,

    /// Simulated IOP with its default services
    Software,
}

/// Open the requested bus
///
/// # Errors
///
/// Returns error if the hardware bus cannot be mapped.
pub fn open_bus(selection: BusSelection, mmio: &MmioConfig) -> Result<Arc<dyn SifBus>> {
    use crate::backends::{MmioBus, SoftwareIop};

    match selection {
        BusSelection::Mmio => {
            let bus = MmioBus::open(mmio)?;
            tracing::info!("Using MMIO bus via {}", mmio.mem_path.display());
            Ok(Arc::new(bus))
        }
        BusSelection::Software => {
            tracing::info!("Using software IOP");
            Ok(Arc::new(SoftwareIop::standard()))
        }
    }
}
