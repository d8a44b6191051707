//! Hardware bus through `/dev/mem`
//!
//! Two physical windows are mapped from `/dev/mem` (opened `O_SYNC`, so the
//! mappings are uncached):
//!
//! - the I/O window at `0x1000_0000` holding the SIF and DMAC registers
//! - a DMA window reserved from the kernel (`mem=` boot argument), carved
//!   into pages for channel buffers and RPC receive pages
//!
//! Because the DMA window is uncached, write-back and invalidate are plain
//! copies between the staging buffer and the window.
//!
//! The SIF0 completion interrupt belongs to the kernel. Whatever receives
//! it (a UIO read loop, a polling thread) calls [`MmioBus::raise_sif0`].

// Physical addresses are 32-bit on this machine; casts below are between
// u32 addresses and usize offsets inside windows of at most a few MiB.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cast_possible_wrap)]

use crate::backend::{BusType, IrqHandler, SifBus};
use crate::backends::PageMap;
use crate::config::MmioConfig;
use crate::error::{Result, SifError};
use parking_lot::{Mutex, RwLock};
use rustix::fs::OFlags;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use sif_chip::frame::PAGE_SIZE;
use sif_chip::regs::{in_io_window, IO_WINDOW_BASE, IO_WINDOW_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::ptr::NonNull;

/// One physical window mapped from `/dev/mem`
struct PhysWindow {
    ptr: NonNull<u8>,
    base: u32,
    size: usize,
}

impl std::fmt::Debug for PhysWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysWindow")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .finish()
    }
}

// SAFETY: Send - the window owns its mapping exclusively; moving it between
// threads doesn't invalidate the mapping (mmap'd memory is process-wide).
unsafe impl Send for PhysWindow {}

// SAFETY: Sync - every access is bounds-checked and volatile or a byte copy
// into caller-owned memory; callers serialize access to any one DMA page.
unsafe impl Sync for PhysWindow {}

impl PhysWindow {
    fn map(mem: &File, base: u32, size: usize) -> Result<Self> {
        if size == 0 || base as usize % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(SifError::invalid_argument(format!(
                "window {base:#x}+{size:#x} is not page aligned"
            )));
        }

        // SAFETY: mmap necessary for MMIO - maps a physical range into the process.
        // Invariants: (1) mem is an open /dev/mem fd; (2) size non-zero and page aligned,
        // base page aligned (checked above); (3) MAP_SHARED so writes reach the device;
        // (4) ptr valid for size bytes or Err. The mapping is released in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                mem.as_fd(),
                u64::from(base),
            )
        }
        .map_err(std::io::Error::from)?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| SifError::io(format!("mmap of {base:#x} returned null")))?;

        tracing::debug!("Mapped physical {base:#x}+{size:#x} at {ptr:p}");
        Ok(Self { ptr, base, size })
    }

    fn offset_of(&self, phys: u32, len: usize) -> usize {
        let offset = phys.wrapping_sub(self.base) as usize;
        assert!(
            phys >= self.base && offset + len <= self.size,
            "Physical range {phys:#x}+{len:#x} outside window {:#x}+{:#x}",
            self.base,
            self.size
        );
        offset
    }

    fn read32(&self, phys: u32) -> u32 {
        let offset = self.offset_of(phys, 4);
        // SAFETY: read_volatile necessary for MMIO - hardware can change value.
        // Invariants: (1) ptr from mmap in map(), valid for self.size; (2) offset+4 <= size;
        // (3) register addresses are 4-byte aligned.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u32>()) }
    }

    fn write32(&self, phys: u32, value: u32) {
        let offset = self.offset_of(phys, 4);
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side effects.
        // Invariants: (1) ptr from mmap; (2) offset+4 <= size; (3) u32 aligned.
        unsafe {
            std::ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u32>(), value);
        }
    }

    fn copy_in(&self, phys: u32, data: &[u8]) {
        let offset = self.offset_of(phys, data.len());
        // SAFETY: copy_nonoverlapping into the mapping.
        // Invariants: (1) offset+len <= size (checked); (2) data is a caller slice, never
        // inside the mapping; (3) u8 alignment is 1.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    fn copy_out(&self, phys: u32, data: &mut [u8]) {
        let offset = self.offset_of(phys, data.len());
        // SAFETY: copy_nonoverlapping out of the mapping; same invariants as copy_in.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), data.as_mut_ptr(), data.len());
        }
    }
}

impl Drop for PhysWindow {
    fn drop(&mut self) {
        // SAFETY: munmap necessary - must unmap region before process ends.
        // Invariants: (1) ptr/size from mmap in map(); (2) Drop runs at most once.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
        tracing::debug!("Unmapped physical {:#x}", self.base);
    }
}

/// SIF bus on real hardware
pub struct MmioBus {
    _mem: File,
    io: PhysWindow,
    dma: PhysWindow,
    pages: Mutex<PageMap>,
    irq: RwLock<Option<IrqHandler>>,
}

impl std::fmt::Debug for MmioBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioBus")
            .field("io", &self.io)
            .field("dma", &self.dma)
            .field("mapped_pages", &self.pages.lock().mapped_pages())
            .finish_non_exhaustive()
    }
}

impl MmioBus {
    /// Map the I/O and DMA windows
    ///
    /// # Errors
    ///
    /// Returns `Os` if the memory device cannot be opened or mapped (usually
    /// missing privileges), `InvalidArgument` for a misaligned DMA window.
    pub fn open(config: &MmioConfig) -> Result<Self> {
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlags::SYNC.bits() as i32)
            .open(&config.mem_path)?;

        let io = PhysWindow::map(&mem, IO_WINDOW_BASE, IO_WINDOW_SIZE)?;
        let dma = PhysWindow::map(&mem, config.dma_window_base, config.dma_window_size)?;

        tracing::info!(
            "SIF MMIO ready: {} DMA pages at {:#x}",
            config.dma_window_size / PAGE_SIZE,
            config.dma_window_base
        );

        Ok(Self {
            _mem: mem,
            io,
            pages: Mutex::new(PageMap::new(
                config.dma_window_base,
                config.dma_window_size / PAGE_SIZE,
            )),
            dma,
            irq: RwLock::new(None),
        })
    }

    /// Run the SIF0 completion hook, if installed
    pub fn raise_sif0(&self) {
        let handler = self.irq.read().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// DMA pages currently handed out
    pub fn mapped_pages(&self) -> usize {
        self.pages.lock().mapped_pages()
    }
}

impl SifBus for MmioBus {
    fn read32(&self, reg: u32) -> u32 {
        assert!(in_io_window(reg), "Register {reg:#x} outside the I/O window");
        self.io.read32(reg)
    }

    fn write32(&self, reg: u32, value: u32) {
        assert!(in_io_window(reg), "Register {reg:#x} outside the I/O window");
        self.io.write32(reg, value);
    }

    fn map_dma(&self, size: usize) -> Result<u32> {
        self.pages.lock().alloc(size)
    }

    fn unmap_dma(&self, phys: u32) {
        if !self.pages.lock().free(phys) {
            tracing::warn!("Unmap of unknown DMA page {phys:#x}");
        }
    }

    fn cache_writeback(&self, phys: u32, data: &[u8]) {
        self.dma.copy_in(phys, data);
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    fn cache_invalidate(&self, phys: u32, data: &mut [u8]) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        self.dma.copy_out(phys, data);
    }

    fn set_irq_handler(&self, handler: Option<IrqHandler>) {
        *self.irq.write() = handler;
    }

    fn bus_type(&self) -> BusType {
        BusType::Mmio
    }
}
