//! Bus implementations
//!
//! - **Mmio**: SIF registers and a reserved DMA window through `/dev/mem`
//! - **Software**: a simulated IOP answering the protocol in-process

pub mod mmio;
pub mod software;

pub use mmio::MmioBus;
pub use software::{ServiceFn, SoftwareIop, TransferRecord};

use crate::error::{Result, SifError};
use sif_chip::frame::PAGE_SIZE;
use std::collections::BTreeMap;

/// First-fit page allocator over a physical window
#[derive(Debug)]
pub(crate) struct PageMap {
    base: u32,
    used: Vec<bool>,
    runs: BTreeMap<u32, usize>,
}

impl PageMap {
    pub(crate) fn new(base: u32, pages: usize) -> Self {
        Self {
            base,
            used: vec![false; pages],
            runs: BTreeMap::new(),
        }
    }

    /// Reserve enough whole pages for `size` bytes
    pub(crate) fn alloc(&mut self, size: usize) -> Result<u32> {
        let pages = size.div_ceil(PAGE_SIZE).max(1);
        let first = self
            .used
            .windows(pages)
            .position(|w| w.iter().all(|used| !used))
            .ok_or_else(|| {
                SifError::resource_exhausted(format!(
                    "no {pages} free DMA pages ({} of {} in use)",
                    self.mapped_pages(),
                    self.used.len()
                ))
            })?;

        self.used[first..first + pages].fill(true);
        let phys = self.phys_of(first)?;
        self.runs.insert(phys, pages);
        Ok(phys)
    }

    /// Release the run starting at `phys`; `false` if none starts there
    pub(crate) fn free(&mut self, phys: u32) -> bool {
        let Some(pages) = self.runs.remove(&phys) else {
            return false;
        };
        let first = (phys - self.base) as usize / PAGE_SIZE;
        self.used[first..first + pages].fill(false);
        true
    }

    /// Pages currently reserved
    pub(crate) fn mapped_pages(&self) -> usize {
        self.used.iter().filter(|&&u| u).count()
    }

    /// Allocated run containing `phys`, as `(run base, run bytes)`
    pub(crate) fn run_containing(&self, phys: u32) -> Option<(u32, usize)> {
        let (&base, &pages) = self.runs.range(..=phys).next_back()?;
        let len = pages * PAGE_SIZE;
        (((phys - base) as usize) < len).then_some((base, len))
    }

    fn phys_of(&self, page: usize) -> Result<u32> {
        u32::try_from(page * PAGE_SIZE)
            .ok()
            .and_then(|off| self.base.checked_add(off))
            .ok_or_else(|| SifError::resource_exhausted("DMA window exceeds 32-bit addresses"))
    }
}
