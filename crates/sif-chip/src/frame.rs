//! Framing constants for the two DMA channels.
//!
//! ```text
//! SIF1 transfer:  ┌──────────┬──────────────┬───────────────┬─────────┐
//!                 │ DMA tag  │ cmd header   │ inline packet │ padding │
//!                 │ 16 bytes │ 16 bytes     │ 0..=112 bytes │ to 16   │
//!                 └──────────┴──────────────┴───────────────┴─────────┘
//! ```
//!
//! Bulk payloads travel as a separate tag-prefixed transfer without a
//! command header, addressed to the destination the command refers to.

/// DMA transfer unit (one quadword).
pub const DMA_TRUNIT: usize = 16;
/// Size of the IOP DMA tag prefixed to every SIF1 transfer.
pub const DMA_TAG_SIZE: usize = 16;
/// Largest quadword count the 16-bit QWC field holds.
pub const MAX_QWC: usize = 0xFFFF;
/// Bits available for an IOP destination address in the DMA tag.
pub const TAG_ADDR_BITS: u32 = 24;

/// Command header size.
pub const CMD_HEADER_SIZE: usize = 16;
/// Largest command packet (header + inline data).
pub const CMD_PACKET_MAX: usize = 128;
/// Largest inline payload.
pub const CMD_PACKET_DATA_MAX: usize = CMD_PACKET_MAX - CMD_HEADER_SIZE;
/// Bits available for `data_size` in the command header.
pub const DATA_SIZE_BITS: u32 = 24;

/// Size of each channel buffer (one page).
pub const PAGE_SIZE: usize = 4096;

/// Reset argument capacity, NUL terminator included.
pub const RESET_ARG_MAX: usize = 80;
/// Default boot arguments passed with the reset command.
pub const DEFAULT_RESET_ARGS: &str = "rom0:UDNL rom0:OSDCNF";

/// Round `nbytes` up to the DMA transfer unit.
#[must_use]
pub const fn dma_align(nbytes: usize) -> usize {
    (nbytes + (DMA_TRUNIT - 1)) & !(DMA_TRUNIT - 1)
}
