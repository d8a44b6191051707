//! DMA buffers and the two SIF channels
//!
//! ```text
//! main RAM                                   IOP RAM
//! ┌──────────────┐   SIF1 (send, tagged)    ┌──────────────┐
//! │ sif1 buffer  │ ───────────────────────▶ │ cmd buffer   │
//! └──────────────┘                          └──────────────┘
//! ┌──────────────┐   SIF0 (receive, chain)  ┌──────────────┐
//! │ sif0 buffer  │ ◀─────────────────────── │ IOP sender   │
//! └──────────────┘                          └──────────────┘
//! ```
//!
//! Every SIF1 transfer is `tag ‖ [header] ‖ payload ‖ padding`, padded to a
//! quadword. The tag tells the IOP where to put the bytes and how many 32-bit
//! words follow; QWC tells the DMAC how many quadwords to move, tag included.

// Register values and DMA lengths are 32-bit on this bus; sizes are
// bounded by the page-size buffers before any narrowing.
#![allow(clippy::cast_possible_truncation)]

use crate::backend::SifBus;
use crate::clock::{millis, poll_until, Clock};
use crate::config::DmaTiming;
use crate::error::{Result, SifError};
use crate::flags::Chcr;
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use sif_chip::frame::{dma_align, CMD_PACKET_MAX, DMA_TAG_SIZE, DMA_TRUNIT, MAX_QWC, PAGE_SIZE, TAG_ADDR_BITS};
use sif_chip::regs::{self, chcr};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, trace};

/// Page-granular DMA buffer
///
/// The CPU works on a staging copy; [`DmaBuffer::writeback`] and
/// [`DmaBuffer::invalidate`] move bytes across to the device-visible side.
/// The mapping is returned to the bus on drop.
pub struct DmaBuffer {
    bytes: Box<[u8]>,
    phys: u32,
    bus: Arc<dyn SifBus>,
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("size", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

impl DmaBuffer {
    /// Allocate a buffer of at least `size` bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero size and `ResourceExhausted` if
    /// the bus has no DMA memory left.
    pub fn alloc(bus: &Arc<dyn SifBus>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SifError::invalid_argument("DMA buffer size must be non-zero"));
        }
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let phys = bus.map_dma(size)?;

        debug!("Allocated DMA buffer: phys={phys:#x}, size={size:#x}");

        Ok(Self {
            bytes: vec![0u8; size].into_boxed_slice(),
            phys,
            bus: Arc::clone(bus),
        })
    }

    /// Get slice view of buffer
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Get mutable slice view of buffer
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Physical (device-visible) address
    pub const fn phys(&self) -> u32 {
        self.phys
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Publish `range` of the staging copy to the device
    ///
    /// # Panics
    ///
    /// Panics if `range` exceeds the buffer.
    pub fn writeback(&self, range: Range<usize>) {
        let phys = self.phys + range.start as u32;
        self.bus.cache_writeback(phys, &self.bytes[range]);
    }

    /// Refresh `range` of the staging copy from the device
    ///
    /// # Panics
    ///
    /// Panics if `range` exceeds the buffer.
    pub fn invalidate(&mut self, range: Range<usize>) {
        let phys = self.phys + range.start as u32;
        self.bus.cache_invalidate(phys, &mut self.bytes[range]);
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.bus.unmap_dma(self.phys);
        debug!("Freed DMA buffer at phys={:#x}", self.phys);
    }
}

/// Bytes to 32-bit word count.
///
/// # Errors
///
/// Returns `InvalidArgument` unless `nbytes` is a multiple of 4.
pub fn nbytes_to_wc(nbytes: usize) -> Result<u32> {
    if nbytes % 4 != 0 {
        return Err(SifError::invalid_argument(format!(
            "word count: {nbytes} bytes is not a multiple of 4"
        )));
    }
    u32::try_from(nbytes / 4)
        .map_err(|_| SifError::invalid_argument(format!("word count: {nbytes} bytes too large")))
}

/// Bytes to 128-bit quadword count.
///
/// # Errors
///
/// Returns `InvalidArgument` unless `nbytes` is a multiple of 16 and the
/// result fits the 16-bit QWC field.
pub fn nbytes_to_qwc(nbytes: usize) -> Result<u32> {
    if nbytes % DMA_TRUNIT != 0 {
        return Err(SifError::invalid_argument(format!(
            "quadword count: {nbytes} bytes is not a multiple of {DMA_TRUNIT}"
        )));
    }
    let qwc = nbytes / DMA_TRUNIT;
    if qwc > MAX_QWC {
        return Err(SifError::invalid_argument(format!(
            "quadword count: {qwc} exceeds the 16-bit QWC field"
        )));
    }
    Ok(qwc as u32)
}

/// IOP DMA tag prefixed to every SIF1 transfer
///
/// Wire layout (little-endian):
///
/// ```text
/// word 0   addr[23:0] | int_0 << 30 | ert << 31
/// word 1   payload length in 32-bit words
/// word 2-3 zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTag {
    /// IOP destination address
    pub addr: u32,
    /// Raise an IOP interrupt when the transfer lands
    pub int_0: bool,
    /// End of transfer
    pub ert: bool,
    /// Payload length in 32-bit words (tag excluded)
    pub wc: u32,
}

const TAG_ADDR_MASK: u32 = (1 << TAG_ADDR_BITS) - 1;
const TAG_INT_0: u32 = 1 << 30;
const TAG_ERT: u32 = 1 << 31;

impl TransferTag {
    /// Tag for `payload_bytes` (already quadword aligned) bound for `dst`
    ///
    /// Interrupting transfers set both `ert` and `int_0`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `dst` does not fit 24 bits or the length
    /// is not quadword aligned and representable.
    pub fn new(dst: u32, payload_bytes: usize, interrupt: bool) -> Result<Self> {
        if dst & !TAG_ADDR_MASK != 0 {
            return Err(SifError::invalid_argument(format!(
                "IOP address {dst:#x} does not fit the 24-bit tag field"
            )));
        }
        nbytes_to_qwc(payload_bytes)?;
        Ok(Self {
            addr: dst,
            int_0: interrupt,
            ert: interrupt,
            wc: nbytes_to_wc(payload_bytes)?,
        })
    }

    /// Payload length in bytes
    pub const fn payload_len(&self) -> usize {
        self.wc as usize * 4
    }

    /// Payload length in quadwords
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the word count is not quadword aligned.
    pub fn qwc(&self) -> Result<u32> {
        nbytes_to_qwc(self.payload_len())
    }

    /// Serialize to the 16-byte wire form
    pub fn encode(&self) -> [u8; DMA_TAG_SIZE] {
        let mut word0 = self.addr & TAG_ADDR_MASK;
        if self.int_0 {
            word0 |= TAG_INT_0;
        }
        if self.ert {
            word0 |= TAG_ERT;
        }

        let mut out = [0u8; DMA_TAG_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(word0);
        buf.put_u32_le(self.wc);
        buf.put_u64_le(0);
        out
    }

    /// Parse the 16-byte wire form
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if fewer than 16 bytes are given.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DMA_TAG_SIZE {
            return Err(SifError::protocol_violation(format!(
                "DMA tag truncated: {} bytes",
                bytes.len()
            )));
        }
        let word0 = bytes.get_u32_le();
        let wc = bytes.get_u32_le();
        Ok(Self {
            addr: word0 & TAG_ADDR_MASK,
            int_0: word0 & TAG_INT_0 != 0,
            ert: word0 & TAG_ERT != 0,
            wc,
        })
    }
}

/// The two SIF DMA channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// IOP → main
    Sif0,
    /// main → IOP
    Sif1,
}

impl Channel {
    /// Channel control register
    pub const fn chcr(self) -> u32 {
        match self {
            Self::Sif0 => regs::DMAC_SIF0_CHCR,
            Self::Sif1 => regs::DMAC_SIF1_CHCR,
        }
    }

    /// Memory address register
    pub const fn madr(self) -> u32 {
        match self {
            Self::Sif0 => regs::DMAC_SIF0_MADR,
            Self::Sif1 => regs::DMAC_SIF1_MADR,
        }
    }

    /// Quadword count register
    pub const fn qwc(self) -> u32 {
        match self {
            Self::Sif0 => regs::DMAC_SIF0_QWC,
            Self::Sif1 => regs::DMAC_SIF1_QWC,
        }
    }
}

/// Stop both channels. Safe to call before any buffer exists.
pub fn disable_channels(bus: &dyn SifBus) {
    bus.write32(regs::DMAC_SIF0_CHCR, chcr::STOP);
    bus.write32(regs::DMAC_SIF0_MADR, 0);
    bus.write32(regs::DMAC_SIF0_QWC, 0);
    let _ = bus.read32(regs::DMAC_SIF0_QWC);

    bus.write32(regs::DMAC_SIF1_CHCR, chcr::STOP);
}

/// Owner of both channel buffers and the only writer of the channel registers
#[derive(Debug)]
pub struct ChannelManager {
    bus: Arc<dyn SifBus>,
    clock: Arc<dyn Clock>,
    timing: DmaTiming,
    sif0_phys: u32,
    sif0: Mutex<DmaBuffer>,
    sif1: Mutex<DmaBuffer>,
}

impl ChannelManager {
    /// Allocate one page per direction
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` if either page cannot be mapped; a page
    /// already mapped is released again.
    pub fn new(bus: Arc<dyn SifBus>, clock: Arc<dyn Clock>, timing: DmaTiming) -> Result<Self> {
        let sif0 = DmaBuffer::alloc(&bus, PAGE_SIZE)?;
        let sif1 = DmaBuffer::alloc(&bus, PAGE_SIZE)?;

        debug!(
            "SIF buffers: sif0={:#x}, sif1={:#x}",
            sif0.phys(),
            sif1.phys()
        );

        Ok(Self {
            bus,
            clock,
            timing,
            sif0_phys: sif0.phys(),
            sif0: Mutex::new(sif0),
            sif1: Mutex::new(sif1),
        })
    }

    /// Physical address of the inbound buffer (the "main address")
    pub const fn sif0_phys(&self) -> u32 {
        self.sif0_phys
    }

    /// Whether the channel's start bit is still set
    pub fn busy(&self, channel: Channel) -> bool {
        Chcr::from_bits_retain(self.bus.read32(channel.chcr())).busy()
    }

    /// Spin until SIF1 is idle or the budget runs out.
    ///
    /// This can run on the inbound dispatch path (a server-side bind reply),
    /// so it spins instead of blocking on an event.
    pub fn sif1_ready(&self) -> bool {
        poll_until(
            self.clock.as_ref(),
            self.timing.ready_timeout,
            self.timing.poll_interval,
            || !self.busy(Channel::Sif1),
        )
    }

    /// Send `header ‖ payload` to IOP address `dst`
    ///
    /// `interrupt` marks the transfer as a command the IOP must act on.
    /// An empty transfer is a successful no-op.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the framed transfer exceeds the buffer or `dst`
    ///   does not fit the tag
    /// - `Busy` if SIF1 does not become ready in time
    pub fn transmit(
        &self,
        header: Option<&[u8]>,
        dst: u32,
        payload: &[u8],
        interrupt: bool,
    ) -> Result<()> {
        let header = header.unwrap_or(&[]);
        let aligned_size = dma_align(header.len() + payload.len());
        if aligned_size == 0 {
            return Ok(());
        }

        let tag = TransferTag::new(dst, aligned_size, interrupt)?;
        let dma_nbytes = DMA_TAG_SIZE + aligned_size;

        let mut buffer = self.sif1.lock();
        if dma_nbytes > buffer.size() {
            return Err(SifError::invalid_argument(format!(
                "SIF1 transfer of {dma_nbytes} bytes exceeds the {} byte buffer",
                buffer.size()
            )));
        }
        let qwc = nbytes_to_qwc(dma_nbytes)?;

        if !self.sif1_ready() {
            return Err(SifError::Busy {
                what: "SIF1 channel",
                duration_ms: millis(self.timing.ready_timeout),
            });
        }

        let slice = buffer.as_mut_slice();
        let body = DMA_TAG_SIZE + header.len();
        slice[..DMA_TAG_SIZE].copy_from_slice(&tag.encode());
        slice[DMA_TAG_SIZE..body].copy_from_slice(header);
        slice[body..body + payload.len()].copy_from_slice(payload);
        slice[body + payload.len()..dma_nbytes].fill(0);

        buffer.writeback(0..dma_nbytes);

        let madr = buffer.phys();
        self.bus.write32(regs::DMAC_SIF1_MADR, madr);
        self.bus.write32(regs::DMAC_SIF1_QWC, qwc);
        trace!("SIF1 tag: {tag:?}");
        debug!("SIF1 transfer: madr={madr:#x}, qwc={qwc}, dst={dst:#x}, interrupt={interrupt}");
        self.bus.write32(regs::DMAC_SIF1_CHCR, chcr::SENDN_TIE);

        Ok(())
    }

    /// Re-arm SIF0 for the next inbound packet
    pub fn sif0_reset(&self) {
        self.bus.write32(regs::DMAC_SIF0_QWC, 0);
        self.bus.write32(regs::DMAC_SIF0_MADR, 0);
        self.bus.write32(regs::DMAC_SIF0_CHCR, chcr::RECVC_TIE);
    }

    /// Copy the inbound packet out of the SIF0 buffer and re-arm the channel
    ///
    /// Returns `None` if SIF0 is still busy (the completion was not ours).
    pub fn receive_frame(&self) -> Option<[u8; CMD_PACKET_MAX]> {
        if self.busy(Channel::Sif0) {
            return None;
        }

        let mut buffer = self.sif0.lock();
        buffer.invalidate(0..CMD_PACKET_MAX);
        let mut frame = [0u8; CMD_PACKET_MAX];
        frame.copy_from_slice(&buffer.as_slice()[..CMD_PACKET_MAX]);

        self.sif0_reset();
        Some(frame)
    }

    /// Stop both channels
    pub fn disable(&self) {
        disable_channels(self.bus.as_ref());
    }
}
