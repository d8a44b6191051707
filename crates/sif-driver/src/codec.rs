//! Outbound command packets
//!
//! A command is a 16-byte header followed by up to 112 inline bytes, sent as
//! one interrupting SIF1 transfer to the IOP's command buffer. Larger
//! payloads travel first as a separate bulk transfer; the header then names
//! their destination and size.

use crate::dma::ChannelManager;
use crate::error::{Result, SifError};
use bytes::{Buf, BufMut};
use sif_chip::frame::{CMD_HEADER_SIZE, CMD_PACKET_DATA_MAX, CMD_PACKET_MAX, DATA_SIZE_BITS};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

const DATA_SIZE_LIMIT: u32 = 1 << DATA_SIZE_BITS;

/// Command header
///
/// ```text
/// word 0   packet_size[7:0] | data_size[31:8]
/// word 1   dst
/// word 2   cmd_id
/// word 3   opt
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Header plus inline bytes
    pub packet_size: u8,
    /// Bulk payload size (24 bits)
    pub data_size: u32,
    /// Bulk payload destination, 0 if none
    pub dst: u32,
    /// Command id
    pub cmd_id: u32,
    /// Command-specific option word
    pub opt: u32,
}

impl CommandHeader {
    /// Header for a packet with `inline_len` inline bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the packet exceeds 128 bytes or the bulk
    /// size does not fit 24 bits.
    pub fn new(cmd_id: u32, opt: u32, inline_len: usize, bulk: Option<(u32, usize)>) -> Result<Self> {
        if inline_len > CMD_PACKET_DATA_MAX {
            return Err(SifError::invalid_argument(format!(
                "inline packet of {inline_len} bytes exceeds {CMD_PACKET_DATA_MAX}"
            )));
        }
        let (dst, data_size) = bulk.unwrap_or((0, 0));
        let data_size = u32::try_from(data_size)
            .ok()
            .filter(|&n| n < DATA_SIZE_LIMIT)
            .ok_or_else(|| {
                SifError::invalid_argument(format!("bulk payload of {data_size} bytes exceeds 24 bits"))
            })?;

        #[allow(clippy::cast_possible_truncation)] // ≤ 128
        let packet_size = (CMD_HEADER_SIZE + inline_len) as u8;

        Ok(Self {
            packet_size,
            data_size,
            dst,
            cmd_id,
            opt,
        })
    }

    /// Inline bytes following the header
    pub const fn inline_len(&self) -> usize {
        self.packet_size as usize - CMD_HEADER_SIZE
    }

    /// Serialize to 16 bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a field is out of range.
    pub fn encode(&self) -> Result<[u8; CMD_HEADER_SIZE]> {
        self.validate_packet_size()
            .map_err(SifError::invalid_argument)?;
        if self.data_size >= DATA_SIZE_LIMIT {
            return Err(SifError::invalid_argument(format!(
                "data_size {:#x} exceeds 24 bits",
                self.data_size
            )));
        }

        let mut out = [0u8; CMD_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(u32::from(self.packet_size) | (self.data_size << 8));
        buf.put_u32_le(self.dst);
        buf.put_u32_le(self.cmd_id);
        buf.put_u32_le(self.opt);
        Ok(out)
    }

    /// Parse 16 header bytes
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the input is short or `packet_size` is
    /// outside `16..=128`.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CMD_HEADER_SIZE {
            return Err(SifError::protocol_violation(format!(
                "command header truncated: {} bytes",
                bytes.len()
            )));
        }
        let word0 = bytes.get_u32_le();
        #[allow(clippy::cast_possible_truncation)]
        let header = Self {
            packet_size: (word0 & 0xFF) as u8,
            data_size: word0 >> 8,
            dst: bytes.get_u32_le(),
            cmd_id: bytes.get_u32_le(),
            opt: bytes.get_u32_le(),
        };
        header
            .validate_packet_size()
            .map_err(SifError::protocol_violation)?;
        Ok(header)
    }

    fn validate_packet_size(&self) -> std::result::Result<(), String> {
        let size = usize::from(self.packet_size);
        if (CMD_HEADER_SIZE..=CMD_PACKET_MAX).contains(&size) {
            Ok(())
        } else {
            Err(format!(
                "packet_size {size} outside {CMD_HEADER_SIZE}..={CMD_PACKET_MAX}"
            ))
        }
    }
}

/// Frames commands onto SIF1
#[derive(Debug)]
pub struct CommandCodec {
    channels: Arc<ChannelManager>,
    iop_buffer: AtomicU32,
}

impl CommandCodec {
    /// Codec over `channels`; the IOP address is learned during the handshake
    pub const fn new(channels: Arc<ChannelManager>) -> Self {
        Self {
            channels,
            iop_buffer: AtomicU32::new(0),
        }
    }

    /// The channel manager
    pub const fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    /// IOP command receive address
    pub fn iop_buffer(&self) -> u32 {
        self.iop_buffer.load(Ordering::Acquire)
    }

    /// Set the IOP command receive address
    pub fn set_iop_buffer(&self, addr: u32) {
        debug!("IOP command buffer at {addr:#x}");
        self.iop_buffer.store(addr, Ordering::Release);
    }

    /// Send a command with an optional bulk payload
    ///
    /// The bulk payload goes first, as a non-interrupting transfer to its
    /// destination; the command itself follows only if that succeeded.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `inline` exceeds 112 bytes (the channel is not
    ///   touched) or a transfer does not fit the buffer
    /// - `Busy` if SIF1 does not become ready
    pub fn send_command(
        &self,
        cmd_id: u32,
        opt: u32,
        inline: &[u8],
        bulk: Option<(u32, &[u8])>,
    ) -> Result<()> {
        let header = CommandHeader::new(cmd_id, opt, inline.len(), bulk.map(|(dst, b)| (dst, b.len())))?;
        let encoded = header.encode()?;

        if let Some((dst, payload)) = bulk {
            self.channels.transmit(None, dst, payload, false)?;
        }

        debug!(
            "Sending {} ({cmd_id:#x}): opt={opt:#x}, inline={}, bulk={}",
            sif_chip::cmd::name(cmd_id),
            inline.len(),
            header.data_size
        );
        self.channels
            .transmit(Some(&encoded), self.iop_buffer(), inline, true)
    }

    /// Send a command with inline data only
    ///
    /// # Errors
    ///
    /// See [`CommandCodec::send_command`].
    pub fn send(&self, cmd_id: u32, inline: &[u8]) -> Result<()> {
        self.send_command(cmd_id, 0, inline, None)
    }

    /// Send a command with an option word
    ///
    /// # Errors
    ///
    /// See [`CommandCodec::send_command`].
    pub fn send_opt(&self, cmd_id: u32, opt: u32, inline: &[u8]) -> Result<()> {
        self.send_command(cmd_id, opt, inline, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SifBus;
    use crate::backends::SoftwareIop;
    use crate::clock::ManualClock;
    use crate::config::DmaTiming;

    const USER_CMD: u32 = 0x10;

    fn codec(iop: &Arc<SoftwareIop>) -> CommandCodec {
        let bus: Arc<dyn SifBus> = iop.clone();
        let channels =
            ChannelManager::new(bus, Arc::new(ManualClock::new()), DmaTiming::default()).unwrap();
        let codec = CommandCodec::new(Arc::new(channels));
        codec.set_iop_buffer(0x2_0000);
        codec
    }

    #[test]
    fn header_wire_layout() {
        let header = CommandHeader::new(0x8000_0009, 7, 12, Some((0x4000, 0x1234))).unwrap();
        let bytes = header.encode().unwrap();
        assert_eq!(&bytes[0..4], &(28u32 | (0x1234 << 8)).to_le_bytes());
        assert_eq!(&bytes[4..8], &0x4000u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x8000_0009u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &7u32.to_le_bytes());
        assert_eq!(CommandHeader::decode(&bytes).unwrap(), header);
        assert_eq!(header.inline_len(), 12);
    }

    #[test]
    fn header_validation() {
        assert!(CommandHeader::new(USER_CMD, 0, 113, None).is_err());
        assert!(CommandHeader::new(USER_CMD, 0, 0, Some((0, 1 << 24))).is_err());

        let mut bad = [0u8; 16];
        bad[0] = 8;
        assert!(matches!(
            CommandHeader::decode(&bad),
            Err(SifError::ProtocolViolation { .. })
        ));
        bad[0] = 129;
        assert!(CommandHeader::decode(&bad).is_err());
        assert!(CommandHeader::decode(&bad[..10]).is_err());
    }

    #[test]
    fn oversized_inline_never_touches_the_channel() {
        let iop = Arc::new(SoftwareIop::new());
        let codec = codec(&iop);
        for len in [113usize, 200, 4000] {
            let err = codec.send(USER_CMD, &vec![0u8; len]).unwrap_err();
            assert!(matches!(err, SifError::InvalidArgument { .. }));
        }
        assert!(iop.transfers().is_empty());

        codec.send(USER_CMD, &[0u8; 112]).unwrap();
        let t = &iop.transfers()[0];
        assert_eq!(t.tag.addr, 0x2_0000);
        assert_eq!(t.qwc, 9);
    }

    #[test]
    fn bulk_precedes_the_command() {
        let iop = Arc::new(SoftwareIop::new());
        let codec = codec(&iop);
        codec
            .send_command(USER_CMD, 3, &[1, 2, 3, 4], Some((0x5000, &[9u8; 40])))
            .unwrap();

        let transfers = iop.transfers();
        assert_eq!(transfers.len(), 2);
        assert!(!transfers[0].tag.int_0);
        assert_eq!(transfers[0].tag.addr, 0x5000);
        assert_eq!(&transfers[0].payload[..40], &[9u8; 40]);

        let header = CommandHeader::decode(&transfers[1].payload).unwrap();
        assert!(transfers[1].tag.int_0);
        assert_eq!(header.data_size, 40);
        assert_eq!(header.dst, 0x5000);
        assert_eq!(header.opt, 3);
        assert_eq!(header.packet_size, 20);
    }
}
