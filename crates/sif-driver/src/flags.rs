//! Typed views of the flag and channel-control registers

use bitflags::bitflags;
use sif_chip::regs::{chcr, status};

bitflags! {
    /// MSFLAG / SMFLAG handshake bits
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SifStatus: u32 {
        /// SIF initialised
        const SIFINIT = status::SIFINIT;
        /// Command layer initialised
        const CMDINIT = status::CMDINIT;
        /// Boot finished
        const BOOTEND = status::BOOTEND;
    }
}

bitflags! {
    /// DMAC channel control (CHCR) bits used by the SIF channels
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Chcr: u32 {
        /// Direction: from memory
        const DIR = chcr::DIR;
        /// Chain mode
        const MOD_CHAIN = chcr::MOD_CHAIN;
        /// Tag interrupt enable
        const TIE = chcr::TIE;
        /// Start / busy
        const STR = chcr::STR;
    }
}

impl Chcr {
    /// Whether a transfer is in progress
    pub const fn busy(self) -> bool {
        self.contains(Self::STR)
    }
}
