//! Main-processor register map for the sub-system interface.
//!
//! All addresses are physical and sit inside the 64 KiB I/O window at
//! `0x1000_0000`. Two groups matter to the SIF:
//!
//! ```text
//! 0x1000_c000  DMAC channel 5 (SIF0, IOP → main)   CHCR / MADR / QWC
//! 0x1000_c400  DMAC channel 6 (SIF1, main → IOP)   CHCR / MADR / QWC
//! 0x1000_f200  SIF mailbox block                   MAINADDR .. UNKNF260
//! ```
//!
//! The flag registers are asymmetric. Writing MSFLAG sets bits that the IOP
//! observes; writing SMFLAG from the main side clears the written bits.

// ── I/O window ───────────────────────────────────────────────────────────────

/// Physical base of the register window that contains every SIF register.
pub const IO_WINDOW_BASE: u32 = 0x1000_0000;
/// Size of the register window in bytes.
pub const IO_WINDOW_SIZE: usize = 0x1_0000;

// ── SIF mailbox registers ────────────────────────────────────────────────────

/// Main address: physical address of the main-side receive (SIF0) buffer.
pub const SIF_MAINADDR: u32 = 0x1000_F200;
/// Sub address: IOP address of the IOP-side command receive buffer.
pub const SIF_SUBADDR: u32 = 0x1000_F210;
/// Main → sub flags. Writes set bits.
pub const SIF_MSFLAG: u32 = 0x1000_F220;
/// Sub → main flags. Writes from the main side clear bits.
pub const SIF_SMFLAG: u32 = 0x1000_F230;
/// Sub control register.
pub const SIF_SUBCTRL: u32 = 0x1000_F240;
/// Undocumented register written with `0xff` before the main address.
pub const SIF_UNKNF260: u32 = 0x1000_F260;

// ── DMAC channels ────────────────────────────────────────────────────────────

/// SIF0 channel control.
pub const DMAC_SIF0_CHCR: u32 = 0x1000_C000;
/// SIF0 memory address.
pub const DMAC_SIF0_MADR: u32 = 0x1000_C010;
/// SIF0 quadword count.
pub const DMAC_SIF0_QWC: u32 = 0x1000_C020;

/// SIF1 channel control.
pub const DMAC_SIF1_CHCR: u32 = 0x1000_C400;
/// SIF1 memory address.
pub const DMAC_SIF1_MADR: u32 = 0x1000_C410;
/// SIF1 quadword count.
pub const DMAC_SIF1_QWC: u32 = 0x1000_C420;

// ── Status flag bits (MSFLAG / SMFLAG) ───────────────────────────────────────

pub mod status {
    /// SIF initialised.
    pub const SIFINIT: u32 = 0x0001_0000;
    /// Command layer initialised; SUBADDR is valid.
    pub const CMDINIT: u32 = 0x0002_0000;
    /// Boot complete.
    pub const BOOTEND: u32 = 0x0004_0000;
}

// ── CHCR bits ────────────────────────────────────────────────────────────────

pub mod chcr {
    /// Direction: set = from memory (send), clear = to memory (receive).
    pub const DIR: u32 = 1 << 0;
    /// Chain mode (mode field value 1 at bit 2).
    pub const MOD_CHAIN: u32 = 1 << 2;
    /// Tag interrupt enable.
    pub const TIE: u32 = 1 << 7;
    /// Start / busy.
    pub const STR: u32 = 1 << 8;

    /// Stop the channel.
    pub const STOP: u32 = 0;
    /// Normal-mode send with tag interrupt, started.
    pub const SENDN_TIE: u32 = DIR | TIE | STR;
    /// Chain-mode receive with tag interrupt, started.
    pub const RECVC_TIE: u32 = MOD_CHAIN | TIE | STR;
}

/// Returns `true` if `addr` lies inside the register window.
#[must_use]
pub const fn in_io_window(addr: u32) -> bool {
    addr >= IO_WINDOW_BASE && ((addr - IO_WINDOW_BASE) as usize) + 4 <= IO_WINDOW_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_register_is_in_the_io_window() {
        for reg in [
            SIF_MAINADDR,
            SIF_SUBADDR,
            SIF_MSFLAG,
            SIF_SMFLAG,
            SIF_SUBCTRL,
            SIF_UNKNF260,
            DMAC_SIF0_CHCR,
            DMAC_SIF0_MADR,
            DMAC_SIF0_QWC,
            DMAC_SIF1_CHCR,
            DMAC_SIF1_MADR,
            DMAC_SIF1_QWC,
        ] {
            assert!(in_io_window(reg), "{reg:#x} outside window");
        }
        assert!(!in_io_window(0x1001_0000));
    }

    #[test]
    fn chcr_encodings() {
        assert_eq!(chcr::SENDN_TIE, 0x181);
        assert_eq!(chcr::RECVC_TIE, 0x184);
    }

    #[test]
    fn status_bits_disjoint() {
        assert_eq!(status::SIFINIT & status::CMDINIT, 0);
        assert_eq!(status::CMDINIT & status::BOOTEND, 0);
    }
}
