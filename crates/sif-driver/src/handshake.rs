//! Boot handshake
//!
//! Brings main processor and IOP to a common ready state before any command
//! traffic:
//!
//! ```text
//! Idle ─▶ SubaddrPending ─▶ ResetRequested ─▶ BootEndWait ─▶ Ready
//!              │                  │                │
//!              └──────────────────┴────────────────┴──▶ Failed
//! ```
//!
//! 1. Wait for SMFLAG `CMDINIT`, read the provisional SUBADDR.
//! 2. Publish MAINADDR and raise MSFLAG `CMDINIT`, `BOOTEND`.
//! 3. Clear SMFLAG `BOOTEND`, send `RESET_CMD`, clear `SIFINIT`, `CMDINIT`.
//! 4. Wait for SMFLAG `BOOTEND`.
//! 5. Publish MAINADDR again, read the final SUBADDR.

use crate::backend::SifBus;
use crate::clock::{millis, poll_until, Clock};
use crate::codec::CommandCodec;
use crate::config::SifConfig;
use crate::error::{Result, SifError};
use crate::flags::SifStatus;
use bytes::BufMut;
use sif_chip::cmd;
use sif_chip::frame::RESET_ARG_MAX;
use sif_chip::regs;
use tracing::{debug, info, warn};

/// Reset packet: `arglen: u32, mode: u32, arg: [u8; 80]`
pub const RESET_PACKET_SIZE: usize = 8 + RESET_ARG_MAX;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    /// Not started
    Idle,
    /// Waiting for the IOP command buffer address
    SubaddrPending,
    /// Reset command being sent
    ResetRequested,
    /// Waiting for the IOP to finish booting
    BootEndWait,
    /// Both sides synchronized
    Ready,
    /// Handshake aborted
    Failed,
}

impl std::fmt::Display for BootState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::SubaddrPending => "waiting for subaddr",
            Self::ResetRequested => "resetting IOP",
            Self::BootEndWait => "waiting for boot end",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Encode the `RESET_CMD` packet for `args`
///
/// # Errors
///
/// Returns `InvalidArgument` if `args` plus its NUL terminator exceeds 80
/// bytes or contains a NUL.
pub fn encode_reset_packet(args: &str) -> Result<[u8; RESET_PACKET_SIZE]> {
    let arglen = args.len() + 1;
    if arglen > RESET_ARG_MAX {
        return Err(SifError::invalid_argument(format!(
            "reset arguments of {arglen} bytes (with NUL) exceed {RESET_ARG_MAX}"
        )));
    }
    if args.as_bytes().contains(&0) {
        return Err(SifError::invalid_argument("reset arguments contain NUL"));
    }

    #[allow(clippy::cast_possible_truncation)] // ≤ 80
    let arglen = arglen as u32;

    let mut out = [0u8; RESET_PACKET_SIZE];
    let mut buf = &mut out[..];
    buf.put_u32_le(arglen);
    buf.put_u32_le(0);
    buf.put_slice(args.as_bytes());
    Ok(out)
}

/// One run of the boot handshake
#[derive(Debug)]
pub struct Handshake<'a> {
    bus: &'a dyn SifBus,
    codec: &'a CommandCodec,
    clock: &'a dyn Clock,
    config: &'a SifConfig,
    state: BootState,
}

impl<'a> Handshake<'a> {
    /// Prepare a handshake; nothing touches the bus until [`Handshake::run`]
    pub fn new(
        bus: &'a dyn SifBus,
        codec: &'a CommandCodec,
        clock: &'a dyn Clock,
        config: &'a SifConfig,
    ) -> Self {
        Self {
            bus,
            codec,
            clock,
            config,
            state: BootState::Idle,
        }
    }

    /// Current state
    pub const fn state(&self) -> BootState {
        self.state
    }

    /// Run every step
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for oversized reset arguments
    /// - `Io` if a flag does not appear within the handshake budget
    /// - any transmission error from the reset command
    ///
    /// The state is `Failed` after any error.
    pub fn run(&mut self) -> Result<()> {
        let result = self.steps();
        match &result {
            Ok(()) => {
                self.state = BootState::Ready;
                info!(
                    "SIF handshake complete: IOP buffer {:#x}",
                    self.codec.iop_buffer()
                );
            }
            Err(e) => {
                warn!("SIF handshake failed while {}: {e}", self.state);
                self.state = BootState::Failed;
            }
        }
        result
    }

    fn steps(&mut self) -> Result<()> {
        let reset_packet = encode_reset_packet(&self.config.reset_args)?;

        self.state = BootState::SubaddrPending;
        self.read_subaddr("provisional")?;
        self.write_mainaddr_bootend();

        self.state = BootState::ResetRequested;
        self.clear_smflag(SifStatus::BOOTEND);
        self.codec.send(cmd::RESET_CMD, &reset_packet)?;
        self.clear_smflag(SifStatus::SIFINIT);
        self.clear_smflag(SifStatus::CMDINIT);
        debug!("IOP reset requested with {:?}", self.config.reset_args);

        self.state = BootState::BootEndWait;
        self.wait_smflag(SifStatus::BOOTEND, "boot end")?;

        self.write_mainaddr_bootend();
        self.read_subaddr("final")
    }

    /// Main-side SMFLAG writes clear the written bits.
    fn clear_smflag(&self, flag: SifStatus) {
        self.bus.write32(regs::SIF_SMFLAG, flag.bits());
    }

    fn wait_smflag(&self, flag: SifStatus, what: &str) -> Result<()> {
        let ok = poll_until(
            self.clock,
            self.config.handshake_timeout,
            self.config.handshake_poll,
            || SifStatus::from_bits_truncate(self.bus.read32(regs::SIF_SMFLAG)).contains(flag),
        );
        if ok {
            Ok(())
        } else {
            Err(SifError::io(format!(
                "IOP {what} flag not raised within {}ms",
                millis(self.config.handshake_timeout)
            )))
        }
    }

    fn read_subaddr(&self, which: &str) -> Result<()> {
        self.wait_smflag(SifStatus::CMDINIT, "command init")?;
        let subaddr = self.bus.read32(regs::SIF_SUBADDR);
        debug!("Read {which} subaddr {subaddr:#x}");
        self.codec.set_iop_buffer(subaddr);
        Ok(())
    }

    fn write_mainaddr_bootend(&self) {
        let mainaddr = self.codec.channels().sif0_phys();
        self.bus.write32(regs::SIF_UNKNF260, 0xFF);
        self.bus.write32(regs::SIF_MAINADDR, mainaddr);
        self.bus.write32(regs::SIF_MSFLAG, SifStatus::CMDINIT.bits());
        self.bus.write32(regs::SIF_MSFLAG, SifStatus::BOOTEND.bits());
    }
}
