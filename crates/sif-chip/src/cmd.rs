//! Command and service identifiers shared by both processors.
//!
//! Bit 31 of a command id selects the system table; the low six bits select
//! the handler slot. Both sides share one namespace, so not every system
//! command has a handler on every build.

/// System-command flag.
pub const ID_SYS: u32 = 0x8000_0000;
/// User commands have bit 31 clear.
pub const ID_USR: u32 = 0x0000_0000;
/// Slot index mask.
pub const ID_INDEX_MASK: u32 = 0x3F;
/// Handler slots per table.
pub const HANDLER_SLOTS: usize = 64;

/// Change the IOP receive address.
pub const CHANGE_SADDR: u32 = ID_SYS | 0x00;
/// Write a mailbox (software) register on the receiving side.
pub const WRITE_SREG: u32 = ID_SYS | 0x01;
/// Initialise the command layer (opt 0) or the RPC layer (opt 1).
pub const INIT_CMD: u32 = ID_SYS | 0x02;
/// Reset the IOP with a boot argument string.
pub const RESET_CMD: u32 = ID_SYS | 0x03;
/// RPC request end (bind or call completion).
pub const RPC_END: u32 = ID_SYS | 0x08;
/// RPC bind request.
pub const RPC_BIND: u32 = ID_SYS | 0x09;
/// RPC call request.
pub const RPC_CALL: u32 = ID_SYS | 0x0A;
/// RPC remote data read.
pub const RPC_RDATA: u32 = ID_SYS | 0x0C;
/// IRQ relay from IOP to the main interrupt controller.
pub const RPC_IRQ: u32 = ID_SYS | 0x20;

/// Mailbox register raised by the IOP once RPC is initialised.
pub const SREG_RPCINIT: usize = 0;
/// Number of mailbox registers.
pub const SREG_COUNT: usize = 32;

/// Well-known RPC service ids.
pub mod sid {
    /// IOP module loader (`LOADFILE`).
    pub const LOAD_MODULE: u32 = 0x8000_0006;
}

/// Returns `true` for system command ids.
#[must_use]
pub const fn is_system(cmd_id: u32) -> bool {
    cmd_id & ID_SYS != 0
}

/// Human-readable name for logging.
#[must_use]
pub const fn name(cmd_id: u32) -> &'static str {
    match cmd_id {
        CHANGE_SADDR => "CHANGE_SADDR",
        WRITE_SREG => "WRITE_SREG",
        INIT_CMD => "INIT_CMD",
        RESET_CMD => "RESET_CMD",
        RPC_END => "RPC_END",
        RPC_BIND => "RPC_BIND",
        RPC_CALL => "RPC_CALL",
        RPC_RDATA => "RPC_RDATA",
        RPC_IRQ => "RPC_IRQ",
        _ if is_system(cmd_id) => "SYS(?)",
        _ => "USER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_ids_fit_a_slot() {
        for id in [CHANGE_SADDR, WRITE_SREG, INIT_CMD, RESET_CMD, RPC_END, RPC_BIND, RPC_CALL, RPC_RDATA, RPC_IRQ] {
            assert!(is_system(id));
            assert!(((id & !ID_SYS) as usize) < HANDLER_SLOTS, "{id:#x}");
        }
    }

    #[test]
    fn names() {
        assert_eq!(name(RPC_END), "RPC_END");
        assert_eq!(name(ID_SYS | 0x3F), "SYS(?)");
        assert_eq!(name(5), "USER");
    }
}
