//! Mailbox registers written by the IOP
//!
//! The IOP publishes small status words (RPC readiness in slot 0, the rest
//! module specific) through `WRITE_SREG` packets.

use crate::error::{Result, SifError};
use parking_lot::Mutex;
use sif_chip::cmd::SREG_COUNT;

/// 32 signed mailbox slots behind one lock
#[derive(Debug, Default)]
pub struct RegisterBank {
    slots: Mutex<[i32; SREG_COUNT]>,
}

impl RegisterBank {
    /// All slots zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` in slot `index`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if `index` is out of range.
    pub fn write(&self, index: usize, value: i32) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or_else(|| out_of_range(index))?;
        *slot = value;
        Ok(())
    }

    /// Load slot `index`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if `index` is out of range.
    pub fn read(&self, index: usize) -> Result<i32> {
        self.slots
            .lock()
            .get(index)
            .copied()
            .ok_or_else(|| out_of_range(index))
    }
}

fn out_of_range(index: usize) -> SifError {
    SifError::protocol_violation(format!(
        "mailbox register {index} out of range (0..{SREG_COUNT})"
    ))
}
