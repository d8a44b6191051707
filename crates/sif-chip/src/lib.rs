//! Silicon model for the main processor ↔ IOP sub-system interface (SIF).
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the interconnect: register addresses and flag bits, the
//! command id namespace, and the framing limits both processors agree on.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | DMAC SIF0/SIF1 channel registers, SIF mailbox registers, flag and CHCR bits |
//! | [`cmd`] | System command ids, handler table geometry, RPC service ids |
//! | [`frame`] | DMA tag / command header sizes, packet ceilings, page size, reset args |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cmd;
pub mod frame;
pub mod regs;
