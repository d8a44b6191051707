//! Pure Rust driver for the IOP sub-system interface (SIF).
//!
//! The SIF joins the main processor to the I/O processor (IOP) through two
//! DMA channels and a handful of flag registers. This crate implements the
//! main-processor side of it:
//!
//! - boot handshake and IOP reset
//! - DMA transfers with tag framing over SIF1 (main → IOP)
//! - inbound command dispatch from SIF0 (IOP → main)
//! - software mailbox registers
//! - remote procedure calls against IOP services
//!
//! # Bus hierarchy
//!
//! ```text
//! Hardware:
//!   MmioBus      registers and reserved DMA window via /dev/mem
//!
//! Development:
//!   SoftwareIop  simulated IOP, runs the full protocol in-process
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use sif_driver::prelude::*;
//! use sif_driver::backends::SoftwareIop;
//! use std::sync::Arc;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let sif = Sif::init(Arc::new(SoftwareIop::standard()), SifConfig::default())?;
//!
//! let mut client = RpcClient::new();
//! sif.bind(&mut client, SoftwareIop::ECHO_SERVICE)?;
//!
//! let mut reply = [0u8; 16];
//! sif.call(&mut client, 0, b"ping", &mut reply)?;
//! assert_eq!(&reply[..4], b"ping");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod backend;
pub mod backends;
pub mod clock;
pub mod codec;
mod config;
pub mod dispatch;
pub mod dma;
mod error;
pub mod flags;
pub mod handshake;
pub mod iop_module;
pub mod rpc;
mod sif;
pub mod sregs;

/// Protocol constants (re-exported from sif-chip).
pub mod protocol {
    pub use sif_chip::cmd;
    pub use sif_chip::frame;
    pub use sif_chip::regs;
}

pub use backend::{open_bus, BusSelection, BusType, IrqHandler, SifBus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{CommandCodec, CommandHeader};
pub use config::{DmaTiming, MmioConfig, SifConfig};
pub use dispatch::{Dispatched, Handler, InboundFrame, Registry};
pub use dma::{ChannelManager, DmaBuffer, TransferTag};
pub use error::{Result, SifError};
pub use handshake::BootState;
pub use iop_module::{LoadedModule, ModuleLoader};
pub use rpc::{Binding, ClientState, RpcClient};
pub use sif::{IrqSink, Sif};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        open_bus, BootState, BusSelection, ClientState, InboundFrame, ModuleLoader, Result,
        RpcClient, Sif, SifBus, SifConfig, SifError,
    };
}
