//! `sifctl`: command-line interface for the IOP sub-system interface.
//!
//! ```text
//! USAGE:
//!   sifctl boot [--backend B]                    Handshake and report state
//!   sifctl call --sid S [--rpc N] [--recv N] <payload>
//!                                                Bind a service and call it
//!   sifctl load <path> [--arg A]                 Load an IOP module from ROM
//!   sifctl header <hex>                          Decode a command header
//!   sifctl tag <nbytes> [--addr A]               Show the DMA tag for a transfer
//! ```
//!
//! `--backend software` (the default) runs against the simulated IOP;
//! `--backend mmio` drives the hardware through `/dev/mem`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sif_driver::prelude::*;
use sif_driver::{CommandHeader, MmioConfig, TransferTag};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sifctl", about = "IOP sub-system interface CLI", version)]
struct Cli {
    /// Bus to drive.
    #[arg(long, value_enum, default_value_t = Backend::Software, global = true)]
    backend: Backend,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Simulated IOP with echo and module-loader services.
    Software,
    /// Hardware registers and DMA window through /dev/mem.
    Mmio,
}

impl From<Backend> for BusSelection {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Software => Self::Software,
            Backend::Mmio => Self::Mmio,
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the boot handshake and print the interconnect state.
    Boot,
    /// Bind a service and call one of its procedures.
    Call {
        /// Service id (decimal or 0x-prefixed hex).
        #[arg(long, value_parser = parse_u32)]
        sid: u32,
        /// Procedure number.
        #[arg(long, default_value_t = 0, value_parser = parse_u32)]
        rpc: u32,
        /// Response bytes to read back (defaults to the payload length).
        #[arg(long)]
        recv: Option<usize>,
        /// Request payload as text.
        payload: String,
    },
    /// Load an IOP module from ROM.
    Load {
        /// Module path (e.g. rom0:SIO2MAN).
        path: String,
        /// Argument string passed to the module.
        #[arg(long, default_value = "")]
        arg: String,
    },
    /// Decode a 16-byte command header given as hex.
    Header {
        /// 32 hex digits.
        hex: String,
    },
    /// Show the DMA tag and channel count for a payload size.
    Tag {
        /// Payload size in bytes (padded to 16).
        nbytes: usize,
        /// Destination address on the IOP.
        #[arg(long, default_value_t = 0, value_parser = parse_u32)]
        addr: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Boot => cmd_boot(cli.backend)?,
        Cmd::Call {
            sid,
            rpc,
            recv,
            payload,
        } => cmd_call(cli.backend, sid, rpc, recv, &payload)?,
        Cmd::Load { path, arg } => cmd_load(cli.backend, &path, &arg)?,
        Cmd::Header { hex } => cmd_header(&hex)?,
        Cmd::Tag { nbytes, addr } => cmd_tag(nbytes, addr)?,
    }

    Ok(())
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s:?}: {e}"))
}

fn open(backend: Backend) -> Result<Sif> {
    let bus = open_bus(backend.into(), &MmioConfig::default()).context("opening SIF bus")?;
    info!("Opened {} bus", bus.bus_type());
    let sif = Sif::init(bus, SifConfig::from_env()).context("SIF initialisation failed")?;
    info!("SIF {} with IOP buffer {:#x}", sif.state(), sif.iop_buffer());
    Ok(sif)
}

fn cmd_boot(backend: Backend) -> Result<()> {
    let sif = open(backend)?;

    println!("Bus         {}", sif.bus().bus_type());
    println!("State       {}", sif.state());
    println!("IOP buffer  {:#010x}", sif.iop_buffer());
    println!("Mailbox[0]  {}", sif.register(0)?);
    Ok(())
}

fn cmd_call(backend: Backend, sid: u32, rpc: u32, recv: Option<usize>, payload: &str) -> Result<()> {
    let sif = open(backend)?;

    let mut client = RpcClient::new();
    sif.bind(&mut client, sid)
        .with_context(|| format!("binding service {sid:#x}"))?;
    let b = client.binding();
    println!("Bound {sid:#x}: server={:#x} buffer={:#x}", b.server, b.server_buffer);

    let mut response = vec![0u8; recv.unwrap_or(payload.len())];
    sif.call(&mut client, rpc, payload.as_bytes(), &mut response)
        .with_context(|| format!("calling procedure {rpc}"))?;

    println!("Response ({} bytes):", response.len());
    println!("  hex   {}", to_hex(&response));
    println!("  text  {}", String::from_utf8_lossy(&response).trim_end_matches('\0'));

    sif.unbind(&mut client);
    Ok(())
}

fn cmd_load(backend: Backend, path: &str, arg: &str) -> Result<()> {
    let sif = open(backend)?;
    let mut loader = ModuleLoader::new(&sif).context("binding module loader")?;

    let module = loader.load_rom(path, arg.as_bytes())?;
    println!("Loaded {path}: id={} result={}", module.id, module.result);
    Ok(())
}

fn cmd_header(hex: &str) -> Result<()> {
    let bytes = from_hex(hex)?;
    let header = CommandHeader::decode(&bytes)?;

    println!("Command      {:#010x} ({})", header.cmd_id, sif_chip::cmd::name(header.cmd_id));
    println!("Packet size  {} ({} inline)", header.packet_size, header.inline_len());
    println!("Data size    {}", header.data_size);
    println!("Destination  {:#x}", header.dst);
    println!("Option       {:#x}", header.opt);
    Ok(())
}

fn cmd_tag(nbytes: usize, addr: u32) -> Result<()> {
    let aligned = sif_chip::frame::dma_align(nbytes);
    let tag = TransferTag::new(addr, aligned, false)?;

    println!("Payload      {nbytes} bytes, {aligned} aligned");
    println!("Tag          addr={:#x} wc={} qwc={}", tag.addr, tag.wc, tag.qwc()?);
    println!("Channel QWC  {}", tag.qwc()? + 1);
    println!("Wire         {}", to_hex(&tag.encode()));
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(hex: &str) -> Result<Vec<u8>> {
    let hex: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if !hex.is_ascii() {
        bail!("non-ASCII characters in hex input");
    }
    if hex.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte {:?}", &hex[i..i + 2]))
        })
        .collect()
}
