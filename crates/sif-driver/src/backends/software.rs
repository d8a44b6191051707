//! Software (simulated IOP) bus
//!
//! Implements the IOP side of the interconnect in-process, so the full
//! driver runs without hardware:
//!
//! - flag registers with the real asymmetry (MSFLAG writes set, main-side
//!   SMFLAG writes clear)
//! - reset and boot: after `RESET_CMD` the next SMFLAG read finishes the
//!   boot and publishes the final SUBADDR
//! - SIF1 transfers are parsed from main memory: bulk data lands in IOP
//!   memory, commands are executed
//! - `INIT_CMD`, `RPC_BIND` and `RPC_CALL` against registered services
//! - replies travel back over SIF0: written at MAINADDR, then the
//!   completion hook fires
//!
//! Fault injection (`hang_boot`, `stall_sif1`, `withhold_rpc_init`,
//! `dma_page_limit`, silent services) covers the error paths, and every
//! SIF1 transfer is recorded for inspection.
//!
//! The completion hook always runs with the state lock released: the hook
//! reads registers and re-arms SIF0, which re-enters this bus.

use crate::backend::{BusType, IrqHandler, SifBus};
use crate::backends::PageMap;
use crate::codec::CommandHeader;
use crate::dma::TransferTag;
use crate::error::{Result, SifError};
use crate::flags::{Chcr, SifStatus};
use crate::rpc::{BindRequest, CallRequest, RequestEnd};
use bytes::Buf;
use parking_lot::{Mutex, RwLock};
use sif_chip::cmd::{self, sid};
use sif_chip::frame::{CMD_HEADER_SIZE, CMD_PACKET_MAX, DMA_TAG_SIZE, PAGE_SIZE};
use sif_chip::regs;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Service procedure: `(rpc_id, request) -> response`
pub type ServiceFn = Arc<dyn Fn(u32, &[u8]) -> Vec<u8> + Send + Sync>;

/// One SIF1 transfer as the IOP saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    /// Main-memory source address
    pub madr: u32,
    /// Programmed quadword count (tag included)
    pub qwc: u32,
    /// Channel control value that started it
    pub chcr: u32,
    /// Parsed tag
    pub tag: TransferTag,
    /// Bytes after the tag (`tag.wc * 4`)
    pub payload: Vec<u8>,
}

/// A command the IOP received from the main side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCommand {
    /// Command id
    pub cmd_id: u32,
    /// Option word
    pub opt: u32,
    /// Inline bytes
    pub data: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChannelRegs {
    chcr: u32,
    madr: u32,
    qwc: u32,
}

struct Service {
    server: u32,
    buffer: u32,
    handler: ServiceFn,
    silent: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Options {
    hang_boot: bool,
    stall_sif1: bool,
    withhold_rpc_init: bool,
}

struct IopState {
    smflag: SifStatus,
    msflag: SifStatus,
    mainaddr: u32,
    subaddr: u32,
    other_regs: HashMap<u32, u32>,
    sif0: ChannelRegs,
    sif1: ChannelRegs,

    pages: PageMap,
    main_mem: BTreeMap<u32, Vec<u8>>,
    iop_mem: BTreeMap<u32, Vec<u8>>,

    boot_pending: bool,
    reset_args: Option<String>,
    host_cmd_buffer: u32,

    services: HashMap<u32, Service>,
    held: Vec<RequestEnd>,

    sif0_queue: VecDeque<[u8; CMD_PACKET_MAX]>,
    pumping: bool,

    transfers: Vec<TransferRecord>,
    commands: Vec<ReceivedCommand>,
}

/// Simulated IOP
pub struct SoftwareIop {
    state: Mutex<IopState>,
    irq: RwLock<Option<IrqHandler>>,
    options: Options,
}

impl std::fmt::Debug for SoftwareIop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SoftwareIop")
            .field("smflag", &st.smflag)
            .field("subaddr", &format_args!("{:#x}", st.subaddr))
            .field("services", &st.services.len())
            .field("transfers", &st.transfers.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Default for SoftwareIop {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareIop {
    /// SUBADDR before the IOP reset
    pub const PROVISIONAL_SUBADDR: u32 = 0x0000_C000;
    /// SUBADDR once the IOP has booted
    pub const FINAL_SUBADDR: u32 = 0x0001_F000;
    /// Physical base of simulated DMA memory
    pub const DMA_BASE: u32 = 0x0010_0000;
    /// Default DMA memory size in pages
    pub const DMA_PAGES: usize = 256;
    /// Service id of the echo service in [`SoftwareIop::standard`]
    pub const ECHO_SERVICE: u32 = 0x0000_0001;

    const SERVER_BASE: u32 = 0x0004_0000;
    const SERVER_BUFFER_BASE: u32 = 0x0008_0000;

    /// Freshly powered IOP with no services
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IopState {
                smflag: SifStatus::CMDINIT,
                msflag: SifStatus::empty(),
                mainaddr: 0,
                subaddr: Self::PROVISIONAL_SUBADDR,
                other_regs: HashMap::new(),
                sif0: ChannelRegs::default(),
                sif1: ChannelRegs::default(),
                pages: PageMap::new(Self::DMA_BASE, Self::DMA_PAGES),
                main_mem: BTreeMap::new(),
                iop_mem: BTreeMap::new(),
                boot_pending: false,
                reset_args: None,
                host_cmd_buffer: 0,
                services: HashMap::new(),
                held: Vec::new(),
                sif0_queue: VecDeque::new(),
                pumping: false,
                transfers: Vec::new(),
                commands: Vec::new(),
            }),
            irq: RwLock::new(None),
            options: Options::default(),
        }
    }

    /// IOP with an echo service and a module loader
    ///
    /// - [`SoftwareIop::ECHO_SERVICE`] returns the request unchanged
    /// - `sid::LOAD_MODULE` accepts `rom0:` paths, returning increasing
    ///   module ids, and rejects anything else with status -200
    pub fn standard() -> Self {
        let next_module = Arc::new(AtomicI32::new(1));
        Self::new()
            .with_service(Self::ECHO_SERVICE, |_, request| request.to_vec())
            .with_service(sid::LOAD_MODULE, move |_, request| {
                load_module_stub(&next_module, request)
            })
    }

    /// Register a service under `service_id`
    #[must_use]
    pub fn with_service(
        mut self,
        service_id: u32,
        handler: impl Fn(u32, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        self.add_service(service_id, Arc::new(handler), false);
        self
    }

    /// Register a service that binds but holds every call completion
    /// until [`SoftwareIop::release_held`]
    #[must_use]
    pub fn with_silent_service(mut self, service_id: u32) -> Self {
        self.add_service(service_id, Arc::new(|_, _| Vec::new()), true);
        self
    }

    fn add_service(&mut self, service_id: u32, handler: ServiceFn, silent: bool) {
        let st = self.state.get_mut();
        let n = u32::try_from(st.services.len()).unwrap_or(u32::MAX);
        st.services.insert(
            service_id,
            Service {
                server: Self::SERVER_BASE + n * 0x100,
                buffer: Self::SERVER_BUFFER_BASE + n * PAGE_SIZE as u32,
                handler,
                silent,
            },
        );
    }

    /// Never finish booting after a reset
    #[must_use]
    pub const fn hang_boot(mut self) -> Self {
        self.options.hang_boot = true;
        self
    }

    /// Leave every SIF1 transfer running forever
    #[must_use]
    pub const fn stall_sif1(mut self) -> Self {
        self.options.stall_sif1 = true;
        self
    }

    /// Never acknowledge RPC initialisation
    #[must_use]
    pub const fn withhold_rpc_init(mut self) -> Self {
        self.options.withhold_rpc_init = true;
        self
    }

    /// Limit DMA memory to `pages` pages
    #[must_use]
    pub fn dma_page_limit(mut self, pages: usize) -> Self {
        self.state.get_mut().pages = PageMap::new(Self::DMA_BASE, pages);
        self
    }

    // ── Inspection ──────────────────────────────────────────────────────────

    /// Every SIF1 transfer started so far
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.state.lock().transfers.clone()
    }

    /// Every command received so far
    pub fn commands(&self) -> Vec<ReceivedCommand> {
        self.state.lock().commands.clone()
    }

    /// DMA pages currently mapped by the main side
    pub fn mapped_pages(&self) -> usize {
        self.state.lock().pages.mapped_pages()
    }

    /// Last MAINADDR written
    pub fn mainaddr(&self) -> u32 {
        self.state.lock().mainaddr
    }

    /// Arguments of the last reset
    pub fn reset_args(&self) -> Option<String> {
        self.state.lock().reset_args.clone()
    }

    /// Main receive buffer announced by `INIT_CMD` opt 0
    pub fn host_cmd_buffer(&self) -> u32 {
        self.state.lock().host_cmd_buffer
    }

    /// Bytes deposited at IOP address `addr` by a bulk transfer
    pub fn iop_memory(&self, addr: u32) -> Option<Vec<u8>> {
        self.state.lock().iop_mem.get(&addr).cloned()
    }

    /// Whether a completion hook is installed
    pub fn has_irq_handler(&self) -> bool {
        self.irq.read().is_some()
    }

    /// Call completions held by silent services
    pub fn held_completions(&self) -> usize {
        self.state.lock().held.len()
    }

    // ── IOP-initiated traffic ───────────────────────────────────────────────

    /// Send an arbitrary packet to the main side
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `data` exceeds 112 bytes.
    pub fn inject_frame(&self, cmd_id: u32, data: &[u8]) -> Result<()> {
        let raw = encode_frame(cmd_id, data)?;
        self.state.lock().sif0_queue.push_back(raw);
        self.pump();
        Ok(())
    }

    /// Write mailbox register `index` on the main side
    ///
    /// # Errors
    ///
    /// See [`SoftwareIop::inject_frame`].
    pub fn send_sreg(&self, index: u32, value: i32) -> Result<()> {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&index.to_le_bytes());
        data[4..].copy_from_slice(&value.to_le_bytes());
        self.inject_frame(cmd::WRITE_SREG, &data)
    }

    /// Relay interrupt `rec_id` to the main side
    ///
    /// # Errors
    ///
    /// See [`SoftwareIop::inject_frame`].
    pub fn relay_irq(&self, rec_id: u32) -> Result<()> {
        let end = RequestEnd {
            rec_id,
            ..RequestEnd::default()
        };
        self.inject_frame(cmd::RPC_IRQ, &end.encode())
    }

    /// Bind to a main-side service
    ///
    /// # Errors
    ///
    /// See [`SoftwareIop::inject_frame`].
    pub fn request_bind(&self, client_ref: u64, service_id: u32) -> Result<()> {
        let bind = BindRequest {
            client_ref,
            service_id,
        };
        self.inject_frame(cmd::RPC_BIND, &bind.encode())
    }

    /// Deliver every held call completion
    pub fn release_held(&self) {
        {
            let mut st = self.state.lock();
            let held = std::mem::take(&mut st.held);
            for end in held {
                if let Ok(raw) = encode_frame(cmd::RPC_END, &end.encode()) {
                    st.sif0_queue.push_back(raw);
                }
            }
        }
        self.pump();
    }

    // ── SIF0 delivery ───────────────────────────────────────────────────────

    /// Deliver queued packets one at a time while SIF0 is armed and a hook
    /// is installed. Re-entrant calls (from the hook re-arming SIF0, or from
    /// another thread) return at once; the active pump picks up their work.
    fn pump(&self) {
        loop {
            let handler = self.irq.read().clone();
            {
                let mut st = self.state.lock();
                if st.pumping || handler.is_none() {
                    return;
                }
                if !Chcr::from_bits_retain(st.sif0.chcr).busy() {
                    return;
                }
                let Some(raw) = st.sif0_queue.pop_front() else {
                    return;
                };
                let mainaddr = st.mainaddr;
                if !write_main(&mut st, mainaddr, &raw) {
                    warn!("IOP: MAINADDR {mainaddr:#x} is not mapped, packet lost");
                    continue;
                }
                st.sif0.chcr &= !Chcr::STR.bits();
                st.pumping = true;
            }

            if let Some(handler) = handler {
                handler();
            }
            self.state.lock().pumping = false;
        }
    }

    // ── SIF1 reception ──────────────────────────────────────────────────────

    fn start_sif1(&self, chcr: u32) {
        {
            let mut st = self.state.lock();
            st.sif1.chcr = chcr;

            let madr = st.sif1.madr;
            let qwc = st.sif1.qwc;
            let Some(record) = read_transfer(&st, madr, qwc, chcr) else {
                warn!("IOP: unreadable SIF1 transfer at {madr:#x}");
                st.sif1.chcr &= !Chcr::STR.bits();
                return;
            };
            trace!("IOP: SIF1 {:?}", record.tag);
            st.transfers.push(record.clone());

            if self.options.stall_sif1 {
                return;
            }
            st.sif1.chcr &= !Chcr::STR.bits();

            if record.tag.int_0 {
                self.execute(&mut st, &record.payload);
            } else {
                st.iop_mem.insert(record.tag.addr, record.payload);
            }
        }
        self.pump();
    }

    fn execute(&self, st: &mut IopState, packet: &[u8]) {
        let header = match CommandHeader::decode(packet) {
            Ok(header) => header,
            Err(e) => {
                warn!("IOP: ignoring malformed command: {e}");
                return;
            }
        };
        let end = usize::from(header.packet_size).min(packet.len());
        let data = &packet[CMD_HEADER_SIZE..end];
        st.commands.push(ReceivedCommand {
            cmd_id: header.cmd_id,
            opt: header.opt,
            data: data.to_vec(),
        });
        debug!("IOP: received {} opt={}", cmd::name(header.cmd_id), header.opt);

        match header.cmd_id {
            cmd::RESET_CMD => self.reset(st, data),
            cmd::INIT_CMD if header.opt == 0 => {
                if let Some(mut d) = data.get(..4) {
                    st.host_cmd_buffer = d.get_u32_le();
                }
            }
            cmd::INIT_CMD => {
                if !self.options.withhold_rpc_init {
                    let mut sreg = [0u8; 8];
                    sreg[4..].copy_from_slice(&1i32.to_le_bytes());
                    queue(st, cmd::WRITE_SREG, &sreg);
                }
            }
            cmd::RPC_BIND => Self::bind(st, data),
            cmd::RPC_CALL => Self::call(st, data),
            _ => {}
        }
    }

    fn reset(&self, st: &mut IopState, data: &[u8]) {
        let mut d = data;
        if d.len() < 8 {
            warn!("IOP: short reset packet");
            return;
        }
        let arglen = d.get_u32_le() as usize;
        let _mode = d.get_u32_le();
        let arg = &d[..arglen.saturating_sub(1).min(d.len())];
        st.reset_args = Some(String::from_utf8_lossy(arg).into_owned());
        st.boot_pending = !self.options.hang_boot;
        debug!("IOP: reset with {:?}", st.reset_args);
    }

    fn bind(st: &mut IopState, data: &[u8]) {
        let Ok(bind) = BindRequest::decode(data) else {
            warn!("IOP: short bind packet");
            return;
        };
        let (server, server_buffer) = st
            .services
            .get(&bind.service_id)
            .map_or((0, 0), |s| (s.server, s.buffer));
        let end = RequestEnd {
            client_ref: bind.client_ref,
            client_id: cmd::RPC_BIND,
            server,
            server_buffer,
            ..RequestEnd::default()
        };
        queue(st, cmd::RPC_END, &end.encode());
    }

    fn call(st: &mut IopState, data: &[u8]) {
        let Ok(call) = CallRequest::decode(data) else {
            warn!("IOP: short call packet");
            return;
        };
        let end = RequestEnd {
            rpc_id: call.rpc_id,
            client_ref: call.client_ref,
            client_id: cmd::RPC_CALL,
            ..RequestEnd::default()
        };

        let Some(service) = st.services.values().find(|s| s.server == call.server) else {
            warn!("IOP: call to unknown server {:#x}", call.server);
            queue(st, cmd::RPC_END, &end.encode());
            return;
        };
        let (buffer, handler, silent) = (service.buffer, Arc::clone(&service.handler), service.silent);

        let mut request = st.iop_mem.remove(&buffer).unwrap_or_default();
        request.truncate(call.send_size as usize);

        let mut response = handler(call.rpc_id, &request);
        response.resize(call.recv_size as usize, 0);
        if !response.is_empty() && !write_main(st, call.recv_addr, &response) {
            warn!("IOP: receive address {:#x} is not mapped", call.recv_addr);
        }

        if silent {
            st.held.push(end);
        } else {
            queue(st, cmd::RPC_END, &end.encode());
        }
    }
}

fn load_module_stub(next_module: &AtomicI32, request: &[u8]) -> Vec<u8> {
    const PATH_OFFSET: usize = 8;
    const PATH_LEN: usize = 252;

    let path = request
        .get(PATH_OFFSET..PATH_OFFSET + PATH_LEN)
        .map(|p| p.split(|&b| b == 0).next().unwrap_or_default())
        .unwrap_or_default();
    let status = if path.starts_with(b"rom0:") {
        next_module.fetch_add(1, Ordering::Relaxed)
    } else {
        -200
    };

    let mut response = Vec::with_capacity(8);
    response.extend_from_slice(&status.to_le_bytes());
    response.extend_from_slice(&0u32.to_le_bytes());
    response
}

fn encode_frame(cmd_id: u32, data: &[u8]) -> Result<[u8; CMD_PACKET_MAX]> {
    let header = CommandHeader::new(cmd_id, 0, data.len(), None)?.encode()?;
    let mut raw = [0u8; CMD_PACKET_MAX];
    raw[..CMD_HEADER_SIZE].copy_from_slice(&header);
    raw[CMD_HEADER_SIZE..CMD_HEADER_SIZE + data.len()].copy_from_slice(data);
    Ok(raw)
}

fn queue(st: &mut IopState, cmd_id: u32, data: &[u8]) {
    match encode_frame(cmd_id, data) {
        Ok(raw) => st.sif0_queue.push_back(raw),
        Err(e) => warn!("IOP: cannot frame {}: {e}", cmd::name(cmd_id)),
    }
}

fn locate(st: &IopState, phys: u32, len: usize) -> Option<(u32, usize)> {
    let (base, run_len) = st.pages.run_containing(phys)?;
    let offset = (phys - base) as usize;
    (offset + len <= run_len).then_some((base, offset))
}

fn write_main(st: &mut IopState, phys: u32, data: &[u8]) -> bool {
    let Some((base, offset)) = locate(st, phys, data.len()) else {
        return false;
    };
    match st.main_mem.get_mut(&base) {
        Some(mem) => {
            mem[offset..offset + data.len()].copy_from_slice(data);
            true
        }
        None => false,
    }
}

fn read_main(st: &IopState, phys: u32, out: &mut [u8]) -> bool {
    let Some((base, offset)) = locate(st, phys, out.len()) else {
        return false;
    };
    match st.main_mem.get(&base) {
        Some(mem) => {
            out.copy_from_slice(&mem[offset..offset + out.len()]);
            true
        }
        None => false,
    }
}

fn read_transfer(st: &IopState, madr: u32, qwc: u32, chcr: u32) -> Option<TransferRecord> {
    let mut tag_bytes = [0u8; DMA_TAG_SIZE];
    if !read_main(st, madr, &mut tag_bytes) {
        return None;
    }
    let tag = TransferTag::decode(&tag_bytes).ok()?;
    let mut payload = vec![0u8; tag.payload_len()];
    if !read_main(st, madr + DMA_TAG_SIZE as u32, &mut payload) {
        return None;
    }
    Some(TransferRecord {
        madr,
        qwc,
        chcr,
        tag,
        payload,
    })
}

impl SifBus for SoftwareIop {
    fn read32(&self, reg: u32) -> u32 {
        let mut st = self.state.lock();
        match reg {
            regs::SIF_SMFLAG => {
                if st.boot_pending {
                    st.boot_pending = false;
                    st.smflag |= SifStatus::SIFINIT | SifStatus::CMDINIT | SifStatus::BOOTEND;
                    st.subaddr = Self::FINAL_SUBADDR;
                    debug!("IOP: boot complete");
                }
                st.smflag.bits()
            }
            regs::SIF_MSFLAG => st.msflag.bits(),
            regs::SIF_SUBADDR => st.subaddr,
            regs::SIF_MAINADDR => st.mainaddr,
            regs::DMAC_SIF0_CHCR => st.sif0.chcr,
            regs::DMAC_SIF0_MADR => st.sif0.madr,
            regs::DMAC_SIF0_QWC => st.sif0.qwc,
            regs::DMAC_SIF1_CHCR => st.sif1.chcr,
            regs::DMAC_SIF1_MADR => st.sif1.madr,
            regs::DMAC_SIF1_QWC => st.sif1.qwc,
            other => st.other_regs.get(&other).copied().unwrap_or(0),
        }
    }

    fn write32(&self, reg: u32, value: u32) {
        match reg {
            regs::DMAC_SIF1_CHCR if Chcr::from_bits_retain(value).busy() => {
                self.start_sif1(value);
            }
            regs::DMAC_SIF0_CHCR => {
                self.state.lock().sif0.chcr = value;
                self.pump();
            }
            _ => {
                let mut st = self.state.lock();
                match reg {
                    regs::SIF_SMFLAG => st.smflag.remove(SifStatus::from_bits_truncate(value)),
                    regs::SIF_MSFLAG => st.msflag.insert(SifStatus::from_bits_truncate(value)),
                    regs::SIF_MAINADDR => st.mainaddr = value,
                    regs::DMAC_SIF0_MADR => st.sif0.madr = value,
                    regs::DMAC_SIF0_QWC => st.sif0.qwc = value,
                    regs::DMAC_SIF1_CHCR => st.sif1.chcr = value,
                    regs::DMAC_SIF1_MADR => st.sif1.madr = value,
                    regs::DMAC_SIF1_QWC => st.sif1.qwc = value,
                    other => {
                        st.other_regs.insert(other, value);
                    }
                }
            }
        }
    }

    fn map_dma(&self, size: usize) -> Result<u32> {
        let mut st = self.state.lock();
        let phys = st.pages.alloc(size)?;
        let len = st
            .pages
            .run_containing(phys)
            .map_or(size, |(_, len)| len);
        st.main_mem.insert(phys, vec![0u8; len]);
        Ok(phys)
    }

    fn unmap_dma(&self, phys: u32) {
        let mut st = self.state.lock();
        if st.pages.free(phys) {
            st.main_mem.remove(&phys);
        } else {
            warn!("IOP: unmap of unknown DMA page {phys:#x}");
        }
    }

    fn cache_writeback(&self, phys: u32, data: &[u8]) {
        let mut st = self.state.lock();
        assert!(
            write_main(&mut st, phys, data),
            "writeback outside mapped DMA memory: {phys:#x}+{:#x}",
            data.len()
        );
    }

    fn cache_invalidate(&self, phys: u32, data: &mut [u8]) {
        let st = self.state.lock();
        assert!(
            read_main(&st, phys, data),
            "invalidate outside mapped DMA memory: {phys:#x}+{:#x}",
            data.len()
        );
    }

    fn set_irq_handler(&self, handler: Option<IrqHandler>) {
        let installed = handler.is_some();
        *self.irq.write() = handler;
        if installed {
            self.pump();
        }
    }

    fn bus_type(&self) -> BusType {
        BusType::Software
    }
}
