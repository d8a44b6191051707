//! Driver context
//!
//! [`Sif`] owns every piece of interconnect state: channel buffers, handler
//! tables, mailbox, client table and the dispatcher thread. Independent
//! instances share nothing, so tests run several side by side.
//!
//! # Startup
//!
//! ```text
//! disable channels ─▶ allocate buffers ─▶ handshake ─▶ built-in handlers
//!   ─▶ re-arm SIF0 ─▶ interrupt hook + dispatcher
//!   ─▶ INIT_CMD(0, sif0 address) ─▶ INIT_CMD(1) ─▶ wait mailbox[0] ≠ 0
//! ```
//!
//! A failure at any step tears down what was set up, in reverse.

use crate::backend::{IrqHandler, SifBus};
use crate::clock::{millis, poll_until, Clock, SystemClock};
use crate::codec::CommandCodec;
use crate::config::SifConfig;
use crate::dispatch::{Dispatcher, InboundFrame, Registry};
use crate::dma::{disable_channels, ChannelManager};
use crate::error::{Result, SifError};
use crate::handshake::{BootState, Handshake};
use crate::rpc::{self, ClientTable, RpcClient, RpcEndpoint};
use crate::sregs::RegisterBank;
use bytes::Buf;
use parking_lot::{Mutex, RwLock};
use sif_chip::cmd::{self, SREG_RPCINIT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Receives record ids relayed by `RPC_IRQ`
pub type IrqSink = Arc<dyn Fn(u32) + Send + Sync>;

/// A running interconnect
pub struct Sif {
    bus: Arc<dyn SifBus>,
    clock: Arc<dyn Clock>,
    config: SifConfig,
    codec: Arc<CommandCodec>,
    registry: Arc<Registry>,
    sregs: Arc<RegisterBank>,
    rpc: RpcEndpoint,
    irq_sink: Arc<RwLock<Option<IrqSink>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    running: AtomicBool,
}

impl std::fmt::Debug for Sif {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sif")
            .field("bus", &self.bus.bus_type())
            .field("state", &self.state())
            .field("iop_buffer", &format_args!("{:#x}", self.iop_buffer()))
            .field("handlers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Sif {
    /// Bring up the interconnect with wall-clock timing
    ///
    /// # Errors
    ///
    /// See [`Sif::init_with_clock`].
    pub fn init(bus: Arc<dyn SifBus>, config: SifConfig) -> Result<Self> {
        Self::init_with_clock(bus, config, Arc::new(SystemClock::new()))
    }

    /// Bring up the interconnect, timing every bounded wait with `clock`
    ///
    /// # Errors
    ///
    /// - `ResourceExhausted` if the channel buffers cannot be allocated
    /// - `InvalidArgument` for oversized reset arguments
    /// - `Io` if the handshake or RPC initialisation times out
    /// - any transmission error
    ///
    /// Nothing stays allocated or registered after an error.
    pub fn init_with_clock(
        bus: Arc<dyn SifBus>,
        config: SifConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        info!("Initialising SIF on {}", bus.bus_type());

        disable_channels(bus.as_ref());
        let channels = ChannelManager::new(Arc::clone(&bus), Arc::clone(&clock), config.dma)?;
        let codec = Arc::new(CommandCodec::new(Arc::new(channels)));
        let clients = Arc::new(ClientTable::new());
        let rpc = RpcEndpoint::new(
            Arc::clone(&bus),
            Arc::clone(&codec),
            Arc::clone(&clients),
            config.rpc_timeout,
        );

        let sif = Self {
            bus,
            clock,
            config,
            codec,
            registry: Arc::new(Registry::new()),
            sregs: Arc::new(RegisterBank::new()),
            rpc,
            irq_sink: Arc::new(RwLock::new(None)),
            dispatcher: Mutex::new(None),
            running: AtomicBool::new(true),
        };

        // On error `sif` drops here and tears itself down.
        sif.start(&clients)?;

        info!("SIF ready: IOP buffer {:#x}", sif.iop_buffer());
        Ok(sif)
    }

    fn start(&self, clients: &Arc<ClientTable>) -> Result<()> {
        Handshake::new(
            self.bus.as_ref(),
            &self.codec,
            self.clock.as_ref(),
            &self.config,
        )
        .run()?;

        self.register_builtin_handlers(clients)?;
        self.codec.channels().sif0_reset();
        self.start_dispatch(clients)?;

        let sif0 = self.codec.channels().sif0_phys();
        self.codec.send_opt(cmd::INIT_CMD, 0, &sif0.to_le_bytes())?;
        self.codec.send_opt(cmd::INIT_CMD, 1, &[])?;

        let ok = poll_until(
            self.clock.as_ref(),
            self.config.handshake_timeout,
            self.config.handshake_poll,
            || self.sregs.read(SREG_RPCINIT).is_ok_and(|v| v != 0),
        );
        if !ok {
            return Err(SifError::io(format!(
                "RPC initialisation not acknowledged within {}ms",
                millis(self.config.handshake_timeout)
            )));
        }
        debug!("RPC initialised");
        Ok(())
    }

    fn register_builtin_handlers(&self, clients: &Arc<ClientTable>) -> Result<()> {
        let sregs = Arc::clone(&self.sregs);
        self.registry.register(cmd::WRITE_SREG, move |frame| {
            let mut data = frame.expect_len(8)?;
            let index = data.get_u32_le() as usize;
            let value = data.get_i32_le();
            sregs.write(index, value)
        })?;

        let clients = Arc::clone(clients);
        self.registry
            .register(cmd::RPC_END, move |frame| rpc::handle_rpc_end(&clients, frame))?;

        let codec = Arc::clone(&self.codec);
        self.registry
            .register(cmd::RPC_BIND, move |frame| rpc::handle_rpc_bind(&codec, frame))?;

        let sink = Arc::clone(&self.irq_sink);
        self.registry.register(cmd::RPC_IRQ, move |frame| {
            let irq = rpc::relayed_irq(frame)?;
            match sink.read().as_ref() {
                Some(sink) => sink(irq),
                None => debug!("No IRQ sink for relayed IRQ {irq}"),
            }
            Ok(())
        })
    }

    fn start_dispatch(&self, clients: &Arc<ClientTable>) -> Result<()> {
        let clients = Arc::clone(clients);
        let dispatcher = Dispatcher::spawn(Arc::clone(&self.registry), move |reason| {
            clients.fail_all(reason);
        })?;
        let sender = dispatcher.sender();
        let channels = Arc::downgrade(self.codec.channels());

        let hook: IrqHandler = Arc::new(move || {
            let Some(channels) = channels.upgrade() else {
                return;
            };
            if let Some(raw) = channels.receive_frame() {
                if !sender.push(raw) {
                    debug!("Dispatcher stopped, inbound frame discarded");
                }
            }
        });

        *self.dispatcher.lock() = Some(dispatcher);
        self.bus.set_irq_handler(Some(hook));
        Ok(())
    }

    /// Tear everything down; later operations fail with `InvalidState`
    ///
    /// Receive pages parked by timed-out calls are released here. Runs at
    /// most once; also run on drop.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.bus.set_irq_handler(None);
        let dispatcher = self.dispatcher.lock().take();
        if let Some(mut dispatcher) = dispatcher {
            dispatcher.stop();
        }
        self.registry.clear();
        self.codec.channels().disable();
        self.rpc.shutdown();
        info!("SIF shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(SifError::invalid_state("SIF is shut down"));
        }
        match self.fault() {
            Some(reason) => Err(SifError::protocol_violation(reason)),
            None => Ok(()),
        }
    }

    /// Lifecycle state
    ///
    /// `Ready` while running, `Failed` once the dispatcher halted on a
    /// protocol violation, `Idle` after shutdown.
    pub fn state(&self) -> BootState {
        if !self.running.load(Ordering::Acquire) {
            BootState::Idle
        } else if self.fault().is_some() {
            BootState::Failed
        } else {
            BootState::Ready
        }
    }

    /// The protocol violation that halted inbound dispatch, if any
    pub fn fault(&self) -> Option<String> {
        self.dispatcher.lock().as_ref().and_then(Dispatcher::fault)
    }

    /// IOP command receive address
    pub fn iop_buffer(&self) -> u32 {
        self.codec.iop_buffer()
    }

    /// Mailbox register `index`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for `index` ≥ 32.
    pub fn register(&self, index: usize) -> Result<i32> {
        self.sregs.read(index)
    }

    /// Install or remove the `RPC_IRQ` sink
    pub fn set_irq_sink(&self, sink: Option<IrqSink>) {
        *self.irq_sink.write() = sink;
    }

    /// Install a handler for inbound `cmd_id`, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an id outside both handler tables.
    pub fn register_handler(
        &self,
        cmd_id: u32,
        handler: impl Fn(&InboundFrame) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        self.registry.register(cmd_id, handler)
    }

    /// Whether a handler is installed for `cmd_id`
    pub fn handler_registered(&self, cmd_id: u32) -> bool {
        self.registry.is_registered(cmd_id)
    }

    /// Send a command, optionally preceded by a bulk transfer to `bulk.0`
    ///
    /// # Errors
    ///
    /// See [`CommandCodec::send_command`]; `InvalidState` after shutdown and
    /// `ProtocolViolation` once inbound dispatch has halted.
    pub fn send_command(
        &self,
        cmd_id: u32,
        opt: u32,
        inline: &[u8],
        bulk: Option<(u32, &[u8])>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.codec.send_command(cmd_id, opt, inline, bulk)
    }

    /// Bind `client` to `service_id`
    ///
    /// # Errors
    ///
    /// See [`RpcEndpoint::bind`]; `InvalidState` after shutdown and
    /// `ProtocolViolation` once inbound dispatch has halted.
    pub fn bind(&self, client: &mut RpcClient, service_id: u32) -> Result<()> {
        self.ensure_running()?;
        self.rpc.bind(client, service_id)
    }

    /// Call procedure `rpc_id` on a bound client
    ///
    /// # Errors
    ///
    /// See [`RpcEndpoint::call`]; `InvalidState` after shutdown and
    /// `ProtocolViolation` once inbound dispatch has halted.
    pub fn call(
        &self,
        client: &mut RpcClient,
        rpc_id: u32,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<()> {
        self.ensure_running()?;
        self.rpc.call(client, rpc_id, request, response)
    }

    /// Release a client's receive page and token
    pub fn unbind(&self, client: &mut RpcClient) {
        self.rpc.unbind(client);
    }

    /// The bus this instance drives
    pub fn bus(&self) -> &Arc<dyn SifBus> {
        &self.bus
    }
}

impl Drop for Sif {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            debug!("SIF dropped while running, tearing down");
        }
        self.shutdown();
    }
}
