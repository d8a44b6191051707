//! Remote procedure calls to IOP services
//!
//! ```text
//! main                                  IOP
//!  │ RPC_BIND {client, sid}  ─────────▶ │
//!  │ ◀───────── RPC_END {client, BIND, server, server_buffer}
//!  │ bulk request ─▶ server_buffer      │
//!  │ RPC_CALL {client, rpc_id, recv…} ▶ │
//!  │ ◀──── response ─▶ receive page     │
//!  │ ◀───────── RPC_END {client, CALL}  │
//! ```
//!
//! Clients are named on the wire by an opaque `u64` token. The token resolves
//! through a [`ClientTable`] of weak references, so an inbound completion for
//! a client that no longer exists is dropped instead of touching freed state.

use crate::backend::SifBus;
use crate::clock::millis;
use crate::codec::CommandCodec;
use crate::dispatch::InboundFrame;
use crate::dma::DmaBuffer;
use crate::error::{Result, SifError};
use bytes::{Buf, BufMut};
use parking_lot::{Condvar, Mutex};
use sif_chip::cmd;
use sif_chip::frame::PAGE_SIZE;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bind Request size
pub const BIND_REQUEST_SIZE: usize = 12;
/// Call Request size
pub const CALL_REQUEST_SIZE: usize = 32;
/// Request End size
pub const REQUEST_END_SIZE: usize = 40;

/// `RPC_BIND` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRequest {
    /// Client token echoed in the completion
    pub client_ref: u64,
    /// Service to resolve
    pub service_id: u32,
}

impl BindRequest {
    /// Serialize
    pub fn encode(&self) -> [u8; BIND_REQUEST_SIZE] {
        let mut out = [0u8; BIND_REQUEST_SIZE];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.client_ref);
        buf.put_u32_le(self.service_id);
        out
    }

    /// Parse
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if `bytes` is short.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        check_len("bind request", bytes, BIND_REQUEST_SIZE)?;
        Ok(Self {
            client_ref: bytes.get_u64_le(),
            service_id: bytes.get_u32_le(),
        })
    }
}

/// `RPC_CALL` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRequest {
    /// Client token echoed in the completion
    pub client_ref: u64,
    /// Procedure number within the service
    pub rpc_id: u32,
    /// Bulk request size
    pub send_size: u32,
    /// Physical address of the client's receive page
    pub recv_addr: u32,
    /// Bytes the server should return
    pub recv_size: u32,
    /// Always 1
    pub recv_mode: u32,
    /// Server address from the bind
    pub server: u32,
}

impl CallRequest {
    /// Serialize
    pub fn encode(&self) -> [u8; CALL_REQUEST_SIZE] {
        let mut out = [0u8; CALL_REQUEST_SIZE];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.client_ref);
        buf.put_u32_le(self.rpc_id);
        buf.put_u32_le(self.send_size);
        buf.put_u32_le(self.recv_addr);
        buf.put_u32_le(self.recv_size);
        buf.put_u32_le(self.recv_mode);
        buf.put_u32_le(self.server);
        out
    }

    /// Parse
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if `bytes` is short.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        check_len("call request", bytes, CALL_REQUEST_SIZE)?;
        Ok(Self {
            client_ref: bytes.get_u64_le(),
            rpc_id: bytes.get_u32_le(),
            send_size: bytes.get_u32_le(),
            recv_addr: bytes.get_u32_le(),
            recv_size: bytes.get_u32_le(),
            recv_mode: bytes.get_u32_le(),
            server: bytes.get_u32_le(),
        })
    }
}

/// `RPC_END` payload, also carried by `RPC_IRQ`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestEnd {
    /// Record id (the IRQ number for `RPC_IRQ`)
    pub rec_id: u32,
    /// Sender's packet address
    pub origin_ref: u32,
    /// Procedure number
    pub rpc_id: u32,
    /// Client token from the request
    pub client_ref: u64,
    /// Command id of the request being completed
    pub client_id: u32,
    /// Server address (bind completion only)
    pub server: u32,
    /// Server buffer address (bind completion only)
    pub server_buffer: u32,
    /// Client buffer token
    pub client_buffer_ref: u64,
}

impl RequestEnd {
    /// Serialize
    pub fn encode(&self) -> [u8; REQUEST_END_SIZE] {
        let mut out = [0u8; REQUEST_END_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.rec_id);
        buf.put_u32_le(self.origin_ref);
        buf.put_u32_le(self.rpc_id);
        buf.put_u64_le(self.client_ref);
        buf.put_u32_le(self.client_id);
        buf.put_u32_le(self.server);
        buf.put_u32_le(self.server_buffer);
        buf.put_u64_le(self.client_buffer_ref);
        out
    }

    /// Parse
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if `bytes` is short.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        check_len("request end", bytes, REQUEST_END_SIZE)?;
        Ok(Self {
            rec_id: bytes.get_u32_le(),
            origin_ref: bytes.get_u32_le(),
            rpc_id: bytes.get_u32_le(),
            client_ref: bytes.get_u64_le(),
            client_id: bytes.get_u32_le(),
            server: bytes.get_u32_le(),
            server_buffer: bytes.get_u32_le(),
            client_buffer_ref: bytes.get_u64_le(),
        })
    }
}

fn check_len(what: &str, bytes: &[u8], len: usize) -> Result<()> {
    if bytes.len() < len {
        return Err(SifError::protocol_violation(format!(
            "{what} truncated: {} of {len} bytes",
            bytes.len()
        )));
    }
    Ok(())
}

/// Server addresses learned from a bind completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Binding {
    /// Server address
    pub server: u32,
    /// Server buffer address
    pub server_buffer: u32,
}

/// Outcome of waiting on a [`Completion`]
#[derive(Debug, Clone, PartialEq, Eq)]
enum Wait {
    Done,
    TimedOut,
    Aborted(String),
}

#[derive(Debug, Default)]
struct Signal {
    done: bool,
    aborted: Option<String>,
}

/// One-shot, single-waiter completion
///
/// An abort is sticky: every later wait returns it at once.
#[derive(Debug, Default)]
struct Completion {
    signal: Mutex<Signal>,
    cond: Condvar,
}

impl Completion {
    fn reset(&self) {
        self.signal.lock().done = false;
    }

    fn signal(&self) {
        self.signal.lock().done = true;
        self.cond.notify_one();
    }

    fn abort(&self, reason: &str) {
        let mut signal = self.signal.lock();
        if signal.aborted.is_none() {
            signal.aborted = Some(reason.to_owned());
        }
        self.cond.notify_all();
    }

    /// Wait for the signal and consume it
    fn wait(&self, timeout: Option<Duration>) -> Wait {
        let mut signal = self.signal.lock();
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        while !signal.done && signal.aborted.is_none() {
            match deadline {
                None => self.cond.wait(&mut signal),
                Some(deadline) => {
                    if self.cond.wait_until(&mut signal, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        if let Some(reason) = signal.aborted.clone() {
            Wait::Aborted(reason)
        } else if std::mem::replace(&mut signal.done, false) {
            Wait::Done
        } else {
            Wait::TimedOut
        }
    }

    fn try_take(&self) -> bool {
        std::mem::replace(&mut self.signal.lock().done, false)
    }
}

/// State shared between a client and the inbound handlers
#[derive(Debug, Default)]
pub struct ClientSlot {
    completion: Completion,
    binding: Mutex<Binding>,
}

impl ClientSlot {
    fn complete_bind(&self, binding: Binding) {
        *self.binding.lock() = binding;
        self.completion.signal();
    }

    fn binding(&self) -> Binding {
        *self.binding.lock()
    }
}

#[derive(Debug, Default)]
struct Entries {
    live: HashMap<u64, Weak<ClientSlot>>,
    /// Receive pages of timed-out calls, held until the IOP completes them
    parked: HashMap<u64, DmaBuffer>,
    fault: Option<String>,
}

/// Token → client resolution for inbound completions
///
/// Also holds the receive page of every call that timed out. The IOP still
/// owes that page a DMA write, so it is only released once the late
/// `RPC_END` arrives or the table is shut down.
#[derive(Debug)]
pub struct ClientTable {
    next: AtomicU64,
    entries: Mutex<Entries>,
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientTable {
    /// Empty table; tokens start at 1
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Assign a token to `slot`
    ///
    /// After [`ClientTable::fail_all`] the slot is aborted straight away.
    pub fn insert(&self, slot: &Arc<ClientSlot>) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        entries.live.retain(|_, weak| weak.strong_count() > 0);
        entries.live.insert(token, Arc::downgrade(slot));
        if let Some(reason) = &entries.fault {
            slot.completion.abort(reason);
        }
        token
    }

    /// Forget `token`
    pub fn remove(&self, token: u64) {
        self.entries.lock().live.remove(&token);
    }

    /// Live client for `token`
    pub fn lookup(&self, token: u64) -> Option<Arc<ClientSlot>> {
        self.entries.lock().live.get(&token).and_then(Weak::upgrade)
    }

    /// Live entries
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .live
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Whether no client is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive pages waiting on a late completion
    pub fn parked(&self) -> usize {
        self.entries.lock().parked.len()
    }

    fn park(&self, token: u64, page: DmaBuffer) {
        debug!("Parking receive page {:#x} of client {token}", page.phys());
        self.entries.lock().parked.insert(token, page);
    }

    fn unpark(&self, token: u64) -> Option<DmaBuffer> {
        self.entries.lock().parked.remove(&token)
    }

    /// Drop `token` for good
    ///
    /// A parked page whose completion already reached `slot` is released;
    /// otherwise it stays parked for the completion still in flight.
    fn abandon(&self, token: u64, slot: &ClientSlot) {
        let released = {
            let mut entries = self.entries.lock();
            entries.live.remove(&token);
            if slot.completion.try_take() {
                entries.parked.remove(&token)
            } else {
                None
            }
        };
        drop(released);
    }

    /// Deliver a completion to `token`
    ///
    /// Returns `false` if the token names neither a live client nor a
    /// parked page.
    fn complete(&self, token: u64, deliver: impl FnOnce(&ClientSlot)) -> bool {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.live.get(&token).and_then(Weak::upgrade) {
            deliver(slot.as_ref());
            return true;
        }
        let Some(page) = entries.parked.remove(&token) else {
            return false;
        };
        drop(entries);
        debug!("Late completion for client {token}, releasing its receive page");
        drop(page);
        true
    }

    /// Abort every live client and every later insert with `reason`
    pub fn fail_all(&self, reason: &str) {
        let mut entries = self.entries.lock();
        if entries.fault.is_none() {
            entries.fault = Some(reason.to_owned());
        }
        for slot in entries.live.values().filter_map(Weak::upgrade) {
            slot.completion.abort(reason);
        }
    }

    /// The reason passed to [`ClientTable::fail_all`], if any
    pub fn fault(&self) -> Option<String> {
        self.entries.lock().fault.clone()
    }

    /// Release every parked page
    pub fn release_parked(&self) {
        let parked = std::mem::take(&mut self.entries.lock().parked);
        if !parked.is_empty() {
            debug!("Releasing {} parked receive pages", parked.len());
        }
    }
}

/// Client lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Never bound, or unbound
    Unbound,
    /// Bind request outstanding
    Binding,
    /// Ready for calls
    Bound,
    /// Call outstanding
    Calling,
    /// A call timed out; its completion has not arrived yet
    Stale,
    /// Bind failed
    Failed,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Caller-owned RPC client
///
/// Bind and call take `&mut RpcClient`, so one client never has two
/// requests in flight.
#[derive(Debug)]
pub struct RpcClient {
    slot: Arc<ClientSlot>,
    token: Option<u64>,
    state: ClientState,
    service_id: u32,
    recv: Option<DmaBuffer>,
    timeout: Option<Duration>,
    table: Option<Arc<ClientTable>>,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    /// Unbound client using the driver's default timeout
    pub fn new() -> Self {
        Self {
            slot: Arc::new(ClientSlot::default()),
            token: None,
            state: ClientState::Unbound,
            service_id: 0,
            recv: None,
            timeout: None,
            table: None,
        }
    }

    /// Bound bind and call waits for this client
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Current state
    pub const fn state(&self) -> ClientState {
        self.state
    }

    /// Service this client is bound to (0 if none)
    pub const fn service_id(&self) -> u32 {
        self.service_id
    }

    /// Server addresses, set only by a bind completion
    pub fn binding(&self) -> Binding {
        self.slot.binding()
    }

    /// Wire token while registered
    pub const fn token(&self) -> Option<u64> {
        self.token
    }

    /// Receive page capacity (0 when unbound or stale)
    pub fn recv_capacity(&self) -> usize {
        self.recv.as_ref().map_or(0, DmaBuffer::size)
    }

    fn release(&mut self) {
        if let (Some(token), Some(table)) = (self.token.take(), self.table.as_ref()) {
            table.abandon(token, &self.slot);
        }
        self.recv = None;
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.release();
    }
}

/// RPC operations over a running interconnect
#[derive(Debug)]
pub struct RpcEndpoint {
    bus: Arc<dyn SifBus>,
    codec: Arc<CommandCodec>,
    clients: Arc<ClientTable>,
    default_timeout: Option<Duration>,
}

impl RpcEndpoint {
    /// Endpoint over `codec` resolving completions through `clients`
    pub const fn new(
        bus: Arc<dyn SifBus>,
        codec: Arc<CommandCodec>,
        clients: Arc<ClientTable>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            bus,
            codec,
            clients,
            default_timeout,
        }
    }

    fn timeout_for(&self, client: &RpcClient) -> Option<Duration> {
        client.timeout.or(self.default_timeout)
    }

    /// Resolve `service_id` and bind `client` to it
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the client is already bound
    /// - `ResourceExhausted` if the receive page cannot be allocated
    /// - `Io` if the IOP has no such service
    /// - `Timeout` if a client timeout is set and expires
    /// - any transmission error
    pub fn bind(&self, client: &mut RpcClient, service_id: u32) -> Result<()> {
        match client.state {
            ClientState::Unbound | ClientState::Failed => {}
            state => {
                return Err(SifError::invalid_state(format!(
                    "bind on a {state} client"
                )))
            }
        }

        let recv = DmaBuffer::alloc(&self.bus, PAGE_SIZE)?;

        // A fresh slot drops any completion still addressed to an old token.
        client.slot = Arc::new(ClientSlot::default());
        let token = self.clients.insert(&client.slot);
        client.token = Some(token);
        client.table = Some(Arc::clone(&self.clients));
        client.service_id = service_id;
        client.state = ClientState::Binding;

        let request = BindRequest {
            client_ref: token,
            service_id,
        };
        debug!("Binding service {service_id:#x} as client {token}");

        let outcome = self
            .codec
            .send(cmd::RPC_BIND, &request.encode())
            .and_then(|()| self.await_completion(client, "RPC bind"));
        if let Err(e) = outcome {
            self.fail_bind(client);
            return Err(e);
        }

        let binding = client.slot.binding();
        if binding.server == 0 {
            self.fail_bind(client);
            return Err(SifError::io(format!(
                "no server for service {service_id:#x}"
            )));
        }

        client.recv = Some(recv);
        client.state = ClientState::Bound;
        info!(
            "Bound service {service_id:#x}: server={:#x}, buffer={:#x}",
            binding.server, binding.server_buffer
        );
        Ok(())
    }

    fn fail_bind(&self, client: &mut RpcClient) {
        if let Some(token) = client.token.take() {
            self.clients.remove(token);
        }
        client.state = ClientState::Failed;
    }

    fn await_completion(&self, client: &RpcClient, what: &'static str) -> Result<()> {
        let timeout = self.timeout_for(client);
        match client.slot.completion.wait(timeout) {
            Wait::Done => Ok(()),
            Wait::TimedOut => Err(SifError::Timeout {
                what,
                duration_ms: timeout.map_or(u64::MAX, millis),
            }),
            Wait::Aborted(reason) => Err(SifError::protocol_violation(format!(
                "{what} abandoned: {reason}"
            ))),
        }
    }

    /// Call procedure `rpc_id` with `request`, filling `response`
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the client is bound
    /// - `Busy` if an earlier timed-out call is still outstanding
    /// - `InvalidArgument` if `response` exceeds the receive page or the
    ///   request does not fit one transfer
    /// - `Timeout` if a client timeout is set and expires; the client then
    ///   stays stale until the late completion arrives
    /// - `ProtocolViolation` if inbound dispatch halted while waiting
    pub fn call(
        &self,
        client: &mut RpcClient,
        rpc_id: u32,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<()> {
        match client.state {
            ClientState::Bound => {}
            ClientState::Stale => {
                if client.slot.completion.try_take() {
                    debug!("Late completion arrived, client usable again");
                    if let Some(token) = client.token {
                        client.recv = self.clients.unpark(token);
                    }
                    client.state = ClientState::Bound;
                } else {
                    return Err(SifError::Busy {
                        what: "RPC client",
                        duration_ms: self.timeout_for(client).map_or(0, millis),
                    });
                }
            }
            state => {
                return Err(SifError::invalid_state(format!(
                    "call on a {state} client"
                )))
            }
        }

        let (Some(token), Some(recv)) = (client.token, client.recv.as_ref()) else {
            return Err(SifError::invalid_state("bound client without receive page"));
        };
        if response.len() > recv.size() {
            return Err(SifError::invalid_argument(format!(
                "response of {} bytes exceeds the {} byte receive page",
                response.len(),
                recv.size()
            )));
        }

        let binding = client.slot.binding();
        let to_u32 = |n: usize| {
            u32::try_from(n).map_err(|_| SifError::invalid_argument("RPC size exceeds 32 bits"))
        };
        let call = CallRequest {
            client_ref: token,
            rpc_id,
            send_size: to_u32(request.len())?,
            recv_addr: recv.phys(),
            recv_size: to_u32(response.len())?,
            recv_mode: 1,
            server: binding.server,
        };

        client.slot.completion.reset();
        client.state = ClientState::Calling;

        if let Err(e) = self.codec.send_command(
            cmd::RPC_CALL,
            0,
            &call.encode(),
            Some((binding.server_buffer, request)),
        ) {
            client.state = ClientState::Bound;
            return Err(e);
        }

        if let Err(e) = self.await_completion(client, "RPC call") {
            warn!("RPC call {rpc_id} on service {:#x}: {e}", client.service_id);
            // The IOP may still write the response into the page.
            if let Some(page) = client.recv.take() {
                self.clients.park(token, page);
            }
            client.state = ClientState::Stale;
            return Err(e);
        }

        if let Some(recv) = client.recv.as_mut() {
            recv.invalidate(0..response.len());
            response.copy_from_slice(&recv.as_slice()[..response.len()]);
        }
        client.state = ClientState::Bound;
        Ok(())
    }

    /// Release the receive page and the client token
    ///
    /// No packet is exchanged with the IOP. A stale client's page stays
    /// parked until its late completion arrives.
    pub fn unbind(&self, client: &mut RpcClient) {
        client.release();
        client.slot = Arc::new(ClientSlot::default());
        client.service_id = 0;
        client.state = ClientState::Unbound;
    }

    /// Release every parked receive page
    ///
    /// Only sound once the IOP can no longer write into them.
    pub fn shutdown(&self) {
        self.clients.release_parked();
    }
}

/// `RPC_END`: complete a bind or call
///
/// # Errors
///
/// Returns `ProtocolViolation` for a truncated packet or a discriminator
/// that is neither `RPC_BIND` nor `RPC_CALL`.
pub fn handle_rpc_end(clients: &ClientTable, frame: &InboundFrame) -> Result<()> {
    let end = RequestEnd::decode(frame.expect_len(REQUEST_END_SIZE)?)?;

    if end.client_id != cmd::RPC_BIND && end.client_id != cmd::RPC_CALL {
        return Err(SifError::protocol_violation(format!(
            "RPC end for unknown request {:#x}",
            end.client_id
        )));
    }

    let delivered = clients.complete(end.client_ref, |slot| {
        if end.client_id == cmd::RPC_BIND {
            slot.complete_bind(Binding {
                server: end.server,
                server_buffer: end.server_buffer,
            });
        } else {
            slot.completion.signal();
        }
    });
    if !delivered {
        warn!(
            "Dropping {} completion for unknown client {}",
            cmd::name(end.client_id),
            end.client_ref
        );
    }
    Ok(())
}

/// `RPC_BIND` from the IOP: answer with a bind completion for its client
///
/// # Errors
///
/// Returns `ProtocolViolation` for a truncated packet. A failed reply is
/// logged, not returned.
pub fn handle_rpc_bind(codec: &CommandCodec, frame: &InboundFrame) -> Result<()> {
    let bind = BindRequest::decode(frame.expect_len(BIND_REQUEST_SIZE)?)?;
    let reply = RequestEnd {
        client_ref: bind.client_ref,
        client_id: cmd::RPC_BIND,
        ..RequestEnd::default()
    };
    if let Err(e) = codec.send(cmd::RPC_END, &reply.encode()) {
        warn!("Reply to IOP bind of {:#x} failed: {e}", bind.service_id);
    }
    Ok(())
}

/// `RPC_IRQ`: the record id of the relayed interrupt
///
/// # Errors
///
/// Returns `ProtocolViolation` if the packet is shorter than one word.
pub fn relayed_irq(frame: &InboundFrame) -> Result<u32> {
    let mut bytes = frame.expect_len(4)?;
    Ok(bytes.get_u32_le())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SoftwareIop;
    use crate::codec::CommandHeader;
    use sif_chip::frame::{CMD_HEADER_SIZE, CMD_PACKET_MAX};

    fn frame(cmd_id: u32, data: &[u8]) -> InboundFrame {
        let header = CommandHeader::new(cmd_id, 0, data.len(), None).unwrap();
        let mut raw = [0u8; CMD_PACKET_MAX];
        raw[..CMD_HEADER_SIZE].copy_from_slice(&header.encode().unwrap());
        raw[CMD_HEADER_SIZE..CMD_HEADER_SIZE + data.len()].copy_from_slice(data);
        InboundFrame::decode(&raw).unwrap()
    }

    #[test]
    fn packet_sizes() {
        let bind = BindRequest {
            client_ref: 0x1122_3344_5566_7788,
            service_id: 1,
        };
        let bytes = bind.encode();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(BindRequest::decode(&bytes).unwrap(), bind);

        let call = CallRequest {
            client_ref: 7,
            rpc_id: 2,
            send_size: 3,
            recv_addr: 0x1000,
            recv_size: 4,
            recv_mode: 1,
            server: 0x5000,
        };
        assert_eq!(CallRequest::decode(&call.encode()).unwrap(), call);

        let end = RequestEnd {
            rec_id: 1,
            client_ref: 9,
            client_id: cmd::RPC_CALL,
            client_buffer_ref: 3,
            ..RequestEnd::default()
        };
        let bytes = end.encode();
        assert_eq!(&bytes[12..20], &9u64.to_le_bytes());
        assert_eq!(&bytes[20..24], &cmd::RPC_CALL.to_le_bytes());
        assert_eq!(RequestEnd::decode(&bytes).unwrap(), end);
        assert!(RequestEnd::decode(&bytes[..39]).is_err());
    }

    #[test]
    fn bind_completion_sets_server_fields() {
        let clients = ClientTable::new();
        let slot = Arc::new(ClientSlot::default());
        let token = clients.insert(&slot);

        let end = RequestEnd {
            client_ref: token,
            client_id: cmd::RPC_BIND,
            server: 0x1_2000,
            server_buffer: 0x1_3000,
            ..RequestEnd::default()
        };
        handle_rpc_end(&clients, &frame(cmd::RPC_END, &end.encode())).unwrap();

        assert!(slot.completion.try_take());
        assert_eq!(
            slot.binding(),
            Binding {
                server: 0x1_2000,
                server_buffer: 0x1_3000
            }
        );
    }

    #[test]
    fn call_completion_never_touches_server_fields() {
        let clients = ClientTable::new();
        let slot = Arc::new(ClientSlot::default());
        let token = clients.insert(&slot);
        slot.complete_bind(Binding {
            server: 1,
            server_buffer: 2,
        });
        slot.completion.reset();

        let end = RequestEnd {
            client_ref: token,
            client_id: cmd::RPC_CALL,
            server: 0xDEAD,
            server_buffer: 0xBEEF,
            ..RequestEnd::default()
        };
        handle_rpc_end(&clients, &frame(cmd::RPC_END, &end.encode())).unwrap();

        assert!(slot.completion.try_take());
        assert_eq!(slot.binding().server, 1);
        assert_eq!(slot.binding().server_buffer, 2);
    }

    #[test]
    fn unknown_discriminator_is_fatal() {
        let clients = ClientTable::new();
        let end = RequestEnd {
            client_id: cmd::RPC_IRQ,
            ..RequestEnd::default()
        };
        let err = handle_rpc_end(&clients, &frame(cmd::RPC_END, &end.encode())).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn completion_for_dead_client_is_dropped() {
        let clients = ClientTable::new();
        let slot = Arc::new(ClientSlot::default());
        let token = clients.insert(&slot);
        drop(slot);
        assert!(clients.lookup(token).is_none());

        let end = RequestEnd {
            client_ref: token,
            client_id: cmd::RPC_CALL,
            ..RequestEnd::default()
        };
        handle_rpc_end(&clients, &frame(cmd::RPC_END, &end.encode())).unwrap();
        assert!(clients.is_empty());
    }

    #[test]
    fn completions_reach_only_their_client() {
        let clients = ClientTable::new();
        let a = Arc::new(ClientSlot::default());
        let b = Arc::new(ClientSlot::default());
        let ta = clients.insert(&a);
        let _tb = clients.insert(&b);

        let end = RequestEnd {
            client_ref: ta,
            client_id: cmd::RPC_CALL,
            ..RequestEnd::default()
        };
        handle_rpc_end(&clients, &frame(cmd::RPC_END, &end.encode())).unwrap();
        assert!(a.completion.try_take());
        assert!(!b.completion.try_take());
    }

    #[test]
    fn completion_wait_times_out() {
        let c = Completion::default();
        assert_eq!(c.wait(Some(Duration::from_millis(10))), Wait::TimedOut);
        c.signal();
        assert_eq!(c.wait(Some(Duration::from_millis(10))), Wait::Done);
        assert!(!c.try_take());
    }

    #[test]
    fn abort_wakes_an_unbounded_wait() {
        let c = Arc::new(Completion::default());
        let waiter = {
            let c = Arc::clone(&c);
            std::thread::spawn(move || c.wait(None))
        };
        std::thread::sleep(Duration::from_millis(20));
        c.abort("dispatch halted");
        assert_eq!(
            waiter.join().unwrap(),
            Wait::Aborted("dispatch halted".into())
        );
        // Sticky, even over a later signal.
        c.signal();
        assert_eq!(c.wait(None), Wait::Aborted("dispatch halted".into()));
    }

    #[test]
    fn fail_all_aborts_live_and_future_clients() {
        let clients = ClientTable::new();
        let live = Arc::new(ClientSlot::default());
        clients.insert(&live);

        clients.fail_all("bad index");
        assert_eq!(clients.fault().as_deref(), Some("bad index"));
        assert!(matches!(live.completion.wait(None), Wait::Aborted(r) if r == "bad index"));

        let late = Arc::new(ClientSlot::default());
        clients.insert(&late);
        assert!(matches!(
            late.completion.wait(Some(Duration::from_secs(5))),
            Wait::Aborted(_)
        ));
    }

    #[test]
    fn parked_page_waits_for_its_late_completion() {
        let iop = Arc::new(SoftwareIop::new());
        let bus: Arc<dyn SifBus> = iop.clone();
        let clients = ClientTable::new();
        let slot = Arc::new(ClientSlot::default());
        let token = clients.insert(&slot);

        clients.park(token, DmaBuffer::alloc(&bus, PAGE_SIZE).unwrap());
        clients.abandon(token, &slot);
        assert!(clients.lookup(token).is_none());
        assert_eq!(clients.parked(), 1);
        assert_eq!(iop.mapped_pages(), 1);

        let end = RequestEnd {
            client_ref: token,
            client_id: cmd::RPC_CALL,
            ..RequestEnd::default()
        };
        handle_rpc_end(&clients, &frame(cmd::RPC_END, &end.encode())).unwrap();
        assert_eq!(clients.parked(), 0);
        assert_eq!(iop.mapped_pages(), 0);
    }

    #[test]
    fn abandon_after_completion_releases_at_once() {
        let iop = Arc::new(SoftwareIop::new());
        let bus: Arc<dyn SifBus> = iop.clone();
        let clients = ClientTable::new();
        let slot = Arc::new(ClientSlot::default());
        let token = clients.insert(&slot);

        clients.park(token, DmaBuffer::alloc(&bus, PAGE_SIZE).unwrap());
        slot.completion.signal();
        clients.abandon(token, &slot);
        assert_eq!(clients.parked(), 0);
        assert_eq!(iop.mapped_pages(), 0);
    }

    #[test]
    fn release_parked_frees_everything() {
        let iop = Arc::new(SoftwareIop::new());
        let bus: Arc<dyn SifBus> = iop.clone();
        let clients = ClientTable::new();
        for token in 1..=3 {
            clients.park(token, DmaBuffer::alloc(&bus, PAGE_SIZE).unwrap());
        }
        assert_eq!(iop.mapped_pages(), 3);
        clients.release_parked();
        assert_eq!(iop.mapped_pages(), 0);
    }

    #[test]
    fn irq_record_id() {
        let end = RequestEnd {
            rec_id: 42,
            ..RequestEnd::default()
        };
        assert_eq!(relayed_irq(&frame(cmd::RPC_IRQ, &end.encode())).unwrap(), 42);
        assert!(relayed_irq(&frame(cmd::RPC_IRQ, &[1, 2])).is_err());
    }
}
