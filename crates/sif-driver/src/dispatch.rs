//! Inbound command dispatch
//!
//! Inbound packets arrive as raw 128-byte frames from the SIF0 interrupt
//! hook. They are queued on a channel and drained by a single dispatcher
//! thread, which decodes each frame and runs the handler registered for its
//! command id.
//!
//! Handler ids select one of two 64-slot tables: bit 31 picks the system
//! table, bits 0-5 the slot. Any other bit set is an invalid id.

use crate::codec::CommandHeader;
use crate::error::{Result, SifError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use sif_chip::cmd::{self, HANDLER_SLOTS, ID_INDEX_MASK, ID_SYS};
use sif_chip::frame::{CMD_HEADER_SIZE, CMD_PACKET_MAX};
use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// A decoded inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Packet header
    pub header: CommandHeader,
    /// Inline bytes after the header (`packet_size - 16`)
    pub data: Bytes,
}

impl InboundFrame {
    /// Decode a raw frame
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the header is malformed or claims more
    /// bytes than were received.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let header = CommandHeader::decode(raw)?;
        let end = usize::from(header.packet_size);
        if raw.len() < end {
            return Err(SifError::protocol_violation(format!(
                "{} frame claims {end} bytes, {} received",
                cmd::name(header.cmd_id),
                raw.len()
            )));
        }
        Ok(Self {
            header,
            data: Bytes::copy_from_slice(&raw[CMD_HEADER_SIZE..end]),
        })
    }

    /// Command id
    pub const fn cmd_id(&self) -> u32 {
        self.header.cmd_id
    }

    /// Inline data, or `ProtocolViolation` if shorter than `len`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for a truncated fixed-size packet.
    pub fn expect_len(&self, len: usize) -> Result<&[u8]> {
        if self.data.len() < len {
            return Err(SifError::protocol_violation(format!(
                "{} packet of {} bytes, expected {len}",
                cmd::name(self.cmd_id()),
                self.data.len()
            )));
        }
        Ok(&self.data[..len])
    }
}

/// Handler invoked for a registered command id
///
/// State the handler needs is captured by the closure.
pub type Handler = Arc<dyn Fn(&InboundFrame) -> Result<()> + Send + Sync>;

/// Outcome of dispatching one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A handler ran and returned `Ok`
    Handled,
    /// No handler for the id; the frame was discarded
    Dropped,
}

type Table = [Option<Handler>; HANDLER_SLOTS];

/// System and user handler tables
pub struct Registry {
    system: RwLock<Table>,
    user: RwLock<Table>,
    dropped_ids: Mutex<HashSet<u32>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("registered", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty tables
    pub fn new() -> Self {
        Self {
            system: RwLock::new(std::array::from_fn(|_| None)),
            user: RwLock::new(std::array::from_fn(|_| None)),
            dropped_ids: Mutex::new(HashSet::new()),
        }
    }

    fn slot(&self, cmd_id: u32) -> Result<(&RwLock<Table>, usize)> {
        if cmd_id & !(ID_SYS | ID_INDEX_MASK) != 0 {
            return Err(SifError::invalid_argument(format!(
                "command id {cmd_id:#x} has bits outside the {HANDLER_SLOTS}-slot index"
            )));
        }
        let table = if cmd::is_system(cmd_id) {
            &self.system
        } else {
            &self.user
        };
        Ok((table, (cmd_id & ID_INDEX_MASK) as usize))
    }

    /// Install `handler` for `cmd_id`, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an id outside both tables.
    pub fn register(
        &self,
        cmd_id: u32,
        handler: impl Fn(&InboundFrame) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        let (table, index) = self.slot(cmd_id)?;
        let replaced = table.write()[index].replace(Arc::new(handler)).is_some();
        debug!(
            "Registered handler for {} ({cmd_id:#x}){}",
            cmd::name(cmd_id),
            if replaced { ", replacing previous" } else { "" }
        );
        Ok(())
    }

    /// Whether a handler is installed for `cmd_id`
    pub fn is_registered(&self, cmd_id: u32) -> bool {
        self.slot(cmd_id)
            .is_ok_and(|(table, index)| table.read()[index].is_some())
    }

    /// Number of installed handlers
    pub fn len(&self) -> usize {
        let count = |t: &RwLock<Table>| t.read().iter().filter(|h| h.is_some()).count();
        count(&self.system) + count(&self.user)
    }

    /// Whether no handler is installed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.system.write().iter_mut().for_each(|h| *h = None);
        self.user.write().iter_mut().for_each(|h| *h = None);
    }

    /// Route `frame` to its handler
    ///
    /// The handler runs outside the table lock, so it may register or
    /// remove handlers itself.
    ///
    /// # Errors
    ///
    /// Returns whatever the handler returns.
    pub fn dispatch(&self, frame: &InboundFrame) -> Result<Dispatched> {
        let cmd_id = frame.cmd_id();
        let handler = self
            .slot(cmd_id)
            .ok()
            .and_then(|(table, index)| table.read()[index].clone());

        let Some(handler) = handler else {
            if self.dropped_ids.lock().insert(cmd_id) {
                warn!("Dropping {} ({cmd_id:#x}): no handler", cmd::name(cmd_id));
            } else {
                debug!("Dropping {cmd_id:#x}");
            }
            return Ok(Dispatched::Dropped);
        };

        handler(frame)?;
        Ok(Dispatched::Handled)
    }
}

enum Message {
    Frame(Box<[u8; CMD_PACKET_MAX]>),
    Stop,
}

/// Sending half used by the interrupt hook
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: Sender<Message>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame(_) => f.write_str("Frame"),
            Self::Stop => f.write_str("Stop"),
        }
    }
}

impl FrameSender {
    /// Queue a raw frame; returns `false` if the dispatcher has stopped
    pub fn push(&self, raw: [u8; CMD_PACKET_MAX]) -> bool {
        self.tx.send(Message::Frame(Box::new(raw))).is_ok()
    }
}

/// Single-consumer dispatch thread
#[derive(Debug)]
pub struct Dispatcher {
    tx: Sender<Message>,
    handle: Option<JoinHandle<()>>,
    fault: Arc<Mutex<Option<String>>>,
}

impl Dispatcher {
    /// Start the thread
    ///
    /// `on_fault` runs on the dispatch thread with the violated invariant
    /// once a fatal error halts the loop.
    ///
    /// # Errors
    ///
    /// Returns `Os` if the thread cannot be spawned.
    pub fn spawn(
        registry: Arc<Registry>,
        on_fault: impl FnOnce(&str) + Send + 'static,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let fault = Arc::new(Mutex::new(None));
        let thread_fault = Arc::clone(&fault);

        let handle = std::thread::Builder::new()
            .name("sif-dispatch".into())
            .spawn(move || {
                if let Some(reason) = run(&registry, &rx) {
                    *thread_fault.lock() = Some(reason.clone());
                    on_fault(&reason);
                }
            })?;

        Ok(Self {
            tx,
            handle: Some(handle),
            fault,
        })
    }

    /// Sender for the interrupt hook
    pub fn sender(&self) -> FrameSender {
        FrameSender {
            tx: self.tx.clone(),
        }
    }

    /// The violated invariant that stopped the loop, if any
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    /// Drain what is queued, then stop and join the thread
    pub fn stop(&mut self) {
        let _ = self.tx.send(Message::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("SIF dispatcher thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drain `rx` until told to stop; the reason of a fatal error otherwise
fn run(registry: &Registry, rx: &Receiver<Message>) -> Option<String> {
    debug!("SIF dispatcher started");
    for message in rx {
        let raw = match message {
            Message::Frame(raw) => raw,
            Message::Stop => break,
        };

        let result = InboundFrame::decode(&raw[..]).and_then(|frame| registry.dispatch(&frame));
        match result {
            Ok(_) => {}
            Err(SifError::ProtocolViolation { reason }) => {
                error!("SIF dispatch halted: protocol violation: {reason}");
                return Some(reason);
            }
            Err(e) => warn!("Inbound handler failed: {e}"),
        }
    }
    info!("SIF dispatcher stopped");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn raw_frame(cmd_id: u32, data: &[u8]) -> [u8; CMD_PACKET_MAX] {
        let header = CommandHeader::new(cmd_id, 0, data.len(), None).unwrap();
        let mut raw = [0u8; CMD_PACKET_MAX];
        raw[..16].copy_from_slice(&header.encode().unwrap());
        raw[16..16 + data.len()].copy_from_slice(data);
        raw
    }

    fn frame(cmd_id: u32, data: &[u8]) -> InboundFrame {
        InboundFrame::decode(&raw_frame(cmd_id, data)).unwrap()
    }

    #[test]
    fn decode_takes_packet_size_bytes() {
        let f = frame(cmd::WRITE_SREG, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(f.cmd_id(), cmd::WRITE_SREG);
        assert_eq!(&f.data[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(f.expect_len(8).is_ok());
        assert!(matches!(
            f.expect_len(12),
            Err(SifError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn decode_rejects_short_buffers() {
        let raw = raw_frame(cmd::RPC_END, &[0; 40]);
        assert!(InboundFrame::decode(&raw[..30]).is_err());
    }

    #[test]
    fn registration_overwrites() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicU32::new(0));

        let h = Arc::clone(&hits);
        registry
            .register(cmd::WRITE_SREG, move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        let h = Arc::clone(&hits);
        registry
            .register(cmd::WRITE_SREG, move |_| {
                h.fetch_add(100, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(registry.len(), 1);
        let outcome = registry.dispatch(&frame(cmd::WRITE_SREG, &[])).unwrap();
        assert_eq!(outcome, Dispatched::Handled);
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn system_and_user_tables_are_distinct() {
        let registry = Registry::new();
        registry.register(0x05, |_| Ok(())).unwrap();
        assert!(registry.is_registered(0x05));
        assert!(!registry.is_registered(ID_SYS | 0x05));
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        let registry = Registry::new();
        for id in [64u32, 0x100, ID_SYS | 64, 0x4000_0000] {
            assert!(
                matches!(registry.register(id, |_| Ok(())), Err(SifError::InvalidArgument { .. })),
                "{id:#x}"
            );
        }
        registry.register(ID_SYS | 63, |_| Ok(())).unwrap();
        registry.register(63, |_| Ok(())).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unregistered_frames_are_dropped() {
        let registry = Registry::new();
        assert_eq!(
            registry.dispatch(&frame(0x07, &[])).unwrap(),
            Dispatched::Dropped
        );
        assert_eq!(
            registry.dispatch(&frame(0x07, &[])).unwrap(),
            Dispatched::Dropped
        );
    }

    #[test]
    fn clear_removes_everything() {
        let registry = Registry::new();
        registry.register(cmd::RPC_END, |_| Ok(())).unwrap();
        registry.register(1, |_| Ok(())).unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn handler_may_register_during_dispatch() {
        let registry = Arc::new(Registry::new());
        let inner = Arc::clone(&registry);
        registry
            .register(1, move |_| inner.register(2, |_| Ok(())))
            .unwrap();
        registry.dispatch(&frame(1, &[])).unwrap();
        assert!(registry.is_registered(2));
    }

    #[test]
    fn dispatcher_stops_on_fatal_error() {
        let registry = Arc::new(Registry::new());
        let seen = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&seen);
        registry
            .register(1, move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        registry
            .register(2, |_| Err(SifError::protocol_violation("bad index")))
            .unwrap();

        let (fault_tx, fault_rx) = mpsc::channel();
        let mut dispatcher = Dispatcher::spawn(Arc::clone(&registry), move |reason| {
            let _ = fault_tx.send(reason.to_owned());
        })
        .unwrap();
        let sender = dispatcher.sender();
        assert!(sender.push(raw_frame(1, &[])));
        assert!(sender.push(raw_frame(2, &[])));

        let reported = fault_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reported, "bad index");
        assert_eq!(dispatcher.fault().as_deref(), Some("bad index"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Frames after the fault are never handled.
        let _ = sender.push(raw_frame(1, &[]));
        dispatcher.stop();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatcher_survives_non_fatal_errors() {
        let registry = Arc::new(Registry::new());
        let seen = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&seen);
        registry.register(1, |_| Err(SifError::io("nope"))).unwrap();
        registry
            .register(2, move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let mut dispatcher = Dispatcher::spawn(registry, |_| {}).unwrap();
        let sender = dispatcher.sender();
        sender.push(raw_frame(1, &[]));
        sender.push(raw_frame(2, &[]));
        dispatcher.stop();

        assert!(dispatcher.fault().is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
