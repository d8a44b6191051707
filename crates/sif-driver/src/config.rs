//! Driver configuration
//!
//! Defaults reproduce the timing the IOP firmware expects. Every field can be
//! set directly; [`SifConfig::from_env`] applies `SIF_*` environment
//! overrides on top of the defaults.

use sif_chip::frame::DEFAULT_RESET_ARGS;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// SIF1 channel timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTiming {
    /// Total budget for the channel to become ready
    pub ready_timeout: Duration,

    /// Spin granularity while waiting
    pub poll_interval: Duration,
}

impl Default for DmaTiming {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_micros(100),
        }
    }
}

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SifConfig {
    /// Boot arguments sent with the IOP reset command
    pub reset_args: String,

    /// Budget for each handshake flag and for RPC initialisation
    pub handshake_timeout: Duration,

    /// Poll interval for handshake flags
    pub handshake_poll: Duration,

    /// SIF1 channel timing
    pub dma: DmaTiming,

    /// Default bound on bind/call completion waits (`None` waits forever)
    pub rpc_timeout: Option<Duration>,
}

impl Default for SifConfig {
    fn default() -> Self {
        Self {
            reset_args: DEFAULT_RESET_ARGS.to_string(),
            handshake_timeout: Duration::from_secs(5),
            handshake_poll: Duration::from_millis(1),
            dma: DmaTiming::default(),
            rpc_timeout: None,
        }
    }
}

impl SifConfig {
    /// Defaults with `SIF_*` environment overrides applied
    ///
    /// - `SIF_RESET_ARGS`
    /// - `SIF_HANDSHAKE_TIMEOUT_MS`
    /// - `SIF_DMA_TIMEOUT_MS`
    /// - `SIF_RPC_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(args) = std::env::var("SIF_RESET_ARGS") {
            config.reset_args = args;
        }
        if let Some(ms) = env_millis("SIF_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = ms;
        }
        if let Some(ms) = env_millis("SIF_DMA_TIMEOUT_MS") {
            config.dma.ready_timeout = ms;
        }
        if let Some(ms) = env_millis("SIF_RPC_TIMEOUT_MS") {
            config.rpc_timeout = Some(ms);
        }

        config
    }

    /// Set the reset arguments
    #[must_use]
    pub fn with_reset_args(mut self, args: impl Into<String>) -> Self {
        self.reset_args = args.into();
        self
    }

    /// Set the handshake budget
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Bound every RPC wait
    #[must_use]
    pub const fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            warn!("Ignoring {name}={raw:?}: {e}");
            None
        }
    }
}

/// Hardware bus configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmioConfig {
    /// Physical memory device
    pub mem_path: PathBuf,

    /// Physical base of the memory reserved for SIF DMA
    pub dma_window_base: u32,

    /// Size of the reserved window in bytes (page multiple)
    pub dma_window_size: usize,
}

impl Default for MmioConfig {
    fn default() -> Self {
        Self {
            mem_path: PathBuf::from("/dev/mem"),
            // Top 64 KiB of the 32 MiB main RAM, reserved with `mem=` on the kernel command line.
            dma_window_base: 0x01FF_0000,
            dma_window_size: 0x1_0000,
        }
    }
}
