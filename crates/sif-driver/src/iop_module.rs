//! IOP module loading
//!
//! A thin RPC client of the IOP load-module service: asks the IOP to load
//! and start an executable module from its ROM filesystem.

use crate::error::{Result, SifError};
use crate::rpc::RpcClient;
use crate::sif::Sif;
use bytes::{Buf, BufMut};
use sif_chip::cmd::sid;
use tracing::{debug, info};

/// Longest path or argument string, NUL included
pub const LOAD_STRING_MAX: usize = 252;

/// Request layout: `addr: u32, arg_size: u32, path: [u8; 252], arg: [u8; 252]`
pub const LOAD_REQUEST_SIZE: usize = 8 + 2 * LOAD_STRING_MAX;

/// Response layout: `status: i32, modres: u32`
pub const LOAD_RESPONSE_SIZE: usize = 8;

/// Procedure id for "load module from ROM"
const RPC_LOAD_ROM: u32 = 0;

/// Outcome of a successful load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedModule {
    /// Module id assigned by the IOP
    pub id: u32,
    /// Value the module's entry point returned
    pub result: u32,
}

/// Encode a load request
///
/// `arg` is sent with a NUL appended, so `arg_size` is never 0.
///
/// # Errors
///
/// Returns `InvalidArgument` if `path` or `arg` does not fit 251 bytes, or
/// `path` contains a NUL.
pub fn encode_load_request(path: &str, arg: &[u8]) -> Result<Vec<u8>> {
    if path.len() >= LOAD_STRING_MAX {
        return Err(SifError::invalid_argument(format!(
            "module path of {} bytes exceeds {}",
            path.len(),
            LOAD_STRING_MAX - 1
        )));
    }
    if arg.len() >= LOAD_STRING_MAX {
        return Err(SifError::invalid_argument(format!(
            "module argument of {} bytes exceeds {}",
            arg.len(),
            LOAD_STRING_MAX - 1
        )));
    }
    if path.as_bytes().contains(&0) {
        return Err(SifError::invalid_argument("module path contains NUL"));
    }

    #[allow(clippy::cast_possible_truncation)] // <= 252
    let arg_size = (arg.len() + 1) as u32;

    let mut out = Vec::with_capacity(LOAD_REQUEST_SIZE);
    out.put_u32_le(0);
    out.put_u32_le(arg_size);
    out.put_slice(path.as_bytes());
    out.put_bytes(0, LOAD_STRING_MAX - path.len());
    out.put_slice(arg);
    out.put_bytes(0, LOAD_STRING_MAX - arg.len());
    Ok(out)
}

/// Decode a load response
///
/// # Errors
///
/// Returns `Io` carrying the IOP status if the load failed.
pub fn decode_load_response(path: &str, mut bytes: &[u8]) -> Result<LoadedModule> {
    if bytes.len() < LOAD_RESPONSE_SIZE {
        return Err(SifError::protocol_violation(format!(
            "load response of {} bytes",
            bytes.len()
        )));
    }
    let status = bytes.get_i32_le();
    let result = bytes.get_u32_le();
    if let Some(err) = SifError::from_remote_status(&format!("loading {path}"), status) {
        return Err(err);
    }
    Ok(LoadedModule {
        id: status.unsigned_abs(),
        result,
    })
}

/// Client of the IOP load-module service
#[derive(Debug)]
pub struct ModuleLoader<'a> {
    sif: &'a Sif,
    client: RpcClient,
}

impl<'a> ModuleLoader<'a> {
    /// Bind the load-module service
    ///
    /// # Errors
    ///
    /// Any bind error; `Io` if the IOP has no module loader.
    pub fn new(sif: &'a Sif) -> Result<Self> {
        let mut client = RpcClient::new();
        sif.bind(&mut client, sid::LOAD_MODULE)?;
        debug!("Module loader bound: {:?}", client.binding());
        Ok(Self { sif, client })
    }

    /// Load module `path` from ROM, passing `arg` to its entry point
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for oversized `path` or `arg`
    /// - `Io` if the IOP reports a negative status
    /// - any RPC call error
    pub fn load_rom(&mut self, path: &str, arg: &[u8]) -> Result<LoadedModule> {
        let request = encode_load_request(path, arg)?;
        let mut response = [0u8; LOAD_RESPONSE_SIZE];
        self.sif
            .call(&mut self.client, RPC_LOAD_ROM, &request, &mut response)?;

        let module = decode_load_response(path, &response)?;
        info!("Loaded IOP module {path} as id {}", module.id);
        Ok(module)
    }
}

impl Drop for ModuleLoader<'_> {
    fn drop(&mut self) {
        self.sif.unbind(&mut self.client);
    }
}
