//! Bring up the interconnect and round-trip a few RPC calls
//!
//! Runs against the simulated IOP unless `SIF_BUS=mmio` is set.

use sif_driver::backends::SoftwareIop;
use sif_driver::prelude::*;
use sif_driver::MmioConfig;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let selection = match std::env::var("SIF_BUS").as_deref() {
        Ok("mmio") => BusSelection::Mmio,
        _ => BusSelection::Software,
    };
    let sif = Sif::init(open_bus(selection, &MmioConfig::default())?, SifConfig::from_env())?;
    println!("SIF {} (IOP buffer {:#x})", sif.state(), sif.iop_buffer());

    let mut client = RpcClient::new();
    sif.bind(&mut client, SoftwareIop::ECHO_SERVICE)?;

    for size in [4usize, 64, 512, 2048] {
        let request: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let mut response = vec![0u8; size];

        let start = Instant::now();
        sif.call(&mut client, 0, &request, &mut response)?;
        let elapsed = start.elapsed();

        assert_eq!(request, response, "echo mismatch at {size} bytes");
        println!("{size:>5} bytes  {:>8.1} µs", elapsed.as_secs_f64() * 1e6);
    }

    sif.unbind(&mut client);
    Ok(())
}
