//! qmkd — the QMK daemon
//!
//! Loads an optional JSON config, brings up the simulated substrate, and
//! serves the RPC surface until killed.

use anyhow::Context;
use qmk_kernel::{rpc, Kernel, KernelConfig};
use qmk_device::StateVectorBackend;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            serde_json::from_str::<KernelConfig>(&text)
                .with_context(|| format!("parsing config {path}"))?
        }
        None => KernelConfig::default(),
    };

    let device = Arc::new(StateVectorBackend::new());
    let kernel = Kernel::new(config, device);
    kernel.start_workers();
    rpc::serve(kernel).await.context("rpc server")?;
    Ok(())
}
