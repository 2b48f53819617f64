//! Broadcast command: push a raw transaction through the configured relays

use anyhow::*;

use super::read_arg;
use crate::broadcast::Dispatcher;
use crate::config::ServiceConfig;

#[derive(clap::Parser, Debug)]
pub struct BroadcastOpts {
    /// Service configuration (TOML)
    #[arg(long, default_value = "ordswap.toml")]
    pub config: String,
    /// Raw transaction hex, or a file holding it
    #[arg(long)]
    pub tx: String,
}

pub fn run_broadcast(o: BroadcastOpts) -> Result<()> {
    let config = ServiceConfig::from_file(&o.config)
        .with_context(|| format!("loading {}", o.config))?;
    let dispatcher = Dispatcher::from_config(&config);
    let receipt = dispatcher.broadcast(&read_arg(&o.tx)?)?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}
