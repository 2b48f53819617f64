//! Classify command: ask the oracle which UTXOs are safe to spend

use anyhow::*;
use bitcoin::ScriptBuf;

use crate::config::ServiceConfig;
use crate::filter::{classify_all, select_classified, Classification};
use crate::oracle::HttpAssetOracle;
use crate::types::parse_utxos;

#[derive(clap::Parser, Debug)]
pub struct ClassifyOpts {
    /// Service configuration (TOML)
    #[arg(long, default_value = "ordswap.toml")]
    pub config: String,
    /// UTXOs: txid:vout:value_sat,txid:vout:value_sat,...
    #[arg(long)]
    pub utxos: String,
    /// Also pick pure UTXOs covering this many sats
    #[arg(long)]
    pub target: Option<u64>,
}

pub fn run_classify(o: ClassifyOpts) -> Result<()> {
    let config = ServiceConfig::from_file(&o.config)
        .with_context(|| format!("loading {}", o.config))?;
    let oracle = HttpAssetOracle::new(&config.oracle)?;
    // scripts are irrelevant to classification
    let utxos = parse_utxos(&o.utxos, &ScriptBuf::new())?;

    let classified = classify_all(&oracle, &utxos);
    for (utxo, class) in &classified {
        match class {
            Classification::Pure => println!("{} {} pure", utxo.outpoint, utxo.value_sats),
            Classification::Protected(reason) => {
                println!("{} {} protected: {reason}", utxo.outpoint, utxo.value_sats)
            }
        }
    }

    if let Some(target) = o.target {
        let selection = select_classified(&classified, target)?;
        eprintln!(
            "selected {} utxo(s), {} sats, {} change",
            selection.utxos.len(),
            selection.total,
            selection.change
        );
        for utxo in &selection.utxos {
            println!("{}", utxo.outpoint);
        }
    }
    Ok(())
}
