//! Command handlers for each subcommand

pub mod broadcast;
pub mod classify;
pub mod inspect_psbt;
pub mod runestone;

pub use broadcast::*;
pub use classify::*;
pub use inspect_psbt::*;
pub use runestone::*;

/// Treat `arg` as a file path if one exists there, otherwise as the value itself.
pub(crate) fn read_arg(arg: &str) -> anyhow::Result<String> {
    let path = std::path::Path::new(arg);
    if path.is_file() {
        return Ok(std::fs::read_to_string(path)?.trim().to_string());
    }
    Ok(arg.trim().to_string())
}
