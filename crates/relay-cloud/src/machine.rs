//! Persistent machine identity.

use crate::error::Result;
use rand::RngCore;
use std::path::Path;

const MACHINE_ID_FILE: &str = "machine-id";

/// Loads the machine id from `<data_dir>/machine-id`, creating and
/// persisting `<hostname>-<16 random hex>` on first start. The id survives
/// restarts.
///
/// # Errors
///
/// Fails when the data directory cannot be created or the file cannot be
/// read or written.
pub fn load_or_create_machine_id(data_dir: &Path) -> Result<String> {
    let path = data_dir.join(MACHINE_ID_FILE);
    if path.exists() {
        let id = std::fs::read_to_string(&path)?.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }

    std::fs::create_dir_all(data_dir)?;
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    let mut suffix = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut suffix);
    let id = format!("{host}-{}", hex::encode(suffix));

    std::fs::write(&path, &id)?;
    tracing::info!(machine_id = %id, "machine identity created");
    Ok(id)
}
