use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

use super::{EndpointHealth, RegistryResult};

/// Loads the health snapshot, tolerating a missing or unreadable file
/// by returning an empty map.
pub(super) fn load(path: &Path) -> HashMap<String, EndpointHealth> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return HashMap::new();
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read health snapshot");
            return HashMap::new();
        }
    };
    match serde_json::from_str::<HashMap<String, EndpointHealth>>(&content) {
        Ok(status) => {
            info!(
                path = %path.display(),
                endpoints = status.len(),
                "health snapshot loaded"
            );
            status
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "corrupt health snapshot, starting empty");
            HashMap::new()
        }
    }
}

/// Writes the snapshot to a staging file and renames it over the live
/// one, so a crash mid-write never leaves a half-written file behind.
pub(super) fn save(path: &Path, status: &HashMap<String, EndpointHealth>) -> RegistryResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(status)?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
