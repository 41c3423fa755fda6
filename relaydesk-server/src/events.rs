//! Events snapshot loaded once at startup.

use std::path::Path;

/// Read the JSON array at `path`. A missing file is an empty snapshot; an
/// unreadable or malformed one is logged and treated as empty.
pub fn load_events(path: &Path) -> Vec<serde_json::Value> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no events snapshot");
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read events snapshot");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<serde_json::Value>>(&text) {
        Ok(events) => {
            tracing::info!(path = %path.display(), count = events.len(), "loaded events snapshot");
            events
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "events snapshot is not a JSON array");
            Vec::new()
        }
    }
}
