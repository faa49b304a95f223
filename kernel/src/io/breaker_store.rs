//! Optional on-disk persistence for external-policy breaker counters.
//!
//! Single writer per file. With several processes sharing one path the last
//! rename wins and intermediate updates are lost.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::breaker::BreakerState;

/// Load breaker state; a missing file means a closed breaker.
pub fn load_breaker_state(path: &Path) -> Result<BreakerState> {
    if !path.exists() {
        return Ok(BreakerState::default());
    }
    debug!(path = %path.display(), "loading breaker state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read breaker state {}", path.display()))?;
    let state: BreakerState = serde_json::from_str(&contents)
        .with_context(|| format!("parse breaker state {}", path.display()))?;
    Ok(state)
}

/// Atomically write breaker state to disk (temp file + rename).
pub fn write_breaker_state(path: &Path, state: &BreakerState) -> Result<()> {
    debug!(
        path = %path.display(),
        failures = state.consecutive_failures,
        open_until_ms = ?state.open_until_ms,
        "writing breaker state"
    );
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("breaker state path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp breaker state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace breaker state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/breaker.json");
        let state = BreakerState {
            consecutive_failures: 4,
            open_until_ms: Some(12_345),
            last_failure: Some("timeout".to_string()),
        };
        write_breaker_state(&path, &state).expect("write");
        assert_eq!(load_breaker_state(&path).expect("load"), state);
    }

    #[test]
    fn missing_file_is_closed_breaker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = load_breaker_state(&temp.path().join("absent.json")).expect("load");
        assert_eq!(state, BreakerState::default());
    }
}
