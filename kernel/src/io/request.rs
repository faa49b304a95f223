//! Run request loading.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::RunRequest;

/// Load and sanity-check a JSON run request.
pub fn load_request(path: &Path) -> Result<RunRequest> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read request {}", path.display()))?;
    let request: RunRequest = serde_json::from_str(&contents)
        .with_context(|| format!("parse request {}", path.display()))?;
    request
        .validate()
        .with_context(|| format!("invalid request {}", path.display()))?;
    debug!(goal_id = %request.goal_id, control_mode = %request.control_mode, "request loaded");
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::blend::ControlMode;

    #[test]
    fn loads_full_request() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("request.json");
        fs::write(
            &path,
            r#"{"goal_id":"summarize","candidate_tags":["fs"],"inputs":{"note":"hi"},"control_mode":"BLENDED","request_id":"r1"}"#,
        )
        .expect("write");
        let request = load_request(&path).expect("load");
        assert_eq!(request.goal_id, "summarize");
        assert_eq!(request.control_mode, ControlMode::Blended);
        assert_eq!(request.inputs["note"], "hi");
        assert_eq!(request.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn rejects_blank_goal_and_bad_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("request.json");
        fs::write(&path, r#"{"goal_id":"  "}"#).expect("write");
        assert!(load_request(&path).is_err());
        fs::write(&path, "{").expect("write");
        assert!(load_request(&path).is_err());
        assert!(load_request(&temp.path().join("missing.json")).is_err());
    }

    #[test]
    fn rejects_goal_context_delimiters() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("request.json");
        fs::write(&path, r#"{"goal_id":"bootstrap.a|STAGE:RAN"}"#).expect("write");
        let err = load_request(&path).expect_err("pipe in goal");
        assert!(format!("{err:#}").contains("must not contain '|'"), "{err:#}");

        fs::write(&path, r#"{"goal_id":"g","candidate_tags":["fs,net"]}"#).expect("write");
        assert!(load_request(&path).is_err());
    }
}
