//! Stable exit codes for the `dskernel` CLI.

/// Run ended in NOOP, ASK_SUP or GOAL_DONE, or replay matched the log.
pub const OK: i32 = 0;
/// Run ended in a tool error or breaker trip, replay diverged, or the
/// request/config/log could not be loaded.
pub const FAILURE: i32 = 1;
