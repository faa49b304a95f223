//! Deterministic decision kernel for tool-using agents.
//!
//! Each run offers a menu of tools, asks a selector which one to take, runs it
//! inside a transaction over a small slot store, and records every step in a
//! hash-chained audit log that can be strictly replayed. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (menus, state, transactions,
//!   protocol, blending). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, audit log, tools, fences,
//!   process sandbox). Isolated behind traits so tests can fake them.
//! - **[`selector`]**: Decision backends behind one contract.
//!
//! Orchestration modules ([`step`], [`run`], [`replay`]) coordinate core logic
//! with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod replay;
pub mod run;
pub mod selector;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
