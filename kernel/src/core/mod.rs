//! Deterministic, pure logic shared by the kernel.
//!
//! Core modules must be free of I/O side effects. Time enters only through
//! the injected [`clock::Clock`].

pub mod blend;
pub mod breaker;
pub mod cache;
pub mod canonical;
pub mod clock;
pub mod context;
pub mod digest;
pub mod ids;
pub mod loop_guard;
pub mod menu;
pub mod merge;
pub mod protocol;
pub mod state;
pub mod tx;
pub mod types;
