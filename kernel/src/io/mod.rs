//! Side-effecting collaborators: filesystem, subprocesses and the audit log.

pub mod audit;
pub mod breaker_store;
pub mod config;
pub mod fences;
pub mod process;
pub mod request;
pub mod toolkit;
pub mod tools;
