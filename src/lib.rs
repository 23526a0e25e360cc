//! Distributed interactive breakpoints.
//!
//! A unit of work that hits a breakpoint opens a [`bridge::Bridge`],
//! publishes its address in the shared [`registry::SessionRegistry`], and
//! waits for a [`client::DebuggerClient`] to attach. The [`reaper`] removes
//! sessions whose owning job has died.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod client;
pub mod config;
pub mod errors;
pub mod liveness;
pub mod models;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod worker;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
