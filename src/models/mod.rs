//! Domain models shared by the registry, bridge, client and reaper.

pub mod job;
pub mod session;
