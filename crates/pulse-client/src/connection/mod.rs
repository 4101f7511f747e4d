//! The persistent connection: transport, lifecycle, and keep-alive.

pub(crate) mod backoff;
pub(crate) mod heartbeat;
pub(crate) mod manager;
pub mod socket;
pub mod state;
