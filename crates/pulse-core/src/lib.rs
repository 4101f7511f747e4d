//! Shared types for the pulse client runtime.
//!
//! This crate holds everything that crosses a boundary: the JSON wire
//! frames exchanged over the persistent socket ([`frame`]), the
//! per-resource endpoint configuration interface ([`resource`]), and the
//! fatal-failure taxonomy shared by the correlator and its callers
//! ([`error`]). No async code lives here.

pub mod error;
pub mod frame;
pub mod resource;

pub use error::{FatalError, STATUS_TIMEOUT};
pub use frame::Frame;
pub use resource::{ChangeKind, ResourceConfig};
