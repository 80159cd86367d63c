//! Runner fleet reconciliation daemon.
//!
//! This crate primarily ships a `fleetd` binary, but we expose a library
//! surface to enable integration testing against mock backends.

pub mod cloud;
pub mod config;
pub mod error;
pub mod fleet;
pub mod jobhost;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod source;
pub mod stream;
