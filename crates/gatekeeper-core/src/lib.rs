//! Gatekeeper Core - Shared functionality for Gatekeeper crates
//!
//! Standard locations for configuration, policy documents and the audit log,
//! plus small formatting helpers used by the CLI.

pub mod format;
pub mod paths;

pub use paths::Paths;
