//! warden: advisory file-lease coordination for fleets of coding agents.
//!
//! Agents take time-bounded, possibly-exclusive leases on path patterns so
//! concurrent edits to a shared codebase do not trample each other. Every
//! grant, release, and expiry is recorded in a git-backed archive alongside
//! agent profiles, messages, and content-addressed attachments.

pub mod archive;
pub mod attachments;
pub mod config;
pub mod conflict;
pub mod error;
pub mod manager;
pub mod model;
pub mod naming;
pub mod output;
pub mod store;
pub mod sweeper;

pub use config::Settings;
pub use error::{Result, WardenError};
pub use manager::LeaseManager;
