//! Client-side sync layer for the BoardShoot note and photo organizer.
//!
//! Reads go through a persisted TTL cache, writes through a retrying HTTP
//! client, and edits that happen in bursts through a debounced writer.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod sync;

pub use error::{ErrorKind, Result, SyncError};
pub use sync::SyncContext;
