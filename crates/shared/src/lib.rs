//! Helpline Shared Types and Utilities
//!
//! This crate contains the wire protocol, domain types, errors and the
//! storage contract shared by the Helpline server and client.

pub mod db;
pub mod error;
pub mod events;
pub mod storage;
pub mod types;

pub use db::*;
pub use error::*;
pub use storage::{MemoryStorage, PgStorage, StorageGateway};
pub use types::*;
