//! Helpline API Library
//!
//! Real-time customer-service messaging core: connection registry,
//! heartbeat eviction, session routing and message delivery over WebSocket.

pub mod auth;
pub mod config;
pub mod delivery;
pub mod error;
pub mod presence;
pub mod routes;
pub mod session_router;
pub mod state;
pub mod websocket;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{ApiError, ApiResult, ErrorKind};
pub use state::AppState;
