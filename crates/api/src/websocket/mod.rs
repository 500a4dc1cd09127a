//! WebSocket support for real-time messaging
//!
//! # Architecture
//!
//! - **Connection**: A registered socket owned by the registry
//! - **Registry**: User <-> connection map, the source of truth for presence
//! - **Heartbeat**: Periodic eviction of silent connections
//! - **Handler**: Axum WebSocket route and frame dispatcher

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod registry;

pub use handler::ws_handler;
pub use heartbeat::HeartbeatMonitor;
pub use registry::ConnectionRegistry;
