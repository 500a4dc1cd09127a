//! Helpline client
//!
//! Keeps one logical connection to a Helpline server alive across network
//! drops: registers on every connect, sends heartbeats, retries frames that
//! could not be emitted and filters duplicate inbound messages.

pub mod dedup;
pub mod error;
pub mod retry_queue;
pub mod session;
pub mod state;
pub mod transport;

pub use error::{ClientError, ClientResult};
pub use session::{ClientConfig, ClientIdentity, ClientSession, OutgoingMessage};
pub use state::ConnectionStatus;
pub use transport::{Connector, Link, Transport, WsConnector};
