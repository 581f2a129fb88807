//! The control session: authentication, tunnel provisioning, heartbeats, and the mux
//! broker handshake that hands each tunnel its multiplexed data-plane session.

pub mod error;
pub mod session;

pub use error::{ControlSessionError, MuxBrokerError};
pub use session::{cleanup_client, run, ControlSessionConfig};
