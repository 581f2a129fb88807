//! The in-memory representation of an active tunnel.

use relayd_mux::MuxSession;
use relayd_proto::Protocol;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MuxSessionError {
    #[error("mux session for this tunnel is already set")]
    AlreadySet,
}

enum MuxSlot {
    Unset,
    Set(Arc<MuxSession>),
    Closed,
}

/// Extends a tunnel with its control-channel-derived identity and its mux session,
/// which transitions `unset -> set -> closed` at most once over the binding's life.
pub struct TunnelBinding {
    pub tunnel_id: String,
    pub client_id: String,
    pub subdomain: Option<String>,
    pub public_port: Option<u16>,
    pub protocol: Protocol,
    mux_session: Mutex<MuxSlot>,
}

impl TunnelBinding {
    pub fn new(
        tunnel_id: impl Into<String>,
        client_id: impl Into<String>,
        subdomain: Option<String>,
        public_port: Option<u16>,
        protocol: Protocol,
    ) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            client_id: client_id.into(),
            subdomain,
            public_port,
            protocol,
            mux_session: Mutex::new(MuxSlot::Unset),
        }
    }

    /// Sets the mux session exactly once. Fails if already set or already closed.
    pub fn set_mux_session(&self, session: Arc<MuxSession>) -> Result<(), MuxSessionError> {
        let mut slot = self.mux_session.lock().unwrap();
        match *slot {
            MuxSlot::Unset => {
                *slot = MuxSlot::Set(session);
                Ok(())
            }
            MuxSlot::Set(_) | MuxSlot::Closed => Err(MuxSessionError::AlreadySet),
        }
    }

    pub fn mux_session(&self) -> Option<Arc<MuxSession>> {
        match &*self.mux_session.lock().unwrap() {
            MuxSlot::Set(session) => Some(session.clone()),
            MuxSlot::Unset | MuxSlot::Closed => None,
        }
    }

    /// Closes the mux session if one was set, and marks the slot terminal either way
    /// so it is never mistaken for `unset` again.
    pub fn close_mux_session(&self) {
        let mut slot = self.mux_session.lock().unwrap();
        if let MuxSlot::Set(session) = &*slot {
            session.close();
        }
        *slot = MuxSlot::Closed;
    }

    pub fn is_mux_closed(&self) -> bool {
        matches!(*self.mux_session.lock().unwrap(), MuxSlot::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn any_mux_session() -> Arc<MuxSession> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, _connected) =
            tokio::join!(listener.accept(), TcpStream::connect(addr));
        Arc::new(MuxSession::new(accepted.unwrap().0))
    }

    #[test]
    fn fresh_binding_has_no_mux_session_and_is_not_closed() {
        let binding = TunnelBinding::new("t1", "c1", Some("myapp".into()), None, Protocol::Http);
        assert!(binding.mux_session().is_none());
        assert!(!binding.is_mux_closed());
    }

    #[tokio::test]
    async fn mux_session_cannot_be_set_twice() {
        let binding = TunnelBinding::new("t1", "c1", Some("myapp".into()), None, Protocol::Http);
        binding.set_mux_session(any_mux_session().await).unwrap();
        assert!(binding.mux_session().is_some());

        let err = binding.set_mux_session(any_mux_session().await).unwrap_err();
        assert_eq!(err, MuxSessionError::AlreadySet);
    }

    #[tokio::test]
    async fn closing_marks_the_slot_terminal_and_rejects_further_sets() {
        let binding = TunnelBinding::new("t1", "c1", None, Some(30000), Protocol::Tcp);
        binding.close_mux_session();
        assert!(binding.is_mux_closed());
        assert!(binding.set_mux_session(any_mux_session().await).is_err());
    }
}
