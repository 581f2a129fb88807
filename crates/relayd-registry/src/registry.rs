//! In-memory index of active tunnels by subdomain, by public port, and by owning
//! client. A single reader-writer lock protects all three indices so that a
//! quiescent point always shows them mutually consistent.

use crate::binding::TunnelBinding;
use relayd_mux::MuxSession;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("subdomain {0} is already registered")]
    SubdomainTaken(String),
    #[error("port {0} is already registered")]
    PortTaken(u16),
    #[error("no binding found for tunnel {0}")]
    NotFound(String),
}

#[derive(Default)]
struct Indices {
    by_tunnel_id: HashMap<String, Arc<TunnelBinding>>,
    by_subdomain: HashMap<String, Arc<TunnelBinding>>,
    by_port: HashMap<u16, Arc<TunnelBinding>>,
    by_client: HashMap<String, Vec<Arc<TunnelBinding>>>,
}

pub struct Registry {
    indices: RwLock<Indices>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
        }
    }

    /// Inserts `binding` into every applicable index under one write-lock
    /// acquisition. Checks both uniqueness constraints before mutating anything, so a
    /// rejected registration leaves no partial state — in particular, a port
    /// conflict never lets a subdomain insert slip through.
    pub fn register(&self, binding: Arc<TunnelBinding>) -> Result<(), RegistryError> {
        let mut idx = self.indices.write().unwrap();

        if let Some(port) = binding.public_port {
            if idx.by_port.contains_key(&port) {
                return Err(RegistryError::PortTaken(port));
            }
        }
        if let Some(subdomain) = &binding.subdomain {
            if idx.by_subdomain.contains_key(subdomain) {
                return Err(RegistryError::SubdomainTaken(subdomain.clone()));
            }
        }

        if let Some(subdomain) = &binding.subdomain {
            idx.by_subdomain.insert(subdomain.clone(), binding.clone());
        }
        if let Some(port) = binding.public_port {
            idx.by_port.insert(port, binding.clone());
        }
        idx.by_client
            .entry(binding.client_id.clone())
            .or_default()
            .push(binding.clone());
        idx.by_tunnel_id.insert(binding.tunnel_id.clone(), binding);

        Ok(())
    }

    /// Removes `tunnel_id` from all three indices under the write lock, then — once
    /// the lock is released — closes its mux session if one was set. Closing happens
    /// outside the lock so that network I/O never blocks readers. Idempotent: calling
    /// this twice for an already-removed tunnel is a no-op the second time.
    pub fn unregister(&self, tunnel_id: &str) {
        let removed = {
            let mut idx = self.indices.write().unwrap();
            let Some(binding) = idx.by_tunnel_id.remove(tunnel_id) else {
                return;
            };
            if let Some(subdomain) = &binding.subdomain {
                idx.by_subdomain.remove(subdomain);
            }
            if let Some(port) = binding.public_port {
                idx.by_port.remove(&port);
            }
            if let Some(bindings) = idx.by_client.get_mut(&binding.client_id) {
                bindings.retain(|b| b.tunnel_id != tunnel_id);
                if bindings.is_empty() {
                    idx.by_client.remove(&binding.client_id);
                }
            }
            binding
        };

        debug!(tunnel_id, "unregistered tunnel binding");
        removed.close_mux_session();
    }

    pub fn get_by_subdomain(&self, subdomain: &str) -> Option<Arc<TunnelBinding>> {
        self.indices.read().unwrap().by_subdomain.get(subdomain).cloned()
    }

    pub fn get_by_port(&self, port: u16) -> Option<Arc<TunnelBinding>> {
        self.indices.read().unwrap().by_port.get(&port).cloned()
    }

    pub fn get_by_client(&self, client_id: &str) -> Vec<Arc<TunnelBinding>> {
        self.indices
            .read()
            .unwrap()
            .by_client
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_mux_session(
        &self,
        tunnel_id: &str,
        session: Arc<MuxSession>,
    ) -> Result<(), RegistryError> {
        let binding = {
            let idx = self.indices.read().unwrap();
            idx.by_tunnel_id
                .get(tunnel_id)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(tunnel_id.to_string()))?
        };
        binding
            .set_mux_session(session)
            .map_err(|_| RegistryError::NotFound(tunnel_id.to_string()))
    }

    pub fn count(&self) -> usize {
        self.indices.read().unwrap().by_tunnel_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayd_proto::Protocol;

    fn http_binding(tunnel_id: &str, client_id: &str, subdomain: &str) -> Arc<TunnelBinding> {
        Arc::new(TunnelBinding::new(
            tunnel_id,
            client_id,
            Some(subdomain.to_string()),
            None,
            Protocol::Http,
        ))
    }

    fn tcp_binding(tunnel_id: &str, client_id: &str, port: u16) -> Arc<TunnelBinding> {
        Arc::new(TunnelBinding::new(tunnel_id, client_id, None, Some(port), Protocol::Tcp))
    }

    #[test]
    fn duplicate_subdomain_registration_fails_and_keeps_the_original() {
        let registry = Registry::new();
        registry.register(http_binding("t1", "c1", "myapp")).unwrap();

        let err = registry
            .register(http_binding("t2", "c2", "myapp"))
            .unwrap_err();
        assert_eq!(err, RegistryError::SubdomainTaken("myapp".to_string()));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get_by_subdomain("myapp").unwrap().tunnel_id, "t1");
    }

    #[test]
    fn port_conflict_prevents_the_subdomain_insert_too() {
        let registry = Registry::new();
        registry.register(tcp_binding("t1", "c1", 30000)).unwrap();

        let conflicting = Arc::new(TunnelBinding::new(
            "t2",
            "c2",
            Some("should-not-register".into()),
            Some(30000),
            Protocol::Tcp,
        ));
        let err = registry.register(conflicting).unwrap_err();
        assert_eq!(err, RegistryError::PortTaken(30000));
        assert!(registry.get_by_subdomain("should-not-register").is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn unregister_removes_from_every_index() {
        let registry = Registry::new();
        registry.register(http_binding("t1", "c1", "myapp")).unwrap();
        registry.register(tcp_binding("t2", "c1", 30000)).unwrap();

        registry.unregister("t1");

        assert!(registry.get_by_subdomain("myapp").is_none());
        assert_eq!(registry.get_by_client("c1").len(), 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = Registry::new();
        registry.register(http_binding("t1", "c1", "myapp")).unwrap();
        registry.unregister("t1");
        registry.unregister("t1");
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn get_by_client_reflects_all_active_bindings_for_that_client() {
        let registry = Registry::new();
        registry.register(http_binding("t1", "c1", "a")).unwrap();
        registry.register(http_binding("t2", "c1", "b")).unwrap();
        registry.register(http_binding("t3", "c2", "c")).unwrap();

        assert_eq!(registry.get_by_client("c1").len(), 2);
        assert_eq!(registry.get_by_client("c2").len(), 1);
    }
}
