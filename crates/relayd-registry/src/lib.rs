//! Tunnel registry and port allocator: the in-memory index of active tunnels
//! (component B) and the cyclic TCP port allocator (component C).

pub mod binding;
pub mod port_allocator;
pub mod registry;

pub use binding::{MuxSessionError, TunnelBinding};
pub use port_allocator::{PortAllocator, PortAllocatorError};
pub use registry::{Registry, RegistryError};
