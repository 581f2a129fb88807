pub mod client;
pub mod connection_log;
pub mod tunnel;

pub use client::Entity as ClientEntity;
pub use connection_log::Entity as ConnectionLogEntity;
pub use tunnel::Entity as TunnelEntity;
