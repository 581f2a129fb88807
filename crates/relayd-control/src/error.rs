use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuxBrokerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("control codec error: {0}")]
    Codec(#[from] relayd_proto::CodecError),
    #[error("no connection arrived on the mux listener within the deadline")]
    AcceptTimeout,
    #[error("registry error: {0}")]
    Registry(#[from] relayd_registry::RegistryError),
}

#[derive(Debug, Error)]
pub enum ControlSessionError {
    #[error("codec error: {0}")]
    Codec(#[from] relayd_proto::CodecError),
    #[error("repository error: {0}")]
    Repository(#[from] relayd_db::RepositoryError),
    #[error("authentication timed out")]
    AuthTimeout,
    #[error("missing token")]
    InvalidToken,
    #[error("unknown token")]
    AuthFailed,
    #[error("client account is not active")]
    ClientInactive,
}
