use thiserror::Error;

/// Errors surfaced synchronously by the library.
///
/// Channel workers never raise across thread boundaries: transport and
/// protocol failures are handled by the channel state machines (reconnect,
/// `error_string` updates) and reach the application as state transitions
/// instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A received frame did not decode as a container envelope.
    #[error("malformed container: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A ZeroMQ socket could not be created or configured.
    #[error("transport: {0}")]
    Transport(#[from] zmq::Error),

    /// The DNS-SD browser backend failed.
    #[error("service discovery: {0}")]
    Discovery(String),

    /// `register`/`unregister` was called while discovery is running.
    #[error("service discovery is running; stop it before changing registrations")]
    DiscoveryRunning,

    /// A dsn TXT record did not parse as a ZeroMQ endpoint URI.
    #[error("invalid endpoint uri {uri:?}")]
    InvalidUri { uri: String },
}

pub type Result<T> = std::result::Result<T, Error>;
