use crate::store::StoreError;

/// Protocol-level errors for relaymesh.
///
/// Wraps transport and store errors and adds protocol-specific variants
/// (configuration, wire decoding).
#[derive(Debug, thiserror::Error)]
pub enum RelayMeshError {
    #[error("transport error: {0}")]
    Transport(#[from] relaymesh_transport::TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("runtime shut down")]
    Shutdown,
}

impl From<serde_json::Error> for RelayMeshError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            RelayMeshError::Deserialization(e.to_string())
        } else {
            RelayMeshError::Serialization(e.to_string())
        }
    }
}

/// Why an inbound connection was refused at accept time.
///
/// The `Display` text is what the peer receives in the `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("must have hash and id url params")]
    MissingParams,

    #[error("hash is not served here")]
    UnknownTopic,

    #[error("id is already connected")]
    AlreadyConnected,

    #[error("have reached the limit")]
    LimitReached,

    #[error("route is not supported")]
    UnsupportedRoute,
}
