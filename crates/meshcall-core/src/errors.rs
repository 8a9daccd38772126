use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid credential: {0}")]
    Credential(String),
    #[error("media access denied: {0}")]
    MediaAccessDenied(String),
    #[error("local media error: {0}")]
    Media(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("signaling rejected: {0}")]
    Rejected(String),
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("room error: {0}")]
    Room(String),
    #[error("media backend error: {0}")]
    Backend(String),
}

impl MeshError {
    /// Errors that abort the whole session rather than a single link.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MeshError::Credential(_)
                | MeshError::MediaAccessDenied(_)
                | MeshError::Rejected(_)
                | MeshError::Connection(_)
        )
    }
}
