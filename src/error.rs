use thiserror::Error;

/// Classification used by the retry layer. Each cache client adapter maps
/// its native errors into one of these kinds at the boundary; nothing above
/// the adapters inspects backend-specific error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Timeout,
    ClusterUnavailable,
    Other,
}

impl ErrorKind {
    /// Transient kinds are eligible for automatic retry.
    pub fn is_transient(self) -> bool {
        !matches!(self, ErrorKind::Other)
    }
}

/// Error produced by a cache client operation.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cluster unavailable: {0}")]
    ClusterUnavailable(String),

    #[error("operation error: {0}")]
    Operation(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connection(_) => ErrorKind::Connection,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::ClusterUnavailable(_) => ErrorKind::ClusterUnavailable,
            ClientError::Operation(_) => ErrorKind::Other,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Top-level error for the harness itself.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl From<tokio::task::JoinError> for BenchError {
    fn from(e: tokio::task::JoinError) -> Self {
        BenchError::TaskFailed(e.to_string())
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(e: serde_json::Error) -> Self {
        BenchError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(ErrorKind::Connection.is_transient());
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::ClusterUnavailable.is_transient());
        assert!(!ErrorKind::Other.is_transient());
    }

    #[test]
    fn client_error_kind_mapping() {
        assert_eq!(
            ClientError::Connection("refused".into()).kind(),
            ErrorKind::Connection
        );
        assert_eq!(ClientError::Timeout("1s".into()).kind(), ErrorKind::Timeout);
        assert_eq!(
            ClientError::ClusterUnavailable("down".into()).kind(),
            ErrorKind::ClusterUnavailable
        );
        assert_eq!(
            ClientError::Operation("wrongtype".into()).kind(),
            ErrorKind::Other
        );
        assert!(!ClientError::Operation("wrongtype".into()).is_transient());
    }
}
