use crate::registry::Handle;

/// Errors returned synchronously by session operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The handle was never issued or its session is already torn down.
    #[error("invalid session handle {0}")]
    InvalidHandle(Handle),

    /// Options rejected before any resource was allocated.
    #[error("invalid session options: {0}")]
    InvalidOptions(String),

    /// The spawn sequence failed; everything allocated so far was released.
    #[error("session creation failed: {0}")]
    Creation(String),

    /// A write or resize against a live session failed.
    #[error("session I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// True for failures of a `create` attempt.
    pub fn is_creation(&self) -> bool {
        matches!(self, BridgeError::Creation(_) | BridgeError::InvalidOptions(_))
    }
}

/// An unrecoverable condition reported by the transport for a live session.
///
/// Arrives asynchronously, so it is only ever delivered to the session's
/// error sink, never returned from an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport fatal error {code}: {message}")]
pub struct TransportFatal {
    pub code: i32,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            BridgeError::InvalidHandle(7).to_string(),
            "invalid session handle 7"
        );
        let fatal = TransportFatal {
            code: 109,
            message: "pipe ended".into(),
        };
        assert_eq!(fatal.to_string(), "transport fatal error 109: pipe ended");
    }

    #[test]
    fn creation_classification() {
        assert!(BridgeError::Creation("boom".into()).is_creation());
        assert!(BridgeError::InvalidOptions("no command".into()).is_creation());
        assert!(!BridgeError::InvalidHandle(1).is_creation());
        let io = BridgeError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!io.is_creation());
    }
}
