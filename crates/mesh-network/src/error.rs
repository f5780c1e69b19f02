//! Error types for mesh network layer operations

use thiserror::Error;

/// Result type for mesh network operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur in the mesh network layer
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Malformed network PDU: {0}")]
    MalformedPdu(String),

    /// No subnet key produced a matching NetMIC. Expected for foreign traffic.
    #[error("No valid network key")]
    NoValidKey,

    #[error("Replay detected (hash {0:08x})")]
    ReplayDetected(u32),

    #[error("Network PDU pool exhausted")]
    PoolExhausted,

    #[error("Unknown netkey index: {0}")]
    UnknownNetKey(u16),

    #[error("Unknown or released network PDU: {0}")]
    UnknownPdu(String),

    #[error("Invalid addresses: src {src:04x}, dst {dst:04x}")]
    InvalidAddress { src: u16, dst: u16 },

    #[error("Crypto engine error: {0}")]
    Crypto(String),

    #[error("Transmission failed: {0}")]
    Transmission(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mesh network service stopped")]
    ServiceStopped,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MeshError {
    /// Whether this error is a normal drop rather than a fault.
    ///
    /// Foreign-network traffic and retransmissions end in these variants
    /// all the time, so callers should not log them as errors.
    pub fn is_expected_drop(&self) -> bool {
        matches!(self, MeshError::NoValidKey | MeshError::ReplayDetected(_))
    }
}

impl From<ccm::aead::Error> for MeshError {
    fn from(err: ccm::aead::Error) -> Self {
        MeshError::Crypto(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MeshError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MeshError::ServiceStopped
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MeshError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        MeshError::ServiceStopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_drops() {
        assert!(MeshError::NoValidKey.is_expected_drop());
        assert!(MeshError::ReplayDetected(0x1201_0001).is_expected_drop());
        assert!(!MeshError::PoolExhausted.is_expected_drop());
        assert!(!MeshError::MalformedPdu("short".into()).is_expected_drop());
    }

    #[test]
    fn test_error_display() {
        let err = MeshError::InvalidAddress { src: 0, dst: 0x1201 };
        assert_eq!(err.to_string(), "Invalid addresses: src 0000, dst 1201");
        assert_eq!(
            MeshError::ReplayDetected(0x12010001).to_string(),
            "Replay detected (hash 12010001)"
        );
    }
}
