//! Error types for echo connections.
//!
//! Errors are local to one connection. The orchestrator counts them,
//! nothing above it treats them as fatal.

use std::io;

/// Why a connection (or a connection attempt) terminated abnormally.
#[derive(Debug)]
pub enum EchoError {
    /// Dial or accept failed (refused, reset, timed out while connecting).
    Establishment(io::Error),
    /// The transport rejected the send/receive timeout configuration.
    TimeoutConfiguration(io::Error),
    /// The echoed line did not match the line the client last sent.
    ProtocolViolation { expected: Vec<u8>, received: Vec<u8> },
    /// The transport failed with an I/O error after the connection was up.
    AbnormalDisconnect(io::Error),
    /// The connection was discarded before it finished, e.g. on interrupt.
    Cancelled,
}

impl std::fmt::Display for EchoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EchoError::Establishment(e) => write!(f, "Failed to establish connection: {}", e),
            EchoError::TimeoutConfiguration(e) => {
                write!(f, "Failed to set socket I/O timeouts: {}", e)
            }
            EchoError::ProtocolViolation { expected, received } => write!(
                f,
                "Received unexpected data: expected {:?}, got {:?}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(received)
            ),
            EchoError::AbnormalDisconnect(e) => write!(f, "Connection lost: {}", e),
            EchoError::Cancelled => write!(f, "Connection cancelled"),
        }
    }
}

impl std::error::Error for EchoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EchoError::Establishment(e)
            | EchoError::TimeoutConfiguration(e)
            | EchoError::AbnormalDisconnect(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_is_io_error() {
        use std::error::Error;

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(EchoError::Establishment(refused).source().is_some());
        assert!(EchoError::Cancelled.source().is_none());
    }

    #[test]
    fn test_protocol_violation_display() {
        let err = EchoError::ProtocolViolation {
            expected: b"hello".to_vec(),
            received: b"hellO".to_vec(),
        };
        assert_eq!(
            err.to_string(),
            "Received unexpected data: expected \"hello\", got \"hellO\""
        );
    }
}
