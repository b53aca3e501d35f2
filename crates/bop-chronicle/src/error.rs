use std::fmt::Display;

use super::config::CycleId;

/// A specialized error type for chronicle operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ChronicleError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Stored bytes failed validation.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// The cycle reached its configured entry capacity.
    #[error("cycle {0} is full")]
    CycleFull(CycleId),
    /// The cycle id does not fit in the high bits left over by the index.
    #[error("cycle {cycle} index {index} does not fit a record number with {index_bits} index bits")]
    RecordNumberOverflow {
        cycle: CycleId,
        index: u64,
        index_bits: u32,
    },
    /// A record frame cannot fit into a single data extent.
    #[error("record of {len} bytes exceeds the maximum of {max} bytes")]
    RecordTooLarge { len: u64, max: u64 },
    /// A write went past the capacity reserved by `start_excerpt`.
    #[error("excerpt capacity exceeded: requested {requested} bytes, {remaining} remaining")]
    CapacityExceeded { requested: usize, remaining: usize },
    /// A read went past the end of the current record.
    #[error("buffer underflow: requested {requested} bytes, {remaining} remaining")]
    BufferUnderflow { requested: usize, remaining: usize },
    /// Text in the current record could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Another appender already owns the chronicle.
    #[error("an appender is already active for this chronicle")]
    AppenderBusy,
    /// The chronicle was closed.
    #[error("chronicle is closed")]
    Closed,
    /// The replication peer violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ChronicleError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }

    /// Create a protocol violation error from a displayable value.
    pub fn protocol<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Protocol(msg.to_string())
    }

    /// Returns true when the error came from a socket timing out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ChronicleError::Io(err)
                if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
        )
    }
}

/// A Result type alias for chronicle operations.
pub type ChronicleResult<T> = Result<T, ChronicleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_helper() {
        let err = ChronicleError::invalid_config("bad path");
        assert!(matches!(err, ChronicleError::InvalidConfig(msg) if msg == "bad path"));
    }

    #[test]
    fn timeout_detection() {
        let err = ChronicleError::from(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        assert!(err.is_timeout());
        let err = ChronicleError::protocol("bad frame");
        assert!(!err.is_timeout());
    }
}
