use std::time::Duration;

/// Failures raised by the inverter transport and protocol layer.
///
/// Nothing in here is fatal to the poll loop; the coordinator logs the error,
/// counts the failed cycle and tries again on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Discovery timed out, the listener could not be bound, or the peer
    /// dropped the connection.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// Malformed or short envelope, length mismatch, or a reply carrying the
    /// wrong transaction id.
    #[error("frame error: {0}")]
    Frame(String),

    #[error("cannot parse {command} reply: {reason}")]
    FieldParse { command: String, reason: String },

    #[error("unknown inverter model '{0}'")]
    Model(String),

    #[error("no data decoded from inverter")]
    NoData,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors after which the live connection can no longer be trusted.
    pub fn taints_session(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Timeout(_) | Error::Frame(_) | Error::Io(_)
        )
    }

    pub fn field_parse(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::FieldParse {
            command: command.into(),
            reason: reason.into(),
        }
    }
}
