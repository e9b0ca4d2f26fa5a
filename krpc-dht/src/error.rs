use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote never answered within the retry budget.
    #[error("request timed out")]
    Timeout,

    /// The remote answered, but with a KRPC error message.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// The remote broke a protocol rule, e.g. answered from an address the
    /// query was never sent to.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An identical query to the same address is already in flight.
    #[error("identical query already in flight")]
    DuplicateQuery,

    #[error("send failed: {0}")]
    Send(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The node task is gone; no more requests can be made.
    #[error("node task stopped")]
    ChannelClosed,

    /// The node began shutting down while this request was pending.
    #[error("node is shutting down")]
    ShuttingDown,
}
