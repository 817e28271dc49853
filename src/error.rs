use thiserror::Error;

/// Errors surfaced to users of the library.
#[derive(Error, Debug)]
pub enum SpecError {
    /// The operation needs an established session and there is none.
    #[error("not connected to the server")]
    NotConnected,

    /// A blocking operation ran out of time.
    #[error("operation timed out")]
    Timeout,

    /// The server answered a request with an error reply, or a request
    /// was made that the peer's protocol generation cannot express.
    #[error("server error {code}: {message}")]
    Protocol { code: i32, message: String },

    /// Misuse of the signal layer, e.g. revoking a subscription twice.
    #[error("dispatcher: {0}")]
    Dispatcher(String),

    /// The connection dropped while a request was in flight.
    #[error("connection lost while a request was in flight")]
    Disconnected,

    /// A frame that cannot be parsed.
    #[error("malformed frame: {0}")]
    BadFrame(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
