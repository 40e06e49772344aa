pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Terminal session failures. A session never retries on its own: the
/// caller inspects the variant, consults the session's retry policy and
/// decides whether to start a fresh session for the same batch.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// DNS failure, connection refused, socket or transport error.
    #[error("network error: {0}")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("no response from tracker within the deadline")]
    Timeout,

    /// Undecodable body, short datagram, wrong response length.
    #[error("malformed tracker response: {0}")]
    MalformedResponse(String),

    /// The tracker answered with an unexpected action or transaction id.
    /// The payload is whatever followed the response header, which for
    /// well-behaved trackers is an error message.
    #[error("tracker protocol error: {}", String::from_utf8_lossy(.payload))]
    TrackerProtocol { payload: Vec<u8> },

    /// The tracker rejected the scrape with a bencoded "failure reason".
    #[error("tracker reported failure: {}", String::from_utf8_lossy(.reason))]
    TrackerFailure { reason: Vec<u8> },

    /// Non-200 answer from an HTTP tracker.
    #[error("tracker rejected the request: {status} {phrase}")]
    TrackerRejected { status: u16, phrase: String },

    /// The session was cleaned up before it could resolve.
    #[error("session was cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn network(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Error {
        Error::Network(e.into())
    }
}
