//! Error types of the shard client.

use reqwest::StatusCode;

/// Errors that can happen while talking to a shard service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error emitted from the underlying [`reqwest`] client.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    /// A remote index outside of the configured nodes.
    #[error("no remote configured at index {0}")]
    UnknownRemote(usize),
    /// A response body that is not the expected JSON document.
    #[error("malformed response body: {0}")]
    Json(#[from] serde_json::Error),
    /// Error when URL manipulation fails.
    #[error("invalid url `{url}`: {source}")]
    InvalidUrl {
        /// The URL that failed to parse.
        url: String,
        /// The parser error.
        source: url::ParseError,
    },
    /// The shard answered with an unexpected status code.
    #[error("{url} responded with {status}: {body}")]
    Status {
        /// Status code of the response.
        status: StatusCode,
        /// The requested URL.
        url: String,
        /// The (possibly truncated) response body.
        body: String,
    },
    /// The shard does not know the requested object.
    #[error("object `{id}` not found")]
    NotFound {
        /// Identifier of the requested object.
        id: String,
    },
    /// The shard detected that the stored object no longer matches its identifier.
    #[error("object `{id}` is corrupted: {message}")]
    Corrupted {
        /// Identifier of the requested object.
        id: String,
        /// Reason reported by the shard.
        message: String,
    },
    /// A required field is absent from a response document.
    #[error("response is missing field `{0}`")]
    MissingField(&'static str),
}

/// A convenience alias that defaults our [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
