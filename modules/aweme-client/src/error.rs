use thiserror::Error;

use aweme_common::SessionId;

pub type Result<T> = std::result::Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The platform no longer accepts this account's cookies.
    #[error("session {session} rejected (status {status}) for {url}")]
    SessionInvalid {
        session: SessionId,
        status: u16,
        url: String,
    },

    #[error("giving up on {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: String,
    },

    /// 2xx that is not a plain 200 with a body.
    #[error("unexpected response (status {status}, {len} bytes) for {url}")]
    Unexpected { url: String, status: u16, len: usize },

    /// `status_code != 0`, or a key the envelope must carry is missing.
    #[error("bad envelope from {url}: {detail}")]
    Envelope { url: String, detail: String },

    #[error("{what} went backwards: {previous} -> {current}")]
    CursorRegression {
        what: &'static str,
        previous: String,
        current: String,
    },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("json decode failed for {url}: {message}")]
    Json { url: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}
