use std::fmt;

use bytes::Bytes;

use super::response::Response;
use crate::task::Canceled;

/// Failure classification for an exchange.
///
/// The first two variants surface at construction, before any connection
/// attempt. The rest map the transport and protocol outcomes.
#[derive(Debug)]
pub enum Error {
    /// The url did not parse, or names an unsupported scheme.
    BadUrl(String),
    /// A header name or value is invalid.
    BadHeaders(String),
    /// The exchange ran past its deadline.
    Timeout,
    /// The response status fell outside `200..=299`.
    ///
    /// Carries the full response for inspection.
    BadStatus(Response<Bytes>),
    /// The response body did not match the declared expectation.
    UnexpectedResponseBody(String),
    /// The exchange was torn down by the caller.
    Aborted,
    /// Transport and protocol failures, with the native detail.
    Unknown(String),
}

impl Error {
    pub(crate) fn closed() -> Self {
        Error::Unknown("stream closed".into())
    }
}

impl From<Canceled> for Error {
    fn from(_: Canceled) -> Self {
        Error::Aborted
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadUrl(detail) => write!(f, "bad url: {detail}"),
            Error::BadHeaders(detail) => write!(f, "bad headers: {detail}"),
            Error::Timeout => f.write_str("request timed out"),
            Error::BadStatus(response) => write!(f, "bad status: {}", response.status()),
            Error::UnexpectedResponseBody(detail) => {
                write!(f, "unexpected response body: {detail}")
            }
            Error::Aborted => f.write_str("request aborted"),
            Error::Unknown(detail) => f.write_str(detail),
        }
    }
}

impl std::error::Error for Error {}
