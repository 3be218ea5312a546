use http::{HeaderMap, StatusCode};

/// Response head, shared with every body notification.
///
/// Header names that repeat on the wire fold to the last value.
#[derive(Debug, Clone)]
pub struct Parts {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

/// A settled response carrying a decoded body.
#[derive(Debug)]
pub struct Response<T> {
    parts: Parts,
    body: T,
}

impl<T> Response<T> {
    pub(crate) fn from_parts(parts: Parts, body: T) -> Self {
        Self { parts, body }
    }

    pub(crate) fn into_parts(self) -> (Parts, T) {
        (self.parts, self.body)
    }

    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    pub fn reason(&self) -> &str {
        &self.parts.reason
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }
}
