//! Wire codec for one http/1.1 exchange.
use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};

use super::error::Error;
use super::response::Parts;

const MAX_HEADERS: usize = 64;
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

// ===== url =====

/// Connection and request-line coordinates pulled out of a url.
pub(crate) struct Target {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) authority: String,
    pub(crate) path_and_query: String,
}

pub(crate) fn parse_target(url: &str) -> Result<Target, Error> {
    let uri = url.parse::<Uri>().map_err(|err| Error::BadUrl(err.to_string()))?;

    match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
        Some(scheme) => return Err(Error::BadUrl(format!("unsupported scheme: {scheme}"))),
        None => return Err(Error::BadUrl("missing scheme".into())),
    }
    let host = match uri.host() {
        Some(host) => host.to_owned(),
        None => return Err(Error::BadUrl("missing host".into())),
    };
    let port = uri.port_u16().unwrap_or(80);
    let authority = match uri.port_u16() {
        Some(port) => format!("{host}:{port}"),
        None => host.clone(),
    };
    let path_and_query = match uri.path_and_query() {
        Some(pq) => pq.as_str().to_owned(),
        None => "/".into(),
    };

    Ok(Target { host, port, authority, path_and_query })
}

// ===== request head =====

pub(crate) fn validate_headers(headers: &[(String, String)]) -> Result<(), Error> {
    for (name, value) in headers {
        if let Err(err) = HeaderName::try_from(name.as_str()) {
            return Err(Error::BadHeaders(format!("{name}: {err}")));
        }
        if let Err(err) = HeaderValue::try_from(value.as_str()) {
            return Err(Error::BadHeaders(format!("{name}: {err}")));
        }
    }
    Ok(())
}

/// Headers the engine writes itself; caller copies are skipped.
fn engine_owned(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
}

/// Request body advertisement in the head.
#[derive(Clone, Copy)]
pub(crate) enum BodyHeader {
    Length(u64),
    Chunked,
}

/// Request body framing on the wire.
pub(crate) enum SendPlan {
    /// Head and any buffered body go out in one drain.
    Complete,
    /// Streamed body with this many declared bytes left.
    Counted(u64),
    /// Streamed body, chunk framed.
    Chunked,
}

pub(crate) fn encode_head(
    buf: &mut BytesMut,
    method: &Method,
    target: &Target,
    headers: &[(String, String)],
    body: Option<BodyHeader>,
) {
    buf.extend_from_slice(method.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(target.path_and_query.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    buf.extend_from_slice(target.authority.as_bytes());
    // one exchange per connection, an eof delimited response stays readable
    buf.extend_from_slice(b"\r\nConnection: close\r\n");

    match body {
        Some(BodyHeader::Length(len)) => {
            buf.extend_from_slice(b"Content-Length: ");
            buf.extend_from_slice(itoa::Buffer::new().format(len).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Some(BodyHeader::Chunked) => {
            buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        None => {}
    }

    for (name, value) in headers {
        if engine_owned(name) {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
}

pub(crate) fn encode_chunk(buf: &mut BytesMut, data: &[u8]) {
    let size = format!("{:x}\r\n", data.len());
    buf.extend_from_slice(size.as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

pub(crate) fn encode_final_chunk(buf: &mut BytesMut) {
    buf.extend_from_slice(b"0\r\n\r\n");
}

// ===== response head =====

/// Parse a complete response head out of `buf`.
///
/// `None` means more input is needed. Repeated header names fold to the
/// last value on the wire.
pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<(Parts, usize)>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let consumed = match response.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => consumed,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => return Err(Error::Unknown(format!("malformed response: {err}"))),
    };

    let code = response.code.unwrap_or_default();
    let status = StatusCode::from_u16(code)
        .map_err(|_| Error::Unknown(format!("invalid status code: {code}")))?;
    let reason = response.reason.unwrap_or_default().to_owned();

    let mut map = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::Unknown(format!("malformed response header: {}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| Error::Unknown(format!("malformed response header: {}", header.name)))?;
        map.insert(name, value);
    }

    Ok(Some((Parts { status, reason, headers: map }, consumed)))
}

/// Response body framing on the wire.
pub(crate) enum RecvFrame {
    /// No body follows the head.
    None,
    /// Fixed byte count.
    Length(u64),
    /// Chunk framed.
    Chunked,
    /// Delimited by connection close.
    Eof,
}

pub(crate) fn response_framing(method: &Method, parts: &Parts) -> Result<RecvFrame, Error> {
    if *method == Method::HEAD {
        return Ok(RecvFrame::None);
    }
    let status = parts.status;
    if status.is_informational() {
        return Err(Error::Unknown(format!("unsupported informational response: {status}")));
    }
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return Ok(RecvFrame::None);
    }

    if let Some(te) = parts.headers.get(http::header::TRANSFER_ENCODING) {
        let te = te
            .to_str()
            .map_err(|_| Error::Unknown("invalid transfer-encoding".into()))?;
        if te.split(',').any(|coding| coding.trim().eq_ignore_ascii_case("chunked")) {
            return Ok(RecvFrame::Chunked);
        }
        return Ok(RecvFrame::Eof);
    }
    if let Some(len) = parts.headers.get(http::header::CONTENT_LENGTH) {
        let len = len
            .to_str()
            .ok()
            .and_then(|len| len.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::Unknown("invalid content-length".into()))?;
        return Ok(RecvFrame::Length(len));
    }
    Ok(RecvFrame::Eof)
}

// ===== response body =====

/// Incremental response body decoder.
pub(crate) struct BodyDecoder {
    frame: RecvFrame,
    chunk: Chunk,
}

enum Chunk {
    /// Awaiting a size line.
    Size,
    /// Inside chunk data, this many bytes left.
    Data(u64),
    /// Awaiting the crlf closing a chunk.
    Crlf,
    /// Draining the trailer section.
    Trailer,
}

pub(crate) enum Decoded {
    /// One body chunk.
    Data(Bytes),
    /// More input needed.
    NeedMore,
    /// End of body.
    Complete,
}

impl BodyDecoder {
    pub(crate) fn new(frame: RecvFrame) -> Self {
        Self { frame, chunk: Chunk::Size }
    }

    /// Pull the next body chunk out of `buf`.
    ///
    /// `eof` marks that the transport hit end of stream with `buf` holding
    /// the final input.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut, eof: bool) -> Result<Decoded, Error> {
        match &mut self.frame {
            RecvFrame::None => Ok(Decoded::Complete),
            RecvFrame::Length(remaining) => {
                if *remaining == 0 {
                    return Ok(Decoded::Complete);
                }
                if buf.is_empty() {
                    return need_more(eof);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Decoded::Data(buf.split_to(take).freeze()))
            }
            RecvFrame::Eof => {
                if !buf.is_empty() {
                    return Ok(Decoded::Data(buf.split().freeze()));
                }
                if eof { Ok(Decoded::Complete) } else { Ok(Decoded::NeedMore) }
            }
            RecvFrame::Chunked => self.decode_chunked(buf, eof),
        }
    }

    fn decode_chunked(&mut self, buf: &mut BytesMut, eof: bool) -> Result<Decoded, Error> {
        loop {
            match &mut self.chunk {
                Chunk::Size => match httparse::parse_chunk_size(buf) {
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        buf.advance(consumed);
                        self.chunk = if size == 0 { Chunk::Trailer } else { Chunk::Data(size) };
                    }
                    Ok(httparse::Status::Partial) => return need_more(eof),
                    Err(_) => return Err(Error::Unknown("malformed chunk size".into())),
                },
                Chunk::Data(remaining) => {
                    if buf.is_empty() {
                        return need_more(eof);
                    }
                    let take = (*remaining).min(buf.len() as u64) as usize;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.chunk = Chunk::Crlf;
                    }
                    return Ok(Decoded::Data(buf.split_to(take).freeze()));
                }
                Chunk::Crlf => {
                    if buf.len() < 2 {
                        return need_more(eof);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::Unknown("malformed chunk terminator".into()));
                    }
                    buf.advance(2);
                    self.chunk = Chunk::Size;
                }
                Chunk::Trailer => match find_crlf(buf) {
                    Some(0) => {
                        buf.advance(2);
                        return Ok(Decoded::Complete);
                    }
                    Some(line) => buf.advance(line + 2),
                    None => return need_more(eof),
                },
            }
        }
    }
}

fn need_more(eof: bool) -> Result<Decoded, Error> {
    if eof {
        return Err(Error::Unknown("response body cut short".into()));
    }
    Ok(Decoded::NeedMore)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}
