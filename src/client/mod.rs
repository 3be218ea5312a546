//! Streaming http client with buffered and caller-driven exchanges.
//!
//! [`request`] runs one exchange to completion and settles with the decoded
//! response. [`open_stream`] exposes the same engine chunk by chunk: the
//! caller feeds the request body through a [`StreamHandle`] and watches
//! progress arrive in a [`Mailbox`].
use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::{net::TcpStream, sync::mpsc::unbounded_channel};

use crate::log::debug;
use crate::notify::Mailbox;
use crate::task::Task;

mod codec;
mod driver;
mod error;
mod handle;
mod response;

pub use error::Error;
pub use handle::{StreamEvent, StreamHandle};
pub use response::{Parts, Response};

use codec::{BodyHeader, SendPlan};
use driver::{Connect, Driver, Wire};

/// Default deadline for a whole exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ===== Request =====

/// Everything needed to start an exchange.
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Body,
    timeout: Duration,
}

/// Request body variants.
#[derive(Debug)]
pub enum Body {
    /// No body.
    Empty,
    /// Buffered text.
    Text(String),
    /// Buffered bytes.
    Bytes(Bytes),
    /// Fed chunk by chunk through a [`StreamHandle`].
    ///
    /// A caller supplied `content-length` header declares the byte count;
    /// without one the body goes out chunk framed and needs
    /// [`StreamHandle::finish`].
    Stream,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Empty,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Append one header; names may repeat.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.body(Body::Text(text.into()))
    }

    pub fn bytes(self, bytes: impl Into<Bytes>) -> Self {
        self.body(Body::Bytes(bytes.into()))
    }

    /// Body will be fed through the stream handle.
    pub fn stream(self) -> Self {
        self.body(Body::Stream)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ===== Expect =====

/// Declared shape of the response body.
pub struct Expect<T> {
    require_empty: bool,
    decode: Box<dyn FnOnce(Bytes) -> Result<T, Error> + Send>,
}

impl Expect<()> {
    /// Require an empty body.
    pub fn discard() -> Self {
        Self { require_empty: true, decode: Box::new(|_| Ok(())) }
    }

    /// Accept and ignore whatever arrives.
    pub fn opaque() -> Self {
        Self { require_empty: false, decode: Box::new(|_| Ok(())) }
    }
}

impl Expect<Bytes> {
    /// Raw body bytes.
    pub fn bytes() -> Self {
        Self { require_empty: false, decode: Box::new(Ok) }
    }
}

impl Expect<String> {
    /// Body decoded as utf-8 text.
    pub fn text() -> Self {
        Self {
            require_empty: false,
            decode: Box::new(|body| {
                String::from_utf8(Vec::from(body))
                    .map_err(|err| Error::UnexpectedResponseBody(format!("invalid utf-8: {err}")))
            }),
        }
    }
}

impl<T> Expect<T> {
    /// Body passed through `decode`; its error surfaces as
    /// [`Error::UnexpectedResponseBody`].
    pub fn decoded<F>(decode: F) -> Self
    where
        F: FnOnce(Bytes) -> Result<T, String> + Send + 'static,
    {
        Self {
            require_empty: false,
            decode: Box::new(|body| decode(body).map_err(Error::UnexpectedResponseBody)),
        }
    }

    fn apply(self, body: Bytes) -> Result<T, Error> {
        if self.require_empty && !body.is_empty() {
            return Err(Error::UnexpectedResponseBody(format!(
                "expected empty body, got {} bytes",
                body.len()
            )));
        }
        (self.decode)(body)
    }
}

impl<T> fmt::Debug for Expect<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Expect")
            .field("require_empty", &self.require_empty)
            .finish_non_exhaustive()
    }
}

// ===== operations =====

/// Run one exchange to completion with the body buffered both ways.
///
/// The task settles once the response body is complete: decoded per
/// `expect` for a status in `200..=299`, as [`Error::BadStatus`] carrying
/// the full response otherwise.
pub fn request<T>(request: Request, expect: Expect<T>) -> Task<Response<T>, Error>
where
    T: Send + 'static,
{
    if matches!(request.body, Body::Stream) {
        return Task::ready(Err(Error::Unknown(
            "streamed request body requires open_stream".into(),
        )));
    }
    let built = match build(&request) {
        Ok(built) => built,
        Err(err) => return Task::ready(Err(err)),
    };
    debug!("{} {}", request.method, request.url);

    Task::bind(|settle| {
        let (events, rx) = Mailbox::channel();
        let handle = start(built, events);
        let slot = Arc::clone(&handle.response);
        let halt = handle.halt.clone();

        let abort = tokio::spawn(async move {
            settle.resolve(accumulate(rx, slot, expect).await);
        })
        .abort_handle();

        Some(Box::new(move || {
            let _ = halt.send(());
            abort.abort();
        }))
    })
}

/// Start an exchange with the request body fed through the handle.
///
/// Settles with the handle as soon as the exchange is underway; progress
/// and the response arrive through `events`.
pub fn open_stream(request: Request, events: Mailbox<StreamEvent>) -> Task<StreamHandle, Error> {
    let built = match build(&request) {
        Ok(built) => built,
        Err(err) => return Task::ready(Err(err)),
    };
    debug!("{} {} (streaming)", request.method, request.url);
    Task::ready(Ok(start(built, events)))
}

// ===== wiring =====

struct Built {
    wire: Wire,
    host: String,
    port: u16,
}

/// Construction stage: everything that can fail before a connection.
fn build(request: &Request) -> Result<Built, Error> {
    let target = codec::parse_target(&request.url)?;
    codec::validate_headers(&request.headers)?;

    let (plan, body_header, payload) = match &request.body {
        Body::Empty => (SendPlan::Complete, None, None),
        Body::Text(text) => (
            SendPlan::Complete,
            Some(BodyHeader::Length(text.len() as u64)),
            Some(Bytes::copy_from_slice(text.as_bytes())),
        ),
        Body::Bytes(bytes) => (
            SendPlan::Complete,
            Some(BodyHeader::Length(bytes.len() as u64)),
            Some(bytes.clone()),
        ),
        Body::Stream => match declared_length(&request.headers)? {
            Some(len) => (SendPlan::Counted(len), Some(BodyHeader::Length(len)), None),
            None => (SendPlan::Chunked, Some(BodyHeader::Chunked), None),
        },
    };

    let mut head = BytesMut::new();
    codec::encode_head(&mut head, &request.method, &target, &request.headers, body_header);
    if let Some(payload) = payload {
        head.extend_from_slice(&payload);
    }

    Ok(Built {
        wire: Wire {
            method: request.method.clone(),
            head,
            plan,
            timeout: request.timeout,
        },
        host: target.host,
        port: target.port,
    })
}

/// Advertised length of a streamed body, from the caller's own header.
fn declared_length(headers: &[(String, String)]) -> Result<Option<u64>, Error> {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            let len = value
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::BadHeaders(format!("invalid content-length: {value}")))?;
            return Ok(Some(len));
        }
    }
    Ok(None)
}

/// Wire a driver over a fresh tcp connection.
fn start(built: Built, events: Mailbox<StreamEvent>) -> StreamHandle {
    let Built { wire, host, port } = built;
    let connect: Connect<TcpStream> =
        Box::pin(async move { TcpStream::connect((host, port)).await });
    spawn_driver(connect, wire, events)
}

/// Wire a driver over any transport; the test suite drives in-memory pairs
/// through here.
fn spawn_driver<IO>(connect: Connect<IO>, wire: Wire, events: Mailbox<StreamEvent>) -> StreamHandle
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = unbounded_channel();
    let (halt_tx, halt_rx) = unbounded_channel();
    let slot = Arc::new(OnceLock::new());

    tokio::spawn(Driver::new(connect, wire, cmd_rx, halt_rx, events, Arc::clone(&slot)));

    StreamHandle { cmd: cmd_tx, halt: halt_tx, response: slot }
}

/// Fold the event stream of one buffered exchange into a settled response.
async fn accumulate<T>(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<StreamEvent>,
    slot: Arc<OnceLock<Arc<Parts>>>,
    expect: Expect<T>,
) -> Result<Response<T>, Error> {
    let mut body = BytesMut::new();
    loop {
        match rx.recv().await {
            Some(StreamEvent::ReceivedChunk { data, .. }) => body.extend_from_slice(&data),
            Some(StreamEvent::Done) => break,
            Some(StreamEvent::Error(err)) => return Err(err),
            Some(StreamEvent::Aborted) => return Err(Error::Aborted),
            Some(StreamEvent::SentChunk) => {}
            None => return Err(Error::Unknown("exchange interrupted".into())),
        }
    }

    let parts = match slot.get() {
        Some(parts) => Parts::clone(parts),
        None => return Err(Error::Unknown("response completed without a head".into())),
    };
    let response = Response::from_parts(parts, body.freeze());
    if !response.status().is_success() {
        return Err(Error::BadStatus(response));
    }
    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, expect.apply(body)?))
}

#[cfg(test)]
mod test;
