//! Exchange state machine, one connection per exchange.
use std::{
    io,
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Poll, ready},
    time::Duration,
};

use bytes::{Buf, BytesMut};
use http::Method;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc::UnboundedReceiver,
    time::Sleep,
};

use crate::log::{debug, warning};
use crate::notify::Mailbox;

use super::codec::{self, BodyDecoder, Decoded, MAX_HEAD_SIZE, SendPlan};
use super::error::Error;
use super::handle::{Cmd, StreamEvent};
use super::response::Parts;

pub(crate) type Connect<IO> = Pin<Box<dyn Future<Output = io::Result<IO>> + Send>>;

/// Everything the driver needs besides the transport.
pub(crate) struct Wire {
    pub(crate) method: Method,
    /// Encoded head, plus the whole body when buffered.
    pub(crate) head: BytesMut,
    pub(crate) plan: SendPlan,
    pub(crate) timeout: Duration,
}

/// Drives one exchange from connect to a terminal state.
///
/// Progress surfaces through the event mailbox; the deadline and the abort
/// channel cut in from any state. Reaching a terminal state drops the
/// transport, which is what releases the connection.
pub(crate) struct Driver<IO> {
    transport: Transport<IO>,
    phase: Phase,
    plan: SendPlan,
    method: Method,
    write_buf: BytesMut,
    read_buf: BytesMut,
    deadline: Pin<Box<Sleep>>,
    cmd: UnboundedReceiver<Cmd>,
    halt: UnboundedReceiver<()>,
    events: Mailbox<StreamEvent>,
    response_slot: Arc<OnceLock<Arc<Parts>>>,
    parts: Option<Arc<Parts>>,
    decoder: Option<BodyDecoder>,
    chunk_pending: bool,
    finishing: bool,
}

enum Transport<IO> {
    Connecting(Connect<IO>),
    Ready(IO),
    Gone,
}

#[derive(Clone, Copy, PartialEq)]
enum Phase {
    Connecting,
    Sending,
    Streaming,
    Awaiting,
    Receiving,
    Terminal,
}

enum Step {
    /// State advanced, go around again.
    Continue,
    /// Body complete.
    Done,
    /// Exchange failed.
    Fail(Error),
    /// Stop without an event, the listeners are gone.
    Stop,
}

impl<IO> Driver<IO> {
    pub(crate) fn new(
        connect: Connect<IO>,
        wire: Wire,
        cmd: UnboundedReceiver<Cmd>,
        halt: UnboundedReceiver<()>,
        events: Mailbox<StreamEvent>,
        response_slot: Arc<OnceLock<Arc<Parts>>>,
    ) -> Self {
        Self {
            transport: Transport::Connecting(connect),
            phase: Phase::Connecting,
            plan: wire.plan,
            method: wire.method,
            write_buf: wire.head,
            read_buf: BytesMut::new(),
            deadline: Box::pin(tokio::time::sleep(wire.timeout)),
            cmd,
            halt,
            events,
            response_slot,
            parts: None,
            decoder: None,
            chunk_pending: false,
            finishing: false,
        }
    }
}

impl<IO> Unpin for Driver<IO> {}

impl<IO> Future for Driver<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context) -> Poll<Self::Output> {
        let me = self.as_mut().get_mut();
        loop {
            if me.phase == Phase::Terminal {
                return Poll::Ready(());
            }
            if me.poll_interrupts(cx) {
                continue;
            }
            match me.poll_step(cx) {
                Poll::Ready(Step::Continue) => {}
                Poll::Ready(Step::Done) => me.finish(StreamEvent::Done),
                Poll::Ready(Step::Fail(err)) => me.finish(StreamEvent::Error(err)),
                Poll::Ready(Step::Stop) => me.stop(),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<IO> Driver<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Deadline and abort, checked in every state.
    ///
    /// Returns `true` when the exchange just went terminal.
    fn poll_interrupts(&mut self, cx: &mut std::task::Context) -> bool {
        if let Poll::Ready(Some(())) = self.halt.poll_recv(cx) {
            debug!("exchange aborted");
            self.finish(StreamEvent::Aborted);
            return true;
        }
        if self.deadline.as_mut().poll(cx).is_ready() {
            debug!("exchange deadline passed");
            self.finish(StreamEvent::Error(Error::Timeout));
            return true;
        }
        false
    }

    fn poll_step(&mut self, cx: &mut std::task::Context) -> Poll<Step> {
        match self.phase {
            Phase::Connecting => self.poll_connect(cx),
            Phase::Sending => self.poll_send(cx),
            Phase::Streaming => self.poll_stream(cx),
            Phase::Awaiting => self.poll_head(cx),
            Phase::Receiving => self.poll_body(cx),
            Phase::Terminal => Poll::Ready(Step::Continue),
        }
    }

    fn poll_connect(&mut self, cx: &mut std::task::Context) -> Poll<Step> {
        let Transport::Connecting(connect) = &mut self.transport else {
            unreachable!("connecting phase without a pending connect")
        };
        match ready!(connect.as_mut().poll(cx)) {
            Ok(io) => {
                debug!("transport established");
                self.transport = Transport::Ready(io);
                self.phase = Phase::Sending;
                Poll::Ready(Step::Continue)
            }
            Err(err) => Poll::Ready(Step::Fail(Error::Unknown(format!("connect: {err}")))),
        }
    }

    fn poll_send(&mut self, cx: &mut std::task::Context) -> Poll<Step> {
        let Transport::Ready(io) = &mut self.transport else {
            unreachable!("no transport")
        };
        if let Err(err) = ready!(poll_drain(io, &mut self.write_buf, cx)) {
            return Poll::Ready(Step::Fail(Error::Unknown(format!("send: {err}"))));
        }
        self.phase = match self.plan {
            SendPlan::Complete => {
                debug!("request sent");
                Phase::Awaiting
            }
            _ => Phase::Streaming,
        };
        Poll::Ready(Step::Continue)
    }

    fn poll_stream(&mut self, cx: &mut std::task::Context) -> Poll<Step> {
        if !self.write_buf.is_empty() {
            let Transport::Ready(io) = &mut self.transport else {
                unreachable!("no transport")
            };
            if let Err(err) = ready!(poll_drain(io, &mut self.write_buf, cx)) {
                return Poll::Ready(Step::Fail(Error::Unknown(format!("send: {err}"))));
            }
        }

        if self.chunk_pending {
            self.chunk_pending = false;
            if !self.events.deliver(StreamEvent::SentChunk) {
                return Poll::Ready(Step::Stop);
            }
        }

        if self.finishing || matches!(self.plan, SendPlan::Counted(0)) {
            debug!("request body complete");
            self.phase = Phase::Awaiting;
            return Poll::Ready(Step::Continue);
        }

        match ready!(self.cmd.poll_recv(cx)) {
            Some(cmd) => Poll::Ready(self.apply(cmd)),
            None => {
                // handle dropped with the body unterminated
                warning!("stream handle dropped before finish");
                Poll::Ready(Step::Stop)
            }
        }
    }

    fn apply(&mut self, cmd: Cmd) -> Step {
        match cmd {
            Cmd::Chunk(data) => {
                if data.is_empty() {
                    // nothing to write, still acknowledged
                    self.chunk_pending = true;
                    return Step::Continue;
                }
                match &mut self.plan {
                    SendPlan::Counted(remaining) => {
                        let len = data.len() as u64;
                        if len > *remaining {
                            return Step::Fail(Error::Unknown(
                                "request body exceeds declared content-length".into(),
                            ));
                        }
                        *remaining -= len;
                        self.write_buf.extend_from_slice(&data);
                    }
                    SendPlan::Chunked => codec::encode_chunk(&mut self.write_buf, &data),
                    SendPlan::Complete => unreachable!("buffered exchange takes no commands"),
                }
                self.chunk_pending = true;
                Step::Continue
            }
            Cmd::Finish => match self.plan {
                SendPlan::Counted(remaining) if remaining > 0 => Step::Fail(Error::Unknown(
                    "request body shorter than declared content-length".into(),
                )),
                SendPlan::Counted(_) => {
                    self.finishing = true;
                    Step::Continue
                }
                SendPlan::Chunked => {
                    codec::encode_final_chunk(&mut self.write_buf);
                    self.finishing = true;
                    Step::Continue
                }
                SendPlan::Complete => unreachable!("buffered exchange takes no commands"),
            },
        }
    }

    fn poll_head(&mut self, cx: &mut std::task::Context) -> Poll<Step> {
        loop {
            match codec::parse_head(&self.read_buf) {
                Err(err) => return Poll::Ready(Step::Fail(err)),
                Ok(Some((parts, consumed))) => {
                    self.read_buf.advance(consumed);
                    let frame = match codec::response_framing(&self.method, &parts) {
                        Ok(frame) => frame,
                        Err(err) => return Poll::Ready(Step::Fail(err)),
                    };
                    debug!("response head: {}", parts.status);
                    let parts = Arc::new(parts);
                    let _ = self.response_slot.set(Arc::clone(&parts));
                    self.parts = Some(parts);
                    self.decoder = Some(BodyDecoder::new(frame));
                    self.phase = Phase::Receiving;
                    return Poll::Ready(Step::Continue);
                }
                Ok(None) => {
                    if self.read_buf.len() > MAX_HEAD_SIZE {
                        return Poll::Ready(Step::Fail(Error::Unknown(
                            "response head too large".into(),
                        )));
                    }
                    let Transport::Ready(io) = &mut self.transport else {
                        unreachable!("no transport")
                    };
                    match ready!(poll_read(io, &mut self.read_buf, cx)) {
                        Ok(0) => {
                            return Poll::Ready(Step::Fail(Error::Unknown(
                                "connection closed before response head".into(),
                            )));
                        }
                        Ok(_) => {}
                        Err(err) => {
                            return Poll::Ready(Step::Fail(Error::Unknown(format!(
                                "receive: {err}"
                            ))));
                        }
                    }
                }
            }
        }
    }

    fn poll_body(&mut self, cx: &mut std::task::Context) -> Poll<Step> {
        let mut eof = false;
        loop {
            let Some(decoder) = &mut self.decoder else {
                unreachable!("receiving body without a decoder")
            };
            match decoder.decode(&mut self.read_buf, eof) {
                Err(err) => return Poll::Ready(Step::Fail(err)),
                Ok(Decoded::Complete) => return Poll::Ready(Step::Done),
                Ok(Decoded::Data(data)) => {
                    let Some(parts) = &self.parts else {
                        unreachable!("receiving body without a head")
                    };
                    let event =
                        StreamEvent::ReceivedChunk { data, response: Arc::clone(parts) };
                    if !self.events.deliver(event) {
                        return Poll::Ready(Step::Stop);
                    }
                }
                Ok(Decoded::NeedMore) => {
                    let Transport::Ready(io) = &mut self.transport else {
                        unreachable!("no transport")
                    };
                    match ready!(poll_read(io, &mut self.read_buf, cx)) {
                        Ok(0) => eof = true,
                        Ok(_) => {}
                        Err(err) => {
                            return Poll::Ready(Step::Fail(Error::Unknown(format!(
                                "receive: {err}"
                            ))));
                        }
                    }
                }
            }
        }
    }

    /// Drop the transport and report the terminal event.
    fn finish(&mut self, event: StreamEvent) {
        if self.phase == Phase::Terminal {
            return;
        }
        self.stop();
        if !self.events.deliver(event) {
            debug!("event mailbox closed");
        }
    }

    /// Drop the transport without an event.
    fn stop(&mut self) {
        self.phase = Phase::Terminal;
        self.transport = Transport::Gone;
    }
}

// ===== io helpers =====

const READ_CHUNK: usize = 0x2000;

fn poll_drain<IO>(
    io: &mut IO,
    buf: &mut BytesMut,
    cx: &mut std::task::Context,
) -> Poll<io::Result<()>>
where
    IO: AsyncWrite + Unpin,
{
    while !buf.is_empty() {
        let written = ready!(Pin::new(&mut *io).poll_write(cx, buf))?;
        if written == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        buf.advance(written);
    }
    Pin::new(io).poll_flush(cx)
}

fn poll_read<IO>(
    io: &mut IO,
    buf: &mut BytesMut,
    cx: &mut std::task::Context,
) -> Poll<io::Result<usize>>
where
    IO: AsyncRead + Unpin,
{
    buf.reserve(READ_CHUNK);
    let mut read_buf = ReadBuf::uninit(buf.spare_capacity_mut());
    ready!(Pin::new(io).poll_read(cx, &mut read_buf))?;
    let read = read_buf.filled().len();
    // SAFETY: `poll_read` initialized `read` bytes of the spare capacity
    unsafe { buf.set_len(buf.len() + read) };
    Poll::Ready(Ok(read))
}
