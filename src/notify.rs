//! Fire-and-forget delivery from native event sources into the program.
use std::{
    fmt, io,
    pin::Pin,
    task::{Poll, ready},
};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tokio::{
    io::{AsyncRead, ReadBuf},
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::AbortHandle,
};

use crate::log::debug;

/// Message intake of the hosting program.
///
/// Delivery never blocks the native side and carries no reply. The only
/// feedback is whether the receiving end is still listening.
pub struct Mailbox<M> {
    tx: UnboundedSender<M>,
}

impl<M> Mailbox<M> {
    /// Create a mailbox along with the receiving end.
    pub fn channel() -> (Self, UnboundedReceiver<M>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue `message` in arrival order.
    ///
    /// Returns `false` when the receiving end is gone; the message is
    /// discarded in that case.
    pub fn deliver(&self, message: M) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Whether the receiving end has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<M> From<UnboundedSender<M>> for Mailbox<M> {
    fn from(tx: UnboundedSender<M>) -> Self {
        Self { tx }
    }
}

impl<M> fmt::Debug for Mailbox<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mailbox").finish_non_exhaustive()
    }
}

// ===== Subscription =====

/// Bridge a native event source into mailbox messages.
///
/// Every item `source` yields is converted and delivered, zero or more
/// times, until the source ends, the mailbox closes, or the subscription is
/// detached. Dropping the returned [`Subscription`] leaves the bridge
/// running.
pub fn subscribe<S, M, F>(source: S, mailbox: Mailbox<M>, convert: F) -> Subscription
where
    S: Stream + Send + 'static,
    M: Send + 'static,
    F: FnMut(S::Item) -> M + Send + 'static,
{
    let pump = Pump { source: Box::pin(source), mailbox, convert };
    Subscription { abort: tokio::spawn(pump).abort_handle() }
}

/// Detach capability of an active subscription.
///
/// The pump holds the source, so detaching also drops the source and
/// whatever native resource keeps it alive.
pub struct Subscription {
    abort: AbortHandle,
}

impl Subscription {
    /// Stop deliveries and release the source.
    ///
    /// Idempotent; calling again after the pump stopped does nothing.
    pub fn detach(&self) {
        self.abort.abort();
    }

    /// Whether the pump has stopped, by detach or on its own.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("finished", &self.is_finished())
            .finish()
    }
}

struct Pump<S, M, F> {
    source: Pin<Box<S>>,
    mailbox: Mailbox<M>,
    convert: F,
}

impl<S, M, F> Unpin for Pump<S, M, F> {}

impl<S, M, F> Future for Pump<S, M, F>
where
    S: Stream,
    F: FnMut(S::Item) -> M,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context) -> Poll<()> {
        let me = self.get_mut();
        loop {
            match ready!(me.source.as_mut().poll_next(cx)) {
                Some(item) => {
                    let message = (me.convert)(item);
                    if !me.mailbox.deliver(message) {
                        debug!("mailbox closed, stopping subscription");
                        return Poll::Ready(());
                    }
                }
                None => return Poll::Ready(()),
            }
        }
    }
}

// ===== ReadSource =====

/// [`Stream`] of byte chunks pulled from an [`AsyncRead`] source.
///
/// Yields chunks as the source produces them and ends on EOF. An io error
/// is yielded once, then the stream ends. Pairs with [`subscribe`] to feed
/// raw input such as a pipe into a mailbox.
pub struct ReadSource<R> {
    io: R,
    buffer: BytesMut,
    done: bool,
}

const READ_CHUNK: usize = 0x2000;

impl<R> ReadSource<R> {
    pub fn new(io: R) -> Self {
        Self { io, buffer: BytesMut::new(), done: false }
    }
}

impl<R> Stream for ReadSource<R>
where
    R: AsyncRead + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut std::task::Context) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        if me.done {
            return Poll::Ready(None);
        }

        if me.buffer.capacity() < READ_CHUNK {
            me.buffer.reserve(READ_CHUNK);
        }

        let mut buf = ReadBuf::uninit(me.buffer.spare_capacity_mut());
        match ready!(Pin::new(&mut me.io).poll_read(cx, &mut buf)) {
            Ok(()) => {}
            Err(err) => {
                me.done = true;
                return Poll::Ready(Some(Err(err)));
            }
        }

        let read = buf.filled().len();
        if read == 0 {
            me.done = true;
            return Poll::Ready(None);
        }

        // SAFETY: `poll_read` initialized `read` bytes of the spare capacity
        unsafe { me.buffer.set_len(me.buffer.len() + read) };
        Poll::Ready(Some(Ok(me.buffer.split().freeze())))
    }
}

impl<R> fmt::Debug for ReadSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReadSource")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
