use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use super::error::Error;
use super::response::Parts;
use crate::task::Task;

/// Notifications from a streaming exchange, in protocol order.
#[derive(Debug)]
pub enum StreamEvent {
    /// One queued request chunk finished writing.
    SentChunk,
    /// One response body chunk arrived.
    ReceivedChunk {
        data: Bytes,
        /// Head of the response the chunk belongs to.
        response: Arc<Parts>,
    },
    /// The response body completed.
    Done,
    /// The exchange was torn down through [`StreamHandle::abort`].
    Aborted,
    /// The exchange failed.
    Error(Error),
}

pub(crate) enum Cmd {
    Chunk(Bytes),
    Finish,
}

/// Caller side of one streaming exchange.
///
/// Commands queue in call order and the engine works through them one at a
/// time, reporting progress through the event mailbox.
pub struct StreamHandle {
    pub(crate) cmd: UnboundedSender<Cmd>,
    pub(crate) halt: UnboundedSender<()>,
    pub(crate) response: Arc<OnceLock<Arc<Parts>>>,
}

impl StreamHandle {
    /// Queue one request body chunk.
    ///
    /// Settles when the chunk is accepted. The completed write is reported
    /// separately by [`StreamEvent::SentChunk`], one per chunk, in order.
    pub fn send_chunk(&self, data: Bytes) -> Task<(), Error> {
        match self.cmd.send(Cmd::Chunk(data)) {
            Ok(()) => Task::ready(Ok(())),
            Err(_) => Task::ready(Err(Error::closed())),
        }
    }

    /// Terminate the request body.
    ///
    /// Required for chunk framed bodies; with a declared content-length the
    /// engine moves on by itself once the count is reached.
    pub fn finish(&self) -> Task<(), Error> {
        match self.cmd.send(Cmd::Finish) {
            Ok(()) => Task::ready(Ok(())),
            Err(_) => Task::ready(Err(Error::closed())),
        }
    }

    /// Tear down the exchange.
    ///
    /// Never fails. Aborting an already terminal exchange has no further
    /// effect and produces no second notification.
    pub fn abort(&self) -> Task<(), Error> {
        let _ = self.halt.send(());
        Task::ready(Ok(()))
    }

    /// Response head, once it has arrived.
    pub fn response(&self) -> Option<Arc<Parts>> {
        self.response.get().cloned()
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("response", &self.response.get().is_some())
            .finish_non_exhaustive()
    }
}
