use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use threadwire_protocol::codec::CodecError;
use threadwire_protocol::{Buffer, ControllerMessage, TransferError, WorkerMessage};

/// An error raised by a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel or its peer has been closed.
    #[error("channel is closed")]
    Closed,
    /// The transfer list of a message is invalid.
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// A message could not be encoded or decoded.
    #[error("malformed message")]
    Codec(#[from] CodecError),
    /// An encoded message exceeds the frame length limit of the transport.
    #[error("message of {0} bytes exceeds the frame length limit")]
    TooLarge(usize),
    /// The underlying transport failed.
    #[error("channel i/o error")]
    Io(#[from] io::Error),
}

/// The sending half of a transport.
///
/// Implementations must not block. Queuing the message is enough, delivery happens in the
/// background.
pub trait Port<M>: Send + Sync {
    /// Queues a message, moving the listed buffers to the receiver.
    ///
    /// Once this returns `Ok`, every listed buffer is detached on the sending side.
    fn send(&self, message: M, transfer: Vec<Buffer>) -> Result<(), ChannelError>;

    /// Closes this end of the channel. The peer's receiver ends after all queued messages.
    fn close(&self);
}

/// Sends messages of type `M` to the other end of a channel.
///
/// Senders are cheap to clone, all clones share the same underlying port. Closing one of them
/// closes all of them.
pub struct Sender<M> {
    port: Arc<dyn Port<M>>,
}

impl<M> Sender<M> {
    /// Creates a sender from a transport port.
    pub fn new(port: impl Port<M> + 'static) -> Self {
        Self {
            port: Arc::new(port),
        }
    }

    /// Queues a message without blocking.
    pub fn send(&self, message: M, transfer: Vec<Buffer>) -> Result<(), ChannelError> {
        self.port.send(message, transfer)
    }

    /// Closes the channel.
    pub fn close(&self) {
        self.port.close()
    }
}

impl<M> Clone for Sender<M> {
    fn clone(&self) -> Self {
        Self {
            port: Arc::clone(&self.port),
        }
    }
}

impl<M> fmt::Debug for Sender<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}

/// Receives messages of type `M` from the other end of a channel.
///
/// The stream ends when the peer closes its end. `Err` items report messages that could not be
/// received, the stream may continue after them.
pub struct Receiver<M> {
    stream: BoxStream<'static, Result<M, ChannelError>>,
}

impl<M> Receiver<M> {
    /// Creates a receiver from a stream of incoming messages.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<M, ChannelError>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
        }
    }

    /// Waits for the next message. Returns `None` once the channel has ended.
    pub async fn recv(&mut self) -> Option<Result<M, ChannelError>> {
        self.stream.next().await
    }
}

impl<M> Stream for Receiver<M> {
    type Item = Result<M, ChannelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

impl<M> fmt::Debug for Receiver<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}

/// A bidirectional message channel to the peer.
#[derive(Debug)]
pub struct Channel<Tx, Rx> {
    /// Sends messages to the peer.
    pub sender: Sender<Tx>,
    /// Receives messages from the peer.
    pub receiver: Receiver<Rx>,
}

impl<Tx, Rx> Channel<Tx, Rx> {
    /// Combines both halves into a channel.
    pub fn new(sender: Sender<Tx>, receiver: Receiver<Rx>) -> Self {
        Self { sender, receiver }
    }
}

/// The controller's end of a channel to a worker.
pub type ControllerChannel = Channel<ControllerMessage, WorkerMessage>;

/// The worker's end of a channel to its controller.
pub type WorkerChannel = Channel<WorkerMessage, ControllerMessage>;
