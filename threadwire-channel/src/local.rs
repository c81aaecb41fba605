//! In-memory channels between threads of the same process.
//!
//! Messages are handed over through unbounded [`flume`] queues. Before a message is queued, it is
//! passed through [`structured_clone`], so that the receiving side never shares memory with the
//! sender: transferred buffers move, all other buffers are copied.

use futures::StreamExt;
use parking_lot::Mutex;
use threadwire_protocol::{Buffer, VisitBuffers, structured_clone};

use crate::{Channel, ChannelError, Port, Receiver, Sender};

struct LocalPort<M> {
    tx: Mutex<Option<flume::Sender<M>>>,
}

impl<M> Port<M> for LocalPort<M>
where
    M: VisitBuffers + Send,
{
    fn send(&self, message: M, transfer: Vec<Buffer>) -> Result<(), ChannelError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(ChannelError::Closed)?;
        if tx.is_disconnected() {
            return Err(ChannelError::Closed);
        }

        let message = structured_clone(message, transfer)?;
        tx.send(message).map_err(|_| ChannelError::Closed)
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

fn half<M>() -> (Sender<M>, Receiver<M>)
where
    M: VisitBuffers + Send + 'static,
{
    let (tx, rx) = flume::unbounded();
    let sender = Sender::new(LocalPort {
        tx: Mutex::new(Some(tx)),
    });
    let receiver = Receiver::from_stream(rx.into_stream().map(Ok));
    (sender, receiver)
}

/// Creates a connected pair of in-memory channels.
///
/// Messages sent on one channel are received on the other. Closing or dropping the sender of one
/// channel ends the receiver of the other.
///
/// # Example
///
/// ```
/// use threadwire_channel::{ControllerChannel, WorkerChannel, local};
///
/// let (controller, worker): (ControllerChannel, WorkerChannel) = local::pair();
/// ```
pub fn pair<A, B>() -> (Channel<A, B>, Channel<B, A>)
where
    A: VisitBuffers + Send + 'static,
    B: VisitBuffers + Send + 'static,
{
    let (a_tx, a_rx) = half::<A>();
    let (b_tx, b_rx) = half::<B>();
    (Channel::new(a_tx, b_rx), Channel::new(b_tx, a_rx))
}
