//! Channels over async byte streams.
//!
//! Every message is encoded with [`codec`](threadwire_protocol::codec) and written as a
//! length-delimited frame. Since bytes are copied into the frame anyway, transferred buffers are
//! detached on the sending side right after encoding, so a transfer has the same observable
//! effect as with in-memory channels.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use threadwire_log::LogError;
use threadwire_protocol::{Buffer, codec, validate_transferables};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::{Channel, ChannelError, Port, Receiver, Sender};

/// The maximum size of a single encoded message.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

struct FramedPort {
    tx: Mutex<Option<flume::Sender<Bytes>>>,
    max_frame_length: usize,
}

impl<M> Port<M> for FramedPort
where
    M: Serialize,
{
    fn send(&self, message: M, transfer: Vec<Buffer>) -> Result<(), ChannelError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(ChannelError::Closed)?;
        if tx.is_disconnected() {
            return Err(ChannelError::Closed);
        }

        validate_transferables(&transfer)?;

        let frame = codec::encode(&message)?;
        // The writer fails on oversized frames, which would close the channel for good.
        if frame.len() > self.max_frame_length {
            return Err(ChannelError::TooLarge(frame.len()));
        }

        for buffer in &transfer {
            buffer.detach();
        }

        tx.send(Bytes::from(frame)).map_err(|_| ChannelError::Closed)
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

async fn write_frames<W>(rx: flume::Receiver<Bytes>, writer: W, max_frame_length: usize)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, frame_codec(max_frame_length));

    while let Ok(frame) = rx.recv_async().await {
        if let Err(error) = sink.send(frame).await {
            threadwire_log::warn!("failed to write frame: {}", LogError(&error));
            return;
        }
    }

    // All senders are gone, signal the end of the stream to the peer.
    if let Err(error) = SinkExt::<Bytes>::close(&mut sink).await {
        threadwire_log::debug!("failed to close writer: {}", LogError(&error));
    }
}

/// Creates a channel that exchanges framed messages over a reader and a writer.
///
/// Writing happens on a background task, so this must be called from within a Tokio runtime.
/// The receiver ends when the reader reaches end of file. Frames that cannot be decoded are
/// yielded as errors and the stream continues with the next frame.
///
/// Messages that encode to more than [`MAX_FRAME_LENGTH`] bytes are rejected by the sender with
/// [`ChannelError::TooLarge`] and leave the channel usable.
pub fn framed<Tx, Rx, R, W>(reader: R, writer: W) -> Channel<Tx, Rx>
where
    Tx: Serialize + 'static,
    Rx: DeserializeOwned + Send + 'static,
    R: AsyncRead + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    framed_with_limit(reader, writer, MAX_FRAME_LENGTH)
}

fn framed_with_limit<Tx, Rx, R, W>(
    reader: R,
    writer: W,
    max_frame_length: usize,
) -> Channel<Tx, Rx>
where
    Tx: Serialize + 'static,
    Rx: DeserializeOwned + Send + 'static,
    R: AsyncRead + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = flume::unbounded();
    tokio::spawn(write_frames(rx, writer, max_frame_length));

    let sender = Sender::new(FramedPort {
        tx: Mutex::new(Some(tx)),
        max_frame_length,
    });

    let frames = FramedRead::new(reader, frame_codec(max_frame_length)).map(|frame| match frame {
        Ok(bytes) => codec::decode(&bytes).map_err(ChannelError::from),
        Err(error) => Err(ChannelError::from(error)),
    });

    Channel::new(sender, Receiver::from_stream(frames))
}
