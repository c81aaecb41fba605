//! Channels to worker processes.
//!
//! A process-backed worker talks to its controller over its standard input and output using
//! [`framed`](crate::io::framed) messages. Anything the worker logs must go to `stderr`.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use parking_lot::Mutex;
use threadwire_log::LogError;
use threadwire_protocol::{Buffer, ControllerMessage};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::{Channel, ChannelError, ControllerChannel, Port, Sender, WorkerChannel, io::framed};

/// Time a worker process gets to exit on its own after its channel was closed.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

struct ProcessPort {
    inner: Sender<ControllerMessage>,
    closed: Mutex<Option<oneshot::Sender<()>>>,
}

impl Port<ControllerMessage> for ProcessPort {
    fn send(&self, message: ControllerMessage, transfer: Vec<Buffer>) -> Result<(), ChannelError> {
        self.inner.send(message, transfer)
    }

    fn close(&self) {
        self.inner.close();
        self.closed.lock().take();
    }
}

fn log_exit(pid: Option<u32>, status: io::Result<ExitStatus>) {
    match status {
        Ok(status) if status.success() => {
            threadwire_log::debug!(pid, "worker process exited");
        }
        Ok(status) => threadwire_log::warn!(pid, "worker process exited with {status}"),
        Err(error) => {
            threadwire_log::error!(pid, "failed to wait for worker process: {}", LogError(&error))
        }
    }
}

/// Supervises the child until it exits.
///
/// Once the channel is closed or dropped, the child has [`KILL_GRACE_PERIOD`] to exit before it
/// is killed.
async fn supervise(mut child: Child, closed: oneshot::Receiver<()>) {
    let pid = child.id();

    tokio::select! {
        status = child.wait() => return log_exit(pid, status),
        _ = closed => (),
    }

    match tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await {
        Ok(status) => log_exit(pid, status),
        Err(_) => {
            threadwire_log::warn!(pid, "worker process did not exit after close, killing it");
            if let Err(error) = child.kill().await {
                threadwire_log::error!(pid, "failed to kill worker process: {}", LogError(&error));
            }
        }
    }
}

/// Spawns a worker process and returns a channel to it.
///
/// The child's standard input and output are replaced by pipes. Its standard error is inherited
/// unless configured otherwise on `command`. Must be called from within a Tokio runtime.
pub fn spawn(mut command: Command) -> io::Result<ControllerChannel> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("worker stdin is not piped"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("worker stdout is not piped"))?;

    threadwire_log::debug!(pid = child.id(), "spawned worker process");

    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(supervise(child, closed_rx));

    let Channel { sender, receiver } = framed(stdout, stdin);
    let sender = Sender::new(ProcessPort {
        inner: sender,
        closed: Mutex::new(Some(closed_tx)),
    });

    Ok(Channel::new(sender, receiver))
}

/// Returns the worker's end of a process-backed channel, connected to stdin and stdout.
///
/// Must be called from within a Tokio runtime.
pub fn stdio() -> WorkerChannel {
    framed(tokio::io::stdin(), tokio::io::stdout())
}
