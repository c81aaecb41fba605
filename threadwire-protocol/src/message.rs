use serde::{Deserialize, Serialize};

use crate::{Buffer, TaskUid, Value, VisitBuffers};

/// Messages sent from a controller to one of its workers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    /// Invokes `method` with `args`. The reply carries the same `uid`.
    Run {
        /// Correlates the reply with this call.
        uid: TaskUid,
        /// Name of a method listed in the worker's init message.
        method: String,
        /// Positional arguments with all transfer descriptors removed.
        args: Vec<Value>,
    },
    /// Stops accepting new work and shuts down.
    Terminate {
        /// Shuts down a shared worker context instead of disconnecting just this client.
        #[serde(default)]
        force_terminate_shared: bool,
    },
}

impl ControllerMessage {
    /// Returns the name of this message variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Terminate { .. } => "terminate",
        }
    }
}

impl VisitBuffers for ControllerMessage {
    fn visit_buffers(&mut self, f: &mut dyn FnMut(&mut Buffer)) {
        match self {
            Self::Run { args, .. } => args.iter_mut().for_each(|arg| arg.visit_buffers(f)),
            Self::Terminate { .. } => (),
        }
    }
}

/// Messages sent from a worker back to its controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Sent exactly once, before any call is accepted. Lists the callable surface.
    Init {
        /// Names of all exposed methods.
        method_names: Vec<String>,
    },
    /// Successful completion of a call.
    TaskResult {
        /// Identifier of the completed call.
        uid: TaskUid,
        /// The returned value with the transfer descriptor removed.
        result: Value,
    },
    /// The invoked method failed.
    TaskError {
        /// Identifier of the failed call.
        uid: TaskUid,
        /// Text of the worker-side error.
        error_message: String,
    },
    /// An error not attributable to any call.
    UncaughtError {
        /// Text of the worker-side error.
        error_message: String,
    },
}

impl WorkerMessage {
    /// Returns the name of this message variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::TaskResult { .. } => "task_result",
            Self::TaskError { .. } => "task_error",
            Self::UncaughtError { .. } => "uncaught_error",
        }
    }
}

impl VisitBuffers for WorkerMessage {
    fn visit_buffers(&mut self, f: &mut dyn FnMut(&mut Buffer)) {
        match self {
            Self::TaskResult { result, .. } => result.visit_buffers(f),
            Self::Init { .. } | Self::TaskError { .. } | Self::UncaughtError { .. } => (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_run_arguments() {
        let buffer = Buffer::from(vec![1, 2]);
        let mut message = ControllerMessage::Run {
            uid: TaskUid::new(),
            method: "fill".to_owned(),
            args: vec![Value::from(1), Value::Buffer(buffer.clone())],
        };

        let mut count = 0;
        message.visit_buffers(&mut |b| {
            assert!(b.same_buffer(&buffer));
            count += 1;
        });

        assert_eq!(count, 1);
    }

    #[test]
    fn test_kind() {
        let message = WorkerMessage::UncaughtError {
            error_message: "boom".to_owned(),
        };
        assert_eq!(message.kind(), "uncaught_error");
        assert_eq!(
            ControllerMessage::Terminate {
                force_terminate_shared: false
            }
            .kind(),
            "terminate"
        );
    }
}
