use crate::{Buffer, Value};

/// Errors raised when a value cannot be transferred.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TransferError {
    /// The value passed as a transferable is not a buffer.
    #[error("object is not transferable: found {0}")]
    NotTransferable(&'static str),
    /// A listed buffer was already moved elsewhere.
    #[error("transferable #{0} is already detached")]
    Detached(usize),
    /// The same buffer appears more than once in the transfer list.
    #[error("transferable #{0} is listed more than once")]
    Duplicate(usize),
}

/// Marks a value whose buffers move to the receiver instead of being copied.
///
/// Wrap a call argument or a handler's return value in a descriptor to transfer ownership of the
/// listed buffers. Once the message has been sent, every sending-side handle to those buffers is
/// detached. The receiver only ever sees the payload: descriptors are unwrapped at the boundary.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferDescriptor {
    payload: Value,
    transferables: Vec<Buffer>,
}

impl TransferDescriptor {
    /// Transfers a single buffer as the whole payload.
    pub fn buffer(buffer: Buffer) -> Self {
        Self {
            payload: Value::Buffer(buffer.clone()),
            transferables: vec![buffer],
        }
    }

    /// Transfers a value that must itself be a buffer.
    pub fn from_value(value: Value) -> Result<Self, TransferError> {
        match value {
            Value::Buffer(buffer) => Ok(Self::buffer(buffer)),
            other => Err(TransferError::NotTransferable(other.kind())),
        }
    }

    /// Transfers the given buffers along with a payload that usually references them.
    ///
    /// Fails if any of the buffers is already detached or listed twice.
    pub fn new(payload: impl Into<Value>, transferables: Vec<Buffer>) -> Result<Self, TransferError> {
        validate_transferables(&transferables)?;
        Ok(Self {
            payload: payload.into(),
            transferables,
        })
    }

    /// Returns the wrapped payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns the buffers marked for transfer.
    pub fn transferables(&self) -> &[Buffer] {
        &self.transferables
    }

    /// Splits the descriptor into its payload and transfer list.
    pub fn into_parts(self) -> (Value, Vec<Buffer>) {
        (self.payload, self.transferables)
    }
}

/// An argument or result as passed by user code: either a plain value or a transfer descriptor.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// A value that is copied across the boundary.
    Value(Value),
    /// A value with buffers that move across the boundary.
    Transfer(TransferDescriptor),
}

impl Payload {
    /// Strips the descriptor, returning the plain payload and the buffers to transfer.
    pub fn into_parts(self) -> (Value, Vec<Buffer>) {
        match self {
            Self::Value(value) => (value, Vec::new()),
            Self::Transfer(descriptor) => descriptor.into_parts(),
        }
    }
}

impl From<TransferDescriptor> for Payload {
    fn from(descriptor: TransferDescriptor) -> Self {
        Self::Transfer(descriptor)
    }
}

impl<T> From<T> for Payload
where
    T: Into<Value>,
{
    fn from(value: T) -> Self {
        Self::Value(value.into())
    }
}

/// Unwraps all descriptors in an argument list.
///
/// Positions are preserved. The returned transfer list contains the buffers of all descriptors in
/// argument order.
pub fn split_payloads(payloads: Vec<Payload>) -> (Vec<Value>, Vec<Buffer>) {
    let mut values = Vec::with_capacity(payloads.len());
    let mut transferables = Vec::new();

    for payload in payloads {
        let (value, buffers) = payload.into_parts();
        values.push(value);
        transferables.extend(buffers);
    }

    (values, transferables)
}

/// Types that contain [`Buffer`]s which need to be visited before crossing a boundary.
pub trait VisitBuffers {
    /// Calls `f` for every buffer contained in `self`.
    fn visit_buffers(&mut self, f: &mut dyn FnMut(&mut Buffer));
}

impl VisitBuffers for Value {
    fn visit_buffers(&mut self, f: &mut dyn FnMut(&mut Buffer)) {
        Value::visit_buffers(self, f)
    }
}

/// Checks that a transfer list can be moved: no buffer is detached or listed twice.
pub fn validate_transferables(transferables: &[Buffer]) -> Result<(), TransferError> {
    for (index, buffer) in transferables.iter().enumerate() {
        if buffer.is_detached() {
            return Err(TransferError::Detached(index));
        }

        if transferables[..index].iter().any(|b| b.same_buffer(buffer)) {
            return Err(TransferError::Duplicate(index));
        }
    }

    Ok(())
}

/// Prepares a message for crossing an in-memory boundary.
///
/// Every buffer in `transferables` is moved into a fresh region owned by the returned message, and
/// all handles on the sending side are detached. Every other buffer in the message is deep-copied.
/// After this call, the returned message shares no memory with the sender.
///
/// Validation happens before anything is detached, so on error the sender's buffers are intact.
pub fn structured_clone<M>(mut message: M, transferables: Vec<Buffer>) -> Result<M, TransferError>
where
    M: VisitBuffers,
{
    validate_transferables(&transferables)?;

    let moved: Vec<Buffer> = transferables
        .iter()
        .map(|buffer| Buffer::new(buffer.detach().unwrap_or_default()))
        .collect();

    message.visit_buffers(&mut |buffer| {
        let position = transferables.iter().position(|t| t.same_buffer(buffer));
        *buffer = match position {
            // All occurrences of a transferred buffer map to the same new region.
            Some(index) => moved[index].clone(),
            None => buffer.deep_copy(),
        };
    });

    Ok(message)
}
