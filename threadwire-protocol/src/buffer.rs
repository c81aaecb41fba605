use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A movable byte buffer.
///
/// A buffer is a handle to an owned region of bytes. Cloning the handle does not copy the bytes,
/// all clones observe the same region. When a buffer is transferred to a worker, the region moves
/// to the receiver and all handles on the sending side become *detached*: they report a length
/// of zero and can no longer be read or written.
///
/// Comparing two buffers compares their contents.
#[derive(Clone)]
pub struct Buffer(Arc<Mutex<Option<Vec<u8>>>>);

impl Buffer {
    /// Creates a buffer that owns the given bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(Some(bytes))))
    }

    /// Creates a zero-filled buffer of the given length.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    /// Returns the number of bytes in this buffer, or `0` if it has been detached.
    pub fn len(&self) -> usize {
        self.0.lock().as_ref().map_or(0, Vec::len)
    }

    /// Returns `true` if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the contents of this buffer have been moved elsewhere.
    pub fn is_detached(&self) -> bool {
        self.0.lock().is_none()
    }

    /// Returns `true` if both handles refer to the same region.
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Copies the contents into a new vector.
    ///
    /// Returns an empty vector if the buffer is detached.
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_bytes(<[u8]>::to_vec)
    }

    /// Provides read access to the contents.
    ///
    /// A detached buffer is presented as an empty slice.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self.0.lock().as_deref() {
            Some(bytes) => f(bytes),
            None => f(&[]),
        }
    }

    /// Provides write access to the contents.
    ///
    /// A detached buffer is presented as an empty slice.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match self.0.lock().as_deref_mut() {
            Some(bytes) => f(bytes),
            None => f(&mut []),
        }
    }

    /// Creates an independent buffer with a copy of the current contents.
    pub fn deep_copy(&self) -> Self {
        Self::new(self.to_vec())
    }

    /// Moves the contents out of this buffer, detaching every handle that shares it.
    ///
    /// Returns `None` if the buffer was already detached.
    pub fn detach(&self) -> Option<Vec<u8>> {
        self.0.lock().take()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.lock().as_ref() {
            Some(bytes) => f.debug_struct("Buffer").field("len", &bytes.len()).finish(),
            None => f.write_str("Buffer(detached)"),
        }
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        if self.same_buffer(other) {
            return true;
        }

        self.with_bytes(|left| other.with_bytes(|right| left == right))
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl Serialize for Buffer {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.with_bytes(|bytes| serializer.serialize_bytes(bytes))
    }
}

impl<'de> Deserialize<'de> for Buffer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Ok(Self::new(bytes.into_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_contents() {
        let buffer = Buffer::zeroed(4);
        let clone = buffer.clone();

        clone.with_bytes_mut(|bytes| bytes[0] = 42);

        assert_eq!(buffer.to_vec(), vec![42, 0, 0, 0]);
        assert!(buffer.same_buffer(&clone));
    }

    #[test]
    fn test_detach_invalidates_all_handles() {
        let buffer = Buffer::from(vec![1, 2, 3]);
        let clone = buffer.clone();

        assert_eq!(clone.detach(), Some(vec![1, 2, 3]));

        assert!(buffer.is_detached());
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.to_vec(), Vec::<u8>::new());
        assert_eq!(buffer.detach(), None);
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let buffer = Buffer::from(vec![1, 2, 3]);
        let copy = buffer.deep_copy();

        buffer.detach();

        assert!(!copy.is_detached());
        assert_eq!(copy.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn test_debug() {
        let buffer = Buffer::zeroed(8);
        assert_eq!(format!("{buffer:?}"), "Buffer { len: 8 }");
        buffer.detach();
        assert_eq!(format!("{buffer:?}"), "Buffer(detached)");
    }
}
