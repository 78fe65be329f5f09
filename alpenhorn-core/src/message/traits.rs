//! Message traits.
//!
//! See the [message module] documentation since this is a private module anyways.
//!
//! [message module]: crate::message

use anyhow::anyhow;

use crate::{crypto::ByteObject, message::DecodeError};

/// An interface for serializable message types.
///
/// See also [`FromBytes`] for deserialization.
pub trait ToBytes {
    /// The length of the buffer for encoding the type.
    fn buffer_length(&self) -> usize;

    /// Serialize the type in the given buffer.
    ///
    /// # Panics
    /// This method may panic if the given buffer is too small. Thus,
    /// [`buffer_length()`] must be called prior to calling this, and a large
    /// enough buffer must be provided.
    ///
    /// [`buffer_length()`]: ToBytes::buffer_length
    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T);

    /// Serialize the type into a freshly allocated buffer.
    fn to_vec(&self) -> Vec<u8> {
        let mut buffer = vec![0_u8; self.buffer_length()];
        self.to_bytes(&mut buffer);
        buffer
    }
}

/// An interface for deserializable message types.
///
/// See also [`ToBytes`] for serialization.
pub trait FromBytes: Sized {
    /// Deserialize the type from the given buffer.
    ///
    /// # Errors
    /// May fail if certain parts of the deserialized buffer don't pass
    /// message validity checks.
    fn from_bytes<T: AsRef<[u8]>>(buffer: &T) -> Result<Self, DecodeError>;
}

impl<T> FromBytes for T
where
    T: ByteObject,
{
    fn from_bytes<U: AsRef<[u8]>>(buffer: &U) -> Result<Self, DecodeError> {
        Self::from_slice(buffer.as_ref())
            .ok_or_else(|| anyhow!("failed to deserialize byte object"))
    }
}

impl<T> ToBytes for T
where
    T: ByteObject,
{
    fn buffer_length(&self) -> usize {
        self.as_slice().len()
    }

    fn to_bytes<U: AsMut<[u8]>>(&self, buffer: &mut U) {
        buffer.as_mut().copy_from_slice(self.as_slice())
    }
}
