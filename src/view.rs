//! Provides an immutable view on a cached value.
//!
//! Values in a cache are shared between the cache itself and all callers which read them. A
//! [ByteView] therefore never hands out mutable access to its contents. Reading the contents via
//! [ByteView::byte_slice] yields an independent copy, so that callers are free to modify what they
//! got without affecting the cached value.
use std::fmt::{Debug, Display, Formatter};

use bytes::Bytes;

use crate::lru::ByteSize;

/// Represents an immutable sequence of bytes as stored in a cache.
///
/// Cloning a view is cheap, as the underlying buffer is reference counted and never mutated.
///
/// # Examples
/// ```
/// # use jwcache::view::ByteView;
/// let view = ByteView::from("Hello");
/// assert_eq!(view.len(), 5);
///
/// // Modifying a copy doesn't affect the view itself...
/// let mut copy = view.byte_slice();
/// copy[0] = b'J';
/// assert_eq!(view.to_string(), "Hello");
/// assert_eq!(copy, b"Jello".to_vec());
/// ```
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteView {
    bytes: Bytes,
}

impl ByteView {
    /// Returns the number of bytes in this view.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Determines if this view is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns a copy of the underlying data.
    pub fn byte_slice(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    /// Provides read-only access to the underlying data without copying it.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns a shared handle to the underlying buffer.
    ///
    /// This doesn't copy any data, as **Bytes** itself is immutable.
    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(data: Vec<u8>) -> Self {
        ByteView { bytes: data.into() }
    }
}

impl From<Bytes> for ByteView {
    fn from(bytes: Bytes) -> Self {
        ByteView { bytes }
    }
}

impl From<&str> for ByteView {
    fn from(data: &str) -> Self {
        ByteView {
            bytes: Bytes::copy_from_slice(data.as_bytes()),
        }
    }
}

impl ByteSize for ByteView {
    fn allocated_size(&self) -> usize {
        self.len()
    }
}

impl Display for ByteView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

impl Debug for ByteView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteView({:?})", self.bytes)
    }
}
