use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Opaque handle to a single image buffer, compared by identity.
///
/// Two handles are equal only when they refer to the same underlying
/// allocation; cloning a handle never creates a new identity. Buffer
/// contents never participate in comparison or hashing.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::BufferHandle;
///
/// let a = BufferHandle::new(0, 1024);
/// let b = a.clone();
/// let c = BufferHandle::new(0, 1024);
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
#[derive(Clone)]
pub struct BufferHandle(Arc<HandleInner>);

struct HandleInner {
    slot: usize,
    capacity: usize,
}

impl BufferHandle {
    /// Create a fresh handle for an allocation of `capacity` bytes.
    ///
    /// `slot` is a cosmetic label (typically the allocation index within its
    /// pool) used only for logging; it does not affect identity.
    pub fn new(slot: usize, capacity: usize) -> Self {
        Self(Arc::new(HandleInner { slot, capacity }))
    }

    /// Allocation index within the originating pool.
    pub fn slot(&self) -> usize {
        self.0.slot
    }

    /// Size of the underlying allocation in bytes.
    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    /// Stable address of the underlying allocation, usable as a map key
    /// where the handle itself cannot be stored.
    pub fn raw_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for BufferHandle {}

impl Hash for BufferHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("slot", &self.0.slot)
            .field("capacity", &self.0.capacity)
            .field("id", &format_args!("{:#x}", self.raw_id()))
            .finish()
    }
}

/// Fill status attached to a buffer as it moves through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Buffer contains valid frame data.
    Ok,
    /// Buffer contents are invalid and must not be displayed or encoded.
    Error,
}

impl BufferStatus {
    /// Whether this status marks the contents as unusable.
    pub fn is_error(self) -> bool {
        matches!(self, BufferStatus::Error)
    }
}

/// A buffer handle paired with its current status, as exchanged between a
/// stream and the driver boundary.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{BufferHandle, BufferStatus, StreamBuffer};
///
/// let buffer = StreamBuffer::ok(BufferHandle::new(0, 64));
/// assert!(!buffer.status.is_error());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBuffer {
    /// Handle to the underlying allocation.
    pub handle: BufferHandle,
    /// Fill status reported by whoever held the buffer last.
    pub status: BufferStatus,
}

impl StreamBuffer {
    /// Wrap a handle with `Ok` status.
    pub fn ok(handle: BufferHandle) -> Self {
        Self {
            handle,
            status: BufferStatus::Ok,
        }
    }

    /// Wrap a handle with `Error` status.
    pub fn error(handle: BufferHandle) -> Self {
        Self {
            handle,
            status: BufferStatus::Error,
        }
    }

    /// Copy of this buffer with the status downgraded to `Error`.
    pub fn into_error(mut self) -> Self {
        self.status = BufferStatus::Error;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn handle_identity_survives_clone() {
        let a = BufferHandle::new(3, 128);
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.raw_id(), b.raw_id());
    }

    #[test]
    fn distinct_allocations_never_compare_equal() {
        let a = BufferHandle::new(0, 128);
        let b = BufferHandle::new(0, 128);
        assert_ne!(a, b);
    }

    #[test]
    fn handle_usable_as_map_key() {
        let a = BufferHandle::new(0, 16);
        let b = BufferHandle::new(1, 16);
        let mut map = HashMap::new();
        map.insert(a.clone(), 10u32);
        map.insert(b, 20u32);
        assert_eq!(map.get(&a), Some(&10));
    }

    #[test]
    fn status_downgrade() {
        let buffer = StreamBuffer::ok(BufferHandle::new(0, 16)).into_error();
        assert!(buffer.status.is_error());
    }
}
