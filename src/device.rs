//! Accelerator memory arena: the device side of a host-mirrored store.
//!
//! Buffers live in the arena, are addressed by `BufferId`, and are released
//! only through `free`. Every allocation is paired with exactly one free; a
//! second free of the same id fails with `UnknownBuffer` instead of silently
//! succeeding, so ownership bugs in the mirror protocol surface in tests.
//!
//! Kernels `take` the buffers they operate on and `restore` them afterwards.
//! While taken, a buffer is bound: it can't be freed, uploaded, or
//! downloaded.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Opaque handle to one device buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Device memory failures. Treated as fatal by the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Allocation would exceed the arena's capacity
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// Id was never allocated or has already been freed
    #[error("unknown device buffer {0}")]
    UnknownBuffer(BufferId),

    /// Buffer holds a different element type
    #[error("device buffer {id} does not hold {expected} elements")]
    TypeMismatch { id: BufferId, expected: &'static str },

    /// Host slice and device buffer lengths differ
    #[error("device buffer {id} holds {expected} elements, host side has {got}")]
    LengthMismatch { id: BufferId, expected: usize, got: usize },

    /// Buffer is currently taken by a kernel
    #[error("device buffer {0} is bound to a running kernel")]
    Bound(BufferId),
}

/// Typed device storage.
#[derive(Clone, Debug)]
pub enum DeviceBuffer {
    U8(Vec<u8>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
}

impl DeviceBuffer {
    fn byte_len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::U32(v) => v.len() * 4,
            Self::U64(v) => v.len() * 8,
            Self::F32(v) => v.len() * 4,
        }
    }
}

/// Element types the arena can hold.
pub trait DeviceScalar: Copy + Default + Send + Sync + 'static {
    const NAME: &'static str;
    fn wrap(data: Vec<Self>) -> DeviceBuffer;
    fn view(buf: &DeviceBuffer) -> Option<&Vec<Self>>;
    fn view_mut(buf: &mut DeviceBuffer) -> Option<&mut Vec<Self>>;
    fn unwrap(buf: DeviceBuffer) -> Result<Vec<Self>, DeviceBuffer>;
}

macro_rules! device_scalar {
    ($ty:ty, $variant:ident) => {
        impl DeviceScalar for $ty {
            const NAME: &'static str = stringify!($ty);

            fn wrap(data: Vec<Self>) -> DeviceBuffer {
                DeviceBuffer::$variant(data)
            }

            fn view(buf: &DeviceBuffer) -> Option<&Vec<Self>> {
                match buf {
                    DeviceBuffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn view_mut(buf: &mut DeviceBuffer) -> Option<&mut Vec<Self>> {
                match buf {
                    DeviceBuffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn unwrap(buf: DeviceBuffer) -> Result<Vec<Self>, DeviceBuffer> {
                match buf {
                    DeviceBuffer::$variant(v) => Ok(v),
                    other => Err(other),
                }
            }
        }
    };
}

device_scalar!(u8, U8);
device_scalar!(u32, U32);
device_scalar!(u64, U64);
device_scalar!(f32, F32);

/// Device memory pool with allocation accounting.
pub struct DeviceArena {
    buffers: HashMap<BufferId, DeviceBuffer>,
    /// Element type and length of each taken buffer.
    bound: HashMap<BufferId, (&'static str, usize)>,
    next_id: u64,
    capacity_bytes: usize,
    used_bytes: usize,
}

impl Default for DeviceArena {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceArena {
    /// Arena without a capacity limit.
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Arena that refuses allocations beyond `capacity_bytes`.
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            bound: HashMap::new(),
            next_id: 1,
            capacity_bytes,
            used_bytes: 0,
        }
    }

    /// Number of buffers currently allocated (bound ones included).
    #[inline]
    pub fn live_buffers(&self) -> usize {
        self.buffers.len() + self.bound.len()
    }

    /// Bytes currently allocated.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Whether `id` names a live buffer.
    pub fn contains(&self, id: BufferId) -> bool {
        self.buffers.contains_key(&id) || self.bound.contains_key(&id)
    }

    /// Allocate a zero-filled buffer of `len` elements.
    pub fn alloc<T: DeviceScalar>(&mut self, len: usize) -> Result<BufferId, DeviceError> {
        let requested = len.saturating_mul(std::mem::size_of::<T>());
        let available = self.capacity_bytes - self.used_bytes;
        if requested > available {
            return Err(DeviceError::OutOfMemory { requested, available });
        }
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.buffers.insert(id, T::wrap(vec![T::default(); len]));
        self.used_bytes += requested;
        Ok(id)
    }

    /// Release a buffer. Fails if the id is unknown or bound.
    pub fn free(&mut self, id: BufferId) -> Result<(), DeviceError> {
        if self.bound.contains_key(&id) {
            return Err(DeviceError::Bound(id));
        }
        let buf = self.buffers.remove(&id).ok_or(DeviceError::UnknownBuffer(id))?;
        self.used_bytes -= buf.byte_len();
        Ok(())
    }

    /// Element count of a buffer.
    pub fn len_of(&self, id: BufferId) -> Result<usize, DeviceError> {
        let buf = self.resident(id)?;
        Ok(match buf {
            DeviceBuffer::U8(v) => v.len(),
            DeviceBuffer::U32(v) => v.len(),
            DeviceBuffer::U64(v) => v.len(),
            DeviceBuffer::F32(v) => v.len(),
        })
    }

    /// Host → device copy. Lengths must match exactly.
    pub fn upload<T: DeviceScalar>(&mut self, id: BufferId, src: &[T]) -> Result<(), DeviceError> {
        let dst = self.typed_mut::<T>(id)?;
        if dst.len() != src.len() {
            return Err(DeviceError::LengthMismatch { id, expected: dst.len(), got: src.len() });
        }
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Device → host copy. Lengths must match exactly.
    pub fn download<T: DeviceScalar>(&self, id: BufferId, dst: &mut [T]) -> Result<(), DeviceError> {
        let src = self.view::<T>(id)?;
        if src.len() != dst.len() {
            return Err(DeviceError::LengthMismatch { id, expected: src.len(), got: dst.len() });
        }
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Read-only view of a resident buffer.
    pub fn view<T: DeviceScalar>(&self, id: BufferId) -> Result<&[T], DeviceError> {
        let buf = self.resident(id)?;
        T::view(buf)
            .map(|v| v.as_slice())
            .ok_or(DeviceError::TypeMismatch { id, expected: T::NAME })
    }

    /// Mutable view of a resident buffer.
    pub fn view_mut<T: DeviceScalar>(&mut self, id: BufferId) -> Result<&mut [T], DeviceError> {
        self.typed_mut::<T>(id).map(|v| v.as_mut_slice())
    }

    /// Bind a buffer to a kernel, moving its storage out of the arena.
    pub fn take<T: DeviceScalar>(&mut self, id: BufferId) -> Result<Vec<T>, DeviceError> {
        let buf = self.buffers.remove(&id).ok_or_else(|| self.missing(id))?;
        match T::unwrap(buf) {
            Ok(data) => {
                self.bound.insert(id, (T::NAME, data.len()));
                Ok(data)
            }
            Err(buf) => {
                self.buffers.insert(id, buf);
                Err(DeviceError::TypeMismatch { id, expected: T::NAME })
            }
        }
    }

    /// Unbind a buffer previously obtained with `take`. The data must have
    /// the element type and length it was taken with; otherwise the buffer
    /// stays bound.
    pub fn restore<T: DeviceScalar>(&mut self, id: BufferId, data: Vec<T>) -> Result<(), DeviceError> {
        let &(name, len) = self.bound.get(&id).ok_or(DeviceError::UnknownBuffer(id))?;
        if name != T::NAME {
            return Err(DeviceError::TypeMismatch { id, expected: name });
        }
        if data.len() != len {
            return Err(DeviceError::LengthMismatch { id, expected: len, got: data.len() });
        }
        self.bound.remove(&id);
        self.buffers.insert(id, T::wrap(data));
        Ok(())
    }

    fn resident(&self, id: BufferId) -> Result<&DeviceBuffer, DeviceError> {
        self.buffers.get(&id).ok_or_else(|| self.missing(id))
    }

    fn typed_mut<T: DeviceScalar>(&mut self, id: BufferId) -> Result<&mut Vec<T>, DeviceError> {
        if self.bound.contains_key(&id) {
            return Err(DeviceError::Bound(id));
        }
        let buf = self.buffers.get_mut(&id).ok_or(DeviceError::UnknownBuffer(id))?;
        T::view_mut(buf).ok_or(DeviceError::TypeMismatch { id, expected: T::NAME })
    }

    fn missing(&self, id: BufferId) -> DeviceError {
        if self.bound.contains_key(&id) {
            DeviceError::Bound(id)
        } else {
            DeviceError::UnknownBuffer(id)
        }
    }
}

/// A run of allocations that is released as a whole if any step fails.
pub(crate) struct AllocBatch<'a> {
    arena: &'a mut DeviceArena,
    ids: Vec<BufferId>,
}

impl<'a> AllocBatch<'a> {
    pub(crate) fn new(arena: &'a mut DeviceArena) -> Self {
        Self { arena, ids: Vec::new() }
    }

    pub(crate) fn alloc<T: DeviceScalar>(&mut self, len: usize) -> Result<BufferId, DeviceError> {
        let id = self.arena.alloc::<T>(len)?;
        self.ids.push(id);
        Ok(id)
    }

    #[inline]
    pub(crate) fn arena(&self) -> &DeviceArena {
        &*self.arena
    }

    /// Free everything allocated through this batch.
    pub(crate) fn rollback(self) {
        for id in self.ids {
            // Freshly allocated and never bound, so free cannot fail.
            let _ = self.arena.free(id);
        }
    }
}
