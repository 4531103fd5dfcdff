//! Reusable frame memory shared by the camera callback and the consumer thread

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PipelineError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// How a camera backend hands frame memory to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// The camera fills application-owned buffers that must be given back
    /// after use. Buffers are allocated once, before streaming starts.
    BufferRecycling,
    /// The camera hands out its own image objects which must be closed.
    OpaqueImage,
}

/// An image owned by the camera stack. Closing returns it to its owner.
pub trait ExternalImage: Send {
    fn data(&self) -> &[u8];
    fn close(self: Box<Self>);
}

/// Memory backing one frame.
pub enum BufferHandle {
    Pooled(PooledBuffer),
    External(ExternalBuffer),
}

/// A pre-allocated buffer checked out of a [`FrameBufferPool`].
pub struct PooledBuffer {
    pool_id: u64,
    index: usize,
    data: Vec<u8>,
    len: usize,
}

/// Wrapper around an [`ExternalImage`] that keeps the owning pool's
/// open-image count accurate.
pub struct ExternalBuffer {
    pool_id: u64,
    image: Box<dyn ExternalImage>,
}

struct PoolInner {
    id: u64,
    kind: BackendKind,
    buffer_len: usize,
    free: ArrayQueue<PooledBuffer>,
    checked_out: Box<[AtomicBool]>,
    open_images: AtomicUsize,
}

/// Fixed set of frame buffers, or a tracker for external images.
///
/// Cloning is cheap; clones share the same buffers. `release` may be called
/// from any thread.
#[derive(Clone)]
pub struct FrameBufferPool {
    inner: Arc<PoolInner>,
}

impl FrameBufferPool {
    /// Pre-allocates `count` buffers of `buffer_len` bytes.
    pub fn recycling(count: usize, buffer_len: usize) -> Self {
        let count = count.max(1);
        let free = ArrayQueue::new(count);
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);

        for index in 0..count {
            let buffer = PooledBuffer {
                pool_id: id,
                index,
                data: vec![0; buffer_len],
                len: 0,
            };
            // Capacity equals count, the push cannot fail.
            let _ = free.push(buffer);
        }

        debug!(pool = id, count, buffer_len, "Allocated frame buffer pool");

        Self {
            inner: Arc::new(PoolInner {
                id,
                kind: BackendKind::BufferRecycling,
                buffer_len,
                free,
                checked_out: (0..count).map(|_| AtomicBool::new(false)).collect(),
                open_images: AtomicUsize::new(0),
            }),
        }
    }

    /// A pool that owns no memory and only tracks camera-owned images.
    pub fn external() -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(PoolInner {
                id,
                kind: BackendKind::OpaqueImage,
                buffer_len: 0,
                free: ArrayQueue::new(1),
                checked_out: Box::new([]),
                open_images: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.kind
    }

    pub fn buffer_len(&self) -> usize {
        self.inner.buffer_len
    }

    pub fn capacity(&self) -> usize {
        self.inner.checked_out.len()
    }

    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    /// External images handed out by [`wrap`](Self::wrap) and not yet closed.
    pub fn open_images(&self) -> usize {
        self.inner.open_images.load(Ordering::Acquire)
    }

    pub fn is_checked_out(&self, index: usize) -> bool {
        self.inner
            .checked_out
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Takes a free buffer. `None` means every buffer is in flight, which the
    /// producer treats as backpressure and skips the sensor frame.
    pub fn acquire(&self) -> Option<PooledBuffer> {
        let mut buffer = self.inner.free.pop()?;
        let was_out = self.inner.checked_out[buffer.index].swap(true, Ordering::AcqRel);
        debug_assert!(!was_out, "buffer {} was free and checked out", buffer.index);
        buffer.len = 0;
        Some(buffer)
    }

    /// Wraps a camera-owned image so it can travel through the pipeline.
    pub fn wrap(&self, image: Box<dyn ExternalImage>) -> BufferHandle {
        self.inner.open_images.fetch_add(1, Ordering::AcqRel);
        BufferHandle::External(ExternalBuffer {
            pool_id: self.inner.id,
            image,
        })
    }

    pub fn owns(&self, handle: &BufferHandle) -> bool {
        handle.pool_id() == self.inner.id
    }

    /// Returns a pooled buffer to the free set or closes an external image.
    ///
    /// Handles are moved in, so a buffer cannot be released twice. A handle
    /// from another pool is closed (external) or dropped (pooled) and
    /// reported as [`PipelineError::UnknownBuffer`].
    ///
    /// Only the owning pool can clear its bookkeeping, so a foreign handle
    /// dropped here stays counted by its owner: a pooled buffer stays
    /// checked out and an image stays open there for good. Each mismatch
    /// permanently costs the owner one buffer.
    pub fn release(&self, handle: BufferHandle) -> Result<(), PipelineError> {
        if !self.owns(&handle) {
            let err = PipelineError::UnknownBuffer {
                pool: self.inner.id,
                owner: handle.pool_id(),
            };
            warn!(%err, "Releasing buffer into the wrong pool");
            if let BufferHandle::External(external) = handle {
                external.image.close();
            }
            return Err(err);
        }

        match handle {
            BufferHandle::Pooled(buffer) => {
                let was_out = self.inner.checked_out[buffer.index].swap(false, Ordering::AcqRel);
                debug_assert!(was_out, "buffer {} released while free", buffer.index);
                // One slot per buffer, so the queue always has room.
                let _ = self.inner.free.push(buffer);
            }
            BufferHandle::External(external) => {
                external.image.close();
                self.inner.open_images.fetch_sub(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FrameBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBufferPool")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("open_images", &self.open_images())
            .finish()
    }
}

impl PooledBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whole buffer for the producer to fill. Call [`set_len`](Self::set_len)
    /// afterwards.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Copies `bytes` in, truncating to capacity. Returns the copied length.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let len = bytes.len().min(self.data.len());
        self.data[..len].copy_from_slice(&bytes[..len]);
        self.len = len;
        len
    }
}

impl BufferHandle {
    pub fn pool_id(&self) -> u64 {
        match self {
            BufferHandle::Pooled(buffer) => buffer.pool_id,
            BufferHandle::External(external) => external.pool_id,
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            BufferHandle::Pooled(buffer) => &buffer.data[..buffer.len],
            BufferHandle::External(external) => external.image.data(),
        }
    }

    pub fn pooled_index(&self) -> Option<usize> {
        match self {
            BufferHandle::Pooled(buffer) => Some(buffer.index),
            BufferHandle::External(_) => None,
        }
    }
}

impl From<PooledBuffer> for BufferHandle {
    fn from(buffer: PooledBuffer) -> Self {
        BufferHandle::Pooled(buffer)
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferHandle::Pooled(buffer) => f
                .debug_struct("Pooled")
                .field("pool", &buffer.pool_id)
                .field("index", &buffer.index)
                .field("len", &buffer.len)
                .finish(),
            BufferHandle::External(external) => f
                .debug_struct("External")
                .field("pool", &external.pool_id)
                .field("len", &external.image.data().len())
                .finish(),
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("pool", &self.pool_id)
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}
