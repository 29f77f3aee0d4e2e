//! Reference-counted buffer pool feeding the stream layer.
//!
//! Grounded on `original_source/Libraries/AsyncStreams/AsyncStreams.h`
//! (`AsyncBufferView` / `AsyncBuffersPool`) and on the teacher's own
//! `sys::windows::buffer_pool::BufferPool`, a simple free-list of `Vec<u8>`
//! reused across overlapped reads. This pool generalizes that idea with
//! reference-counted views so a single underlying allocation can be shared
//! (read once, written to several stream destinations) instead of copied.

use std::sync::{Arc, Mutex};

use crate::error::CrateError;

struct Slot {
    data: Vec<u8>,
    in_use: bool,
}

struct Inner {
    slots: Vec<Slot>,
    default_capacity: usize,
    max_slots: usize,
}

/// Owns a set of reusable byte buffers, checked out as [`BufferView`]s.
///
/// Mirrors the original's pool: readers acquire a buffer, streams pass it
/// downstream by cloning the view (bumping a refcount, not copying bytes),
/// and the backing slot returns to the free list once every view referring
/// to it has been dropped.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<Inner>>,
}

impl BufferPool {
    /// Creates a pool that grows up to `max_slots` buffers of
    /// `default_capacity` bytes each.
    pub fn new(default_capacity: usize, max_slots: usize) -> BufferPool {
        BufferPool {
            inner: Arc::new(Mutex::new(Inner {
                slots: Vec::new(),
                default_capacity,
                max_slots,
            })),
        }
    }

    /// Checks out a free buffer, growing the pool if under `max_slots` and
    /// none are free.
    pub fn acquire(&self) -> Result<BufferView, CrateError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((idx, slot)) = inner
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| !slot.in_use)
        {
            slot.in_use = true;
            slot.data.clear();
            return Ok(BufferView::whole(self.clone(), idx));
        }

        if inner.slots.len() >= inner.max_slots {
            return Err(CrateError::Capacity("buffer pool has no free slots"));
        }

        let capacity = inner.default_capacity;
        inner.slots.push(Slot {
            data: Vec::with_capacity(capacity),
            in_use: true,
        });
        let idx = inner.slots.len() - 1;
        Ok(BufferView::whole(self.clone(), idx))
    }

    fn release(&self, idx: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.slots.get_mut(idx) {
            slot.in_use = false;
        }
    }

    fn with_slot<R>(&self, idx: usize, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.slots[idx].data)
    }

    fn slot_len(&self, idx: usize) -> usize {
        self.inner.lock().unwrap().slots[idx].data.len()
    }

    /// Whether `self` and `other` refer to the same underlying pool, used
    /// by [`crate::stream::Pipeline`] to enforce that every stream it wires
    /// together shares one `BufferPool`.
    pub fn is_same_pool(&self, other: &BufferPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A reference-counted handle onto a pooled buffer, or a byte-range child of
/// one.
///
/// Cloning a `BufferView` is cheap: it bumps an `Arc` refcount rather than
/// copying the underlying bytes. A request completion hands out the whole
/// buffer it wrote into; a stream `Transform` can slice a child view over
/// just the bytes it produced without another allocation.
#[derive(Clone)]
pub struct BufferView {
    pool: BufferPool,
    slot: Arc<SlotHandle>,
    offset: usize,
    length: Option<usize>,
}

struct SlotHandle {
    pool: BufferPool,
    idx: usize,
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.pool.release(self.idx);
    }
}

impl BufferView {
    fn whole(pool: BufferPool, idx: usize) -> BufferView {
        let handle = Arc::new(SlotHandle {
            pool: pool.clone(),
            idx,
        });
        BufferView {
            pool,
            slot: handle,
            offset: 0,
            length: None,
        }
    }

    /// Length of this view in bytes (the slice it currently covers, not the
    /// slot's full capacity).
    pub fn len(&self) -> usize {
        match self.length {
            Some(length) => length,
            None => self.pool.slot_len(self.slot.idx).saturating_sub(self.offset),
        }
    }

    /// Whether this view covers zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` against the view's bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.pool.with_slot(self.slot.idx, |data| {
            let end = self.length.map_or(data.len(), |len| self.offset + len);
            f(&data[self.offset..end.min(data.len())])
        })
    }

    /// Runs `f` against the view's mutable backing storage. Only valid on a
    /// whole-buffer view fresh from [`BufferPool::acquire`]; used by request
    /// completions to write received bytes in place.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        self.pool.with_slot(self.slot.idx, f)
    }

    /// Returns a child view over `offset..offset + length` of this buffer,
    /// sharing the same backing slot (and keeping it alive) without copying.
    pub fn child(&self, offset: usize, length: usize) -> BufferView {
        BufferView {
            pool: self.pool.clone(),
            slot: Arc::clone(&self.slot),
            offset: self.offset + offset,
            length: Some(length),
        }
    }
}

impl std::fmt::Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_recycles_slots() {
        let pool = BufferPool::new(64, 1);
        let view = pool.acquire().unwrap();
        drop(view);
        // The single slot was freed, so a second acquire succeeds instead of
        // hitting the capacity error.
        let _view = pool.acquire().unwrap();
    }

    #[test]
    fn capacity_error_when_exhausted() {
        let pool = BufferPool::new(64, 1);
        let _first = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, CrateError::Capacity(_)));
    }

    #[test]
    fn child_view_shares_backing_slot() {
        let pool = BufferPool::new(64, 1);
        let view = pool.acquire().unwrap();
        view.with_bytes_mut(|buf| buf.extend_from_slice(b"hello world"));
        let child = view.child(6, 5);
        drop(view);
        child.with_bytes(|bytes| assert_eq!(bytes, b"world"));
    }
}
