//! Per-call bump allocator
//!
//! Call stacks draw all per-call memory from an arena: a chain of byte
//! blocks bump-allocated front to back. Individual allocations are never
//! freed; the whole arena is released when the call stack is destroyed.
//! Values that need their destructor run (per-filter call state, the call
//! promise) are dropped in place by their owner before the arena goes.

use crate::error::{CoreResult, Status};
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// Alignment every block satisfies without padding
const BLOCK_ALIGN: usize = 16;

/// Ceiling on the doubling growth schedule
const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

struct Block {
    ptr: NonNull<u8>,
    size: usize,
    used: usize,
}

impl Block {
    fn try_allocate(size: usize) -> Option<Block> {
        let layout = Layout::from_size_align(size, BLOCK_ALIGN).ok()?;
        // Safety: layout has nonzero size
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr).map(|ptr| Block {
            ptr,
            size,
            used: 0,
        })
    }

    fn bump(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let base = self.ptr.as_ptr() as usize;
        let aligned = (base + self.used + layout.align() - 1) & !(layout.align() - 1);
        let end = aligned + layout.size();
        if end > base + self.size {
            return None;
        }
        self.used = end - base;
        NonNull::new(aligned as *mut u8)
    }
}

struct ArenaInner {
    blocks: Vec<Block>,
    next_block_size: usize,
    total_bytes: usize,
}

/// A growable bump allocator
pub struct Arena {
    inner: Mutex<ArenaInner>,
}

// Safety: block pointers are only touched under the inner mutex; handed-out
// allocations carry their own synchronization obligations
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create an arena whose first block holds `initial_size` bytes
    pub fn with_initial_size(initial_size: usize) -> Arena {
        let initial_size = initial_size.max(64);
        let first = Block::try_allocate(initial_size)
            .unwrap_or_else(|| handle_alloc_error(Layout::from_size_align(initial_size, BLOCK_ALIGN).unwrap()));
        Arena {
            inner: Mutex::new(ArenaInner {
                blocks: vec![first],
                next_block_size: initial_size.saturating_mul(2).min(MAX_BLOCK_SIZE),
                total_bytes: initial_size,
            }),
        }
    }

    /// Allocate raw memory for `layout`, growing the arena if needed
    pub fn try_alloc_layout(&self, layout: Layout) -> CoreResult<NonNull<u8>> {
        if layout.size() == 0 {
            // align is a nonzero power of two, so this pointer is never null
            return Ok(NonNull::new(layout.align() as *mut u8).unwrap());
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.blocks.last_mut().and_then(|b| b.bump(layout)) {
            return Ok(p);
        }
        let want = layout.size() + layout.align();
        let size = inner.next_block_size.max(want);
        let block = Block::try_allocate(size)
            .ok_or_else(|| Status::resource_exhausted("arena block allocation failed"))?;
        inner.next_block_size = inner.next_block_size.saturating_mul(2).min(MAX_BLOCK_SIZE);
        inner.total_bytes += size;
        inner.blocks.push(block);
        let p = inner
            .blocks
            .last_mut()
            .and_then(|b| b.bump(layout))
            .expect("fresh arena block cannot satisfy layout");
        Ok(p)
    }

    /// Infallible variant of [`try_alloc_layout`](Arena::try_alloc_layout)
    pub fn alloc_layout(&self, layout: Layout) -> NonNull<u8> {
        self.try_alloc_layout(layout)
            .unwrap_or_else(|_| handle_alloc_error(layout))
    }

    /// Allocate zero-initialized memory for `layout`
    pub fn alloc_zeroed(&self, layout: Layout) -> NonNull<u8> {
        let p = self.alloc_layout(layout);
        if layout.size() > 0 {
            // Safety: p is valid for layout.size() bytes
            unsafe { std::ptr::write_bytes(p.as_ptr(), 0, layout.size()) };
        }
        p
    }

    /// Move `value` into the arena and return its address
    ///
    /// The arena will not run `T`'s destructor; callers that need it must
    /// `drop_in_place` before the arena is released (see [`ArenaBox`]).
    pub fn alloc<T>(&self, value: T) -> NonNull<T> {
        let p = self.alloc_layout(Layout::new::<T>()).cast::<T>();
        // Safety: p is freshly allocated, aligned, and sized for T
        unsafe { p.as_ptr().write(value) };
        p
    }

    /// Total bytes backing the arena (allocated from the system)
    pub fn bytes_allocated(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for block in inner.blocks.drain(..) {
            let layout = Layout::from_size_align(block.size, BLOCK_ALIGN).unwrap();
            // Safety: allocated in Block::try_allocate with this layout
            unsafe { dealloc(block.ptr.as_ptr(), layout) };
        }
    }
}

/// An owning pointer to an arena-allocated value
///
/// Runs the value's destructor on drop and keeps the backing arena alive,
/// but never frees the memory itself. Supports unsizing to trait objects
/// through [`erase`](ArenaBox::erase).
pub struct ArenaBox<T: ?Sized> {
    ptr: NonNull<T>,
    _arena: Arc<Arena>,
}

// Safety: the box has unique ownership of the value; the arena handle is
// Send + Sync
unsafe impl<T: ?Sized + Send> Send for ArenaBox<T> {}

impl<T> ArenaBox<T> {
    pub fn new(arena: &Arc<Arena>, value: T) -> ArenaBox<T> {
        ArenaBox {
            ptr: arena.alloc(value),
            _arena: arena.clone(),
        }
    }

    /// Coerce to an unsized type, e.g. `b.erase(|p| p as &mut dyn Trait)`
    pub fn erase<U: ?Sized>(self, coerce: impl FnOnce(&mut T) -> &mut U) -> ArenaBox<U> {
        let this = ManuallyDrop::new(self);
        // Safety: ptr is valid and uniquely owned; the closure only changes
        // the pointer's type, not its address
        let ptr = unsafe { NonNull::from(coerce(&mut *this.ptr.as_ptr())) };
        // Safety: this is ManuallyDrop, the arena handle is read exactly once
        let arena = unsafe { std::ptr::read(&this._arena) };
        ArenaBox { ptr, _arena: arena }
    }
}

impl<T: ?Sized> Deref for ArenaBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: unique ownership for the life of the box
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ?Sized> DerefMut for ArenaBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: unique ownership for the life of the box
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: ?Sized> Drop for ArenaBox<T> {
    fn drop(&mut self) {
        // Safety: value was initialized and never dropped elsewhere; memory
        // stays valid because we hold the arena
        unsafe { std::ptr::drop_in_place(self.ptr.as_ptr()) };
    }
}
