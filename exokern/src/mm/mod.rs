//! Memory Management.
//!
//! This module implements the physical memory of the machine. The core
//! abstraction is the [`Page`], which represents a single physical frame.
//!
//! Frame allocation and deallocation is tied to Rust's ownership and lifetime
//! system: a frame is allocated by creating an instance of the [`Page`]
//! struct. Cloning a [`Page`] increases the reference count of the frame, and
//! once the last [`Page`] instance referring to a frame is dropped, the frame
//! is returned to the [`FramePool`]. Page tables hold a [`Page`] per mapping,
//! so the reference count of a frame is exactly the number of mappings that
//! share it (plus any transient handles the kernel holds while serving a
//! request).
pub mod page_table;

use crate::addressing::{PAGE_SIZE, Pa};
use parking_lot::Mutex;
use std::sync::Arc;

/// A physical frame with its contents.
type Frame = Box<[u8; PAGE_SIZE]>;

// Allocation bitmap and reference counts of the frame pool.
struct Arena {
    // 0: used, 1: unused
    bitmap: Vec<u64>,
    ref_cnts: Vec<usize>,
    frames: Vec<Option<Frame>>,
    nframes: usize,
    free: usize,
}

impl Arena {
    fn new(nframes: usize) -> Self {
        let mut bitmap = vec![u64::MAX; nframes.div_ceil(64)];
        // Pad back.
        for i in nframes..bitmap.len() * 64 {
            let (pos, ofs) = (i / 64, i % 64);
            bitmap[pos] &= !(1 << ofs);
        }
        Arena {
            bitmap,
            ref_cnts: vec![0; nframes],
            frames: (0..nframes).map(|_| None).collect(),
            nframes,
            free: nframes,
        }
    }

    fn set_used(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_ne!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] &= !(1 << ofs);
    }

    fn set_unused(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_eq!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] |= 1 << ofs;
    }

    fn alloc(&mut self) -> Option<usize> {
        // search first qword that contains one.
        let pos = self.bitmap.iter().position(|word| *word != 0)?;
        let index = pos * 64 + self.bitmap[pos].trailing_zeros() as usize;
        self.set_used(index);
        self.free -= 1;
        debug_assert_eq!(self.ref_cnts[index], 0);
        self.ref_cnts[index] = 1;
        self.frames[index]
            .get_or_insert_with(|| Box::new([0; PAGE_SIZE]))
            .fill(0);
        Some(index)
    }

    fn dealloc(&mut self, index: usize) {
        self.set_unused(index);
        self.free += 1;
    }

    fn frame(&self, pa: Pa) -> &[u8; PAGE_SIZE] {
        match &self.frames[pa.pfn()] {
            Some(frame) => frame,
            None => unreachable!("{:?} is not allocated.", pa),
        }
    }

    fn frame_mut(&mut self, pa: Pa) -> &mut [u8; PAGE_SIZE] {
        match &mut self.frames[pa.pfn()] {
            Some(frame) => frame,
            None => unreachable!("{:?} is not allocated.", pa),
        }
    }
}

/// The physical memory of the machine.
///
/// A fixed number of 4 KiB frames, each with a reference count. The pool is
/// shared by every [`Page`] it hands out.
pub struct FramePool {
    inner: Mutex<Arena>,
}

impl FramePool {
    /// Create a pool of `nframes` free frames.
    pub fn new(nframes: usize) -> Arc<Self> {
        Arc::new(FramePool {
            inner: Mutex::new(Arena::new(nframes)),
        })
    }

    /// Total number of frames in the pool.
    pub fn capacity(&self) -> usize {
        self.inner.lock().nframes
    }

    /// Number of frames that are currently free.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free
    }

    /// Reference count of the frame containing `pa`. Zero for free frames
    /// and for addresses outside of the pool.
    pub fn ref_count(&self, pa: Pa) -> usize {
        self.inner
            .lock()
            .ref_cnts
            .get(pa.pfn())
            .copied()
            .unwrap_or(0)
    }
}

/// A representation of a physical frame.
///
/// This page internally holds the reference counts. This counter increases on
/// a calling of [`Page::clone`], and decreases when the page instance is
/// dropped. The frame returns to its [`FramePool`] with the last drop.
///
/// The contents of a frame are only reachable through [`Page::read`] and
/// [`Page::write`]; every handle to the same frame observes the same bytes.
pub struct Page {
    pool: Arc<FramePool>,
    pa: Pa,
}

impl Page {
    /// Allocate a new, zero-filled page from `pool`.
    ///
    /// # Returns
    /// - `Some(Page)` with a reference count of one.
    /// - `None` if the pool has no free frame left.
    pub fn new(pool: &Arc<FramePool>) -> Option<Self> {
        let index = pool.inner.lock().alloc()?;
        Some(Page {
            pool: pool.clone(),
            pa: Pa::from_pfn(index),
        })
    }

    /// Get the physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Number of live handles to this frame, including `self`.
    pub fn ref_count(&self) -> usize {
        self.pool.ref_count(self.pa)
    }

    /// Copy `buf.len()` bytes starting at byte `ofs` of the page into `buf`.
    ///
    /// # Panics
    /// Panics if the range does not fit inside the page.
    pub fn read(&self, ofs: usize, buf: &mut [u8]) {
        let arena = self.pool.inner.lock();
        buf.copy_from_slice(&arena.frame(self.pa)[ofs..ofs + buf.len()]);
    }

    /// Copy `data` into the page starting at byte `ofs`.
    ///
    /// # Panics
    /// Panics if the range does not fit inside the page.
    pub fn write(&self, ofs: usize, data: &[u8]) {
        let mut arena = self.pool.inner.lock();
        arena.frame_mut(self.pa)[ofs..ofs + data.len()].copy_from_slice(data);
    }
}

impl Clone for Page {
    fn clone(&self) -> Self {
        self.pool.inner.lock().ref_cnts[self.pa.pfn()] += 1;
        Page {
            pool: self.pool.clone(),
            pa: self.pa,
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let mut arena = self.pool.inner.lock();
        let index = self.pa.pfn();
        arena.ref_cnts[index] -= 1;
        if arena.ref_cnts[index] == 0 {
            arena.dealloc(index);
        }
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:?})", self.pa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_zeroes_and_exhausts() {
        let pool = FramePool::new(2);
        assert_eq!(pool.capacity(), 2);
        let a = Page::new(&pool).unwrap();
        let b = Page::new(&pool).unwrap();
        assert_ne!(a.pa(), b.pa());
        assert!(Page::new(&pool).is_none());
        assert_eq!(pool.free_frames(), 0);

        let mut buf = [0xffu8; 16];
        a.read(0, &mut buf);
        assert_eq!(buf, [0; 16]);
    }

    #[test]
    fn clone_shares_contents_and_counts() {
        let pool = FramePool::new(4);
        let a = Page::new(&pool).unwrap();
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);

        b.write(0x10, b"shared");
        let mut buf = [0u8; 6];
        a.read(0x10, &mut buf);
        assert_eq!(&buf, b"shared");

        drop(b);
        assert_eq!(a.ref_count(), 1);
        assert_eq!(pool.free_frames(), 3);
    }

    #[test]
    fn last_drop_frees_and_reuse_is_zeroed() {
        let pool = FramePool::new(1);
        let a = Page::new(&pool).unwrap();
        a.write(0, b"stale");
        let pa = a.pa();
        drop(a);
        assert_eq!(pool.free_frames(), 1);
        assert_eq!(pool.ref_count(pa), 0);

        let b = Page::new(&pool).unwrap();
        assert_eq!(b.pa(), pa);
        let mut buf = [0xffu8; 5];
        b.read(0, &mut buf);
        assert_eq!(buf, [0; 5]);
    }
}
