//! Bump arenas backing one call session.
//!
//! The stack arena grows down from its top like a machine stack and is
//! what native callees run on. The heap arena grows up and holds scratch
//! objects (strings, indirect copies, out-parameter storage). Both reset
//! in O(1) by restoring a saved cursor.

use std::{alloc::Layout, ptr::NonNull};

use log::debug;

use crate::{
    AlienError, AlienResult, Resource,
    system::{map_memory, page_size, protect_guard, unmap_memory},
};

fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[derive(Debug)]
pub struct StackArena {
    map: NonNull<u8>,
    map_size: usize,
    // lowest usable address, just above the guard page
    floor: usize,
    // current top, moves down on carve
    top: usize,
    red_zone: usize,
}

// SAFETY: the arena owns its mapping; access is serialized by the pool
unsafe impl Send for StackArena {}

impl StackArena {
    pub fn new(size: usize, red_zone: usize) -> AlienResult<StackArena> {
        let guard = page_size();
        let map_size = align_up(size, guard) + guard;
        let map = map_memory(map_size).ok_or(AlienError::ResourceExhaustion(Resource::StackArena))?;
        if !protect_guard(map, guard) {
            debug!("stack arena guard page could not be protected");
        }
        let floor = map.as_ptr() as usize + guard;
        Ok(StackArena {
            map,
            map_size,
            floor,
            top: map.as_ptr() as usize + map_size,
            red_zone,
        })
    }

    #[must_use]
    pub fn cursor(&self) -> usize {
        self.top
    }

    pub fn restore(&mut self, cursor: usize) {
        debug_assert!(self.contains(cursor) || cursor == self.end());
        self.top = cursor;
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.map.as_ptr() as usize + self.map_size
    }

    #[must_use]
    pub fn floor(&self) -> usize {
        self.floor
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        (self.floor..self.end()).contains(&addr)
    }

    /// Bytes still available for frames and callee stack.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.top.saturating_sub(self.floor + self.red_zone)
    }

    /// Moves the top below `addr` when it lies inside this arena, so a
    /// nested call does not clobber the stack of the native code that is
    /// currently calling back into us.
    pub fn lower_to(&mut self, addr: usize) {
        if self.contains(addr) && addr < self.top {
            self.top = align_down(addr, 16);
        }
    }

    /// Carves `len` bytes off the top. The result is `align` aligned and at
    /// least the red zone plus `headroom` bytes stay free below it.
    pub fn carve(&mut self, len: usize, align: usize, headroom: usize) -> AlienResult<NonNull<u8>> {
        let start = self
            .top
            .checked_sub(len)
            .map(|v| align_down(v, align))
            .filter(|&v| v >= self.floor + self.red_zone + headroom)
            .ok_or(AlienError::ResourceExhaustion(Resource::StackArena))?;
        self.top = start;
        NonNull::new(start as *mut u8).ok_or(AlienError::ResourceExhaustion(Resource::StackArena))
    }
}

impl Drop for StackArena {
    fn drop(&mut self) {
        unmap_memory(self.map, self.map_size);
    }
}

#[derive(Debug)]
struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout in `HeapArena::alloc`
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Saved heap arena position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapMark {
    used: usize,
    blocks: usize,
}

#[derive(Debug)]
pub struct HeapArena {
    map: NonNull<u8>,
    size: usize,
    used: usize,
    fallback: usize,
    blocks: Vec<Block>,
}

// SAFETY: the arena owns its mapping and blocks
unsafe impl Send for HeapArena {}

impl HeapArena {
    pub fn new(size: usize, fallback: usize) -> AlienResult<HeapArena> {
        let size = align_up(size.max(1), page_size());
        let map = map_memory(size).ok_or(AlienError::ResourceExhaustion(Resource::HeapArena))?;
        Ok(HeapArena {
            map,
            size,
            used: 0,
            fallback,
            blocks: Vec::new(),
        })
    }

    #[must_use]
    pub fn mark(&self) -> HeapMark {
        HeapMark {
            used: self.used,
            blocks: self.blocks.len(),
        }
    }

    /// Frees everything allocated after `mark`.
    pub fn restore(&mut self, mark: HeapMark) {
        self.used = mark.used;
        self.blocks.truncate(mark.blocks);
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Zeroed scratch memory. Large requests get their own allocation.
    pub fn alloc(&mut self, size: usize, align: usize) -> AlienResult<NonNull<u8>> {
        let align = align.max(1).next_power_of_two();
        if size > self.fallback {
            let layout = Layout::from_size_align(size, align)
                .map_err(|_| AlienError::ResourceExhaustion(Resource::HeapArena))?;
            // SAFETY: size is non-zero
            let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
                .ok_or(AlienError::ResourceExhaustion(Resource::HeapArena))?;
            self.blocks.push(Block { ptr, layout });
            return Ok(ptr);
        }
        let base = self.map.as_ptr() as usize;
        let start = align_up(base + self.used, align);
        let end = start + size;
        if end > base + self.size {
            return Err(AlienError::ResourceExhaustion(Resource::HeapArena));
        }
        self.used = end - base;
        let ptr = start as *mut u8;
        // SAFETY: [start, end) lies inside the mapping
        unsafe { std::ptr::write_bytes(ptr, 0, size) };
        NonNull::new(ptr).ok_or(AlienError::ResourceExhaustion(Resource::HeapArena))
    }
}

impl Drop for HeapArena {
    fn drop(&mut self) {
        self.blocks.clear();
        unmap_memory(self.map, self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_carves_downward_and_restores() {
        let mut stack = StackArena::new(64 << 10, 256).expect("stack");
        let top = stack.cursor();
        let a = stack.carve(100, 16, 0).expect("carve");
        assert_eq!(a.as_ptr() as usize % 16, 0);
        assert!((a.as_ptr() as usize) < top);
        let b = stack.carve(8, 16, 0).expect("carve");
        assert!(b < a);
        stack.restore(top);
        assert_eq!(stack.cursor(), top);
    }

    #[test]
    fn stack_keeps_red_zone_free() {
        let mut stack = StackArena::new(8 << 10, 256).expect("stack");
        let room = stack.remaining();
        assert!(stack.carve(room + 1, 1, 0).is_err());
        assert!(stack.carve(room, 1, 0).is_ok());
        assert!(matches!(
            stack.carve(16, 16, 0),
            Err(AlienError::ResourceExhaustion(Resource::StackArena))
        ));
    }

    #[test]
    fn nested_calls_start_below_the_native_stack() {
        let mut stack = StackArena::new(64 << 10, 256).expect("stack");
        let inside = stack.cursor() - 1000;
        stack.lower_to(inside);
        assert!(stack.cursor() <= inside);
        let before = stack.cursor();
        stack.lower_to(16);
        assert_eq!(stack.cursor(), before);
    }

    #[test]
    fn heap_falls_back_above_threshold() {
        let mut heap = HeapArena::new(4096, 1024).expect("heap");
        let mark = heap.mark();
        let small = heap.alloc(100, 8).expect("small");
        assert_eq!(small.as_ptr() as usize % 8, 0);
        assert_eq!(heap.used(), 100);
        heap.alloc(10_000, 16).expect("large");
        assert_eq!(heap.used(), 100);
        heap.restore(mark);
        assert_eq!(heap.mark(), mark);
    }

    #[test]
    fn heap_reports_exhaustion() {
        let mut heap = HeapArena::new(4096, usize::MAX).expect("heap");
        let size = heap.size;
        heap.alloc(size, 1).expect("fill");
        assert!(matches!(
            heap.alloc(1, 1),
            Err(AlienError::ResourceExhaustion(Resource::HeapArena))
        ));
    }
}
