//! Memory pools: one stack arena plus one heap arena each.
//!
//! The synchronous pool serves calls made on any thread that does not
//! need its own stack. Async calls claim one of the resident async pools,
//! or get a temporary one that lives as long as the call.

use std::sync::{
    Arc,
    atomic::{AtomicU8, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
    AlienError, AlienResult, Resource,
    arena::{HeapArena, HeapMark, StackArena},
    config::AlienSettings,
};

/// Stack kept free between a callback's native stack pointer and the frame
/// of a nested call made from that callback.
const NESTED_HEADROOM: usize = 64 << 10;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PoolFlags: u8 {
        const Resident = 1 << 0;
        const Async = 1 << 1;
        const Busy = 1 << 2;
    }
}

#[derive(Debug)]
pub struct Arenas {
    pub stack: StackArena,
    pub heap: HeapArena,
}

/// Cursors saved when a session enters a pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolMark {
    stack: usize,
    heap: HeapMark,
}

#[derive(Debug)]
pub struct Pool {
    arenas: Mutex<Arenas>,
    flags: AtomicU8,
    depth: AtomicUsize,
}

fn stack_pointer() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

impl Pool {
    pub fn new(
        stack_size: usize,
        heap_size: usize,
        settings: &AlienSettings,
        flags: PoolFlags,
    ) -> AlienResult<Pool> {
        let stack = StackArena::new(stack_size, settings.red_zone)?;
        let heap = HeapArena::new(heap_size, settings.heap_fallback)?;
        debug!("pool {flags:?}: {stack_size} byte stack, {heap_size} byte heap");
        Ok(Pool {
            arenas: Mutex::new(Arenas { stack, heap }),
            flags: AtomicU8::new(flags.bits()),
            depth: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn flags(&self) -> PoolFlags {
        PoolFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Number of sessions currently inside this pool.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    fn try_claim(&self) -> bool {
        let busy = PoolFlags::Busy.bits();
        self.flags.fetch_or(busy, Ordering::AcqRel) & busy == 0
    }

    fn unclaim(&self) {
        self.flags
            .fetch_and(!PoolFlags::Busy.bits(), Ordering::AcqRel);
    }

    /// Starts a session. A nested session begins below the native stack of
    /// the code that is calling back into us when that stack lives in this
    /// pool.
    pub fn enter(&self) -> PoolMark {
        let mut arenas = self.arenas.lock();
        let mark = PoolMark {
            stack: arenas.stack.cursor(),
            heap: arenas.heap.mark(),
        };
        if self.depth.fetch_add(1, Ordering::AcqRel) > 0 {
            let sp = stack_pointer();
            if arenas.stack.contains(sp) {
                let floor = arenas.stack.floor();
                arenas
                    .stack
                    .lower_to(sp.saturating_sub(NESTED_HEADROOM).max(floor));
            }
        }
        mark
    }

    /// Ends a session: everything allocated since `mark` is freed.
    pub fn leave(&self, mark: PoolMark) {
        let mut arenas = self.arenas.lock();
        arenas.stack.restore(mark.stack);
        arenas.heap.restore(mark.heap);
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn with_arenas<R>(&self, f: impl FnOnce(&mut Arenas) -> R) -> R {
        f(&mut self.arenas.lock())
    }

    /// Scratch memory that lives until the innermost open session ends.
    pub fn alloc_scratch(&self, size: usize, align: usize) -> AlienResult<usize> {
        if self.depth() == 0 {
            return Err(AlienError::ResourceExhaustion(Resource::HeapArena));
        }
        let ptr = self.with_arenas(|a| a.heap.alloc(size, align))?;
        Ok(ptr.as_ptr() as usize)
    }
}

/// Every pool an instance owns.
#[derive(Debug)]
pub struct PoolSet {
    sync: Arc<Pool>,
    resident: Vec<Arc<Pool>>,
    temporaries: AtomicUsize,
    settings: AlienSettings,
}

impl PoolSet {
    pub fn new(settings: &AlienSettings) -> AlienResult<PoolSet> {
        let sync = Arc::new(Pool::new(
            settings.sync_stack_size,
            settings.sync_heap_size,
            settings,
            PoolFlags::Resident,
        )?);
        let resident = (0..settings.resident_async_pools)
            .map(|_| {
                Pool::new(
                    settings.async_stack_size,
                    settings.async_heap_size,
                    settings,
                    PoolFlags::Resident | PoolFlags::Async,
                )
                .map(Arc::new)
            })
            .collect::<AlienResult<Vec<_>>>()?;
        Ok(PoolSet {
            sync,
            resident,
            temporaries: AtomicUsize::new(0),
            settings: settings.clone(),
        })
    }

    #[must_use]
    pub fn sync(&self) -> &Arc<Pool> {
        &self.sync
    }

    /// Claims a free resident async pool, or creates a temporary one.
    pub fn acquire_async(&self) -> AlienResult<Arc<Pool>> {
        if let Some(pool) = self.resident.iter().find(|p| p.try_claim()) {
            return Ok(pool.clone());
        }
        let live = self.temporaries.fetch_add(1, Ordering::AcqRel) + 1;
        warn!("all resident async pools are busy, creating temporary pool #{live}");
        Pool::new(
            self.settings.async_stack_size,
            self.settings.async_heap_size,
            &self.settings,
            PoolFlags::Async | PoolFlags::Busy,
        )
        .map(Arc::new)
        .inspect_err(|_| {
            self.temporaries.fetch_sub(1, Ordering::AcqRel);
        })
    }

    /// Returns an async pool. Temporary pools are destroyed with their
    /// last reference.
    pub fn release(&self, pool: &Arc<Pool>) {
        if pool.flags().contains(PoolFlags::Resident) {
            pool.unclaim();
        } else {
            self.temporaries.fetch_sub(1, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    #[must_use]
    pub fn temporary_count(&self) -> usize {
        self.temporaries.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlienCreateInfo;

    fn settings(resident: usize) -> AlienSettings {
        AlienSettings::resolve(&AlienCreateInfo {
            sync_stack_size: Some(256 << 10),
            sync_heap_size: Some(64 << 10),
            async_stack_size: Some(128 << 10),
            async_heap_size: Some(64 << 10),
            resident_async_pools: Some(resident),
            ..AlienCreateInfo::default()
        })
    }

    #[test]
    fn resident_pools_are_claimed_then_temporaries_created() {
        let pools = PoolSet::new(&settings(1)).expect("pools");
        let first = pools.acquire_async().expect("resident");
        assert!(first.flags().contains(PoolFlags::Resident | PoolFlags::Busy));
        let second = pools.acquire_async().expect("temporary");
        assert!(!second.flags().contains(PoolFlags::Resident));
        assert_eq!(pools.temporary_count(), 1);

        pools.release(&second);
        drop(second);
        assert_eq!(pools.temporary_count(), 0);
        pools.release(&first);
        assert!(!first.flags().contains(PoolFlags::Busy));
        let again = pools.acquire_async().expect("resident again");
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn leaving_restores_both_arenas() {
        let pools = PoolSet::new(&settings(0)).expect("pools");
        let pool = pools.sync();
        let before = pool.with_arenas(|a| (a.stack.cursor(), a.heap.used()));
        let mark = pool.enter();
        pool.alloc_scratch(100, 8).expect("scratch");
        pool.with_arenas(|a| a.stack.carve(512, 16, 0)).expect("carve");
        assert_eq!(pool.depth(), 1);
        pool.leave(mark);
        assert_eq!(pool.depth(), 0);
        assert_eq!(pool.with_arenas(|a| (a.stack.cursor(), a.heap.used())), before);
    }

    #[test]
    fn scratch_needs_an_open_session() {
        let pools = PoolSet::new(&settings(0)).expect("pools");
        assert!(matches!(
            pools.sync().alloc_scratch(8, 8),
            Err(AlienError::ResourceExhaustion(Resource::HeapArena))
        ));
    }
}
