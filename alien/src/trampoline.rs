//! Trampoline slots: a fixed table mapping thunk indices to the managed
//! functions they call.
//!
//! A slot is `Free`, then `Reserved` with a generation, then released back
//! to `Free` with the generation bumped. Relays remember the generation
//! they started with, so an invocation racing a release sees a mismatch.

use std::{
    collections::VecDeque,
    sync::{Arc, OnceLock, Weak},
};

use ctype::{FunctionLayout, FunctionSignature, TypeRef};
use log::trace;
use parking_lot::Mutex;

use crate::{
    AlienError, AlienResult, Resource,
    config::MAX_TRAMPOLINES,
    pool::Pool,
    relay::RelayOwner,
    thunks,
    value::Function,
};

/// What a reserved slot calls, and on whose behalf.
pub struct Binding {
    pub owner: Weak<dyn RelayOwner>,
    /// The callback pointer type the slot was reserved for.
    pub ty: TypeRef,
    pub signature: FunctionSignature,
    pub layout: Arc<FunctionLayout>,
    pub func: Function,
    /// Scratch for return values comes from here.
    pub pool: Arc<Pool>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("ty", &self.ty.name())
            .field("abi", &self.layout.abi)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    binding: Option<Arc<Binding>>,
}

#[derive(Debug)]
struct Slots {
    entries: Vec<Slot>,
    free: VecDeque<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub index: usize,
    pub generation: u64,
    /// Native function pointer handed to foreign code.
    pub address: usize,
}

#[derive(Debug)]
pub struct TrampolineTable {
    slots: Mutex<Slots>,
    // stale invocations nobody could be told about
    stale: Mutex<Vec<AlienError>>,
}

impl TrampolineTable {
    #[must_use]
    pub fn new(capacity: usize) -> TrampolineTable {
        let capacity = capacity.min(MAX_TRAMPOLINES);
        TrampolineTable {
            slots: Mutex::new(Slots {
                entries: (0..capacity).map(|_| Slot::default()).collect(),
                free: (0..capacity).collect(),
            }),
            stale: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.lock().entries.len()
    }

    /// Number of slots currently reserved.
    #[must_use]
    pub fn reserved(&self) -> usize {
        let slots = self.slots.lock();
        slots.entries.len() - slots.free.len()
    }

    /// Least recently released slots are reused first.
    pub fn reserve(&self, binding: Binding) -> AlienResult<Reservation> {
        let mut slots = self.slots.lock();
        let index = slots
            .free
            .pop_front()
            .ok_or(AlienError::ResourceExhaustion(Resource::Trampolines))?;
        let Some(address) = thunks::address(index) else {
            slots.free.push_front(index);
            return Err(AlienError::ResourceExhaustion(Resource::Trampolines));
        };
        let slot = &mut slots.entries[index];
        slot.binding = Some(Arc::new(binding));
        trace!("trampoline {index} reserved, generation {}", slot.generation);
        Ok(Reservation {
            index,
            generation: slot.generation,
            address,
        })
    }

    /// Frees the slot if it still carries `generation`.
    pub fn release(&self, index: usize, generation: u64) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.entries.get_mut(index) else {
            return false;
        };
        if slot.generation != generation || slot.binding.is_none() {
            return false;
        }
        slot.binding = None;
        slot.generation += 1;
        slots.free.push_back(index);
        trace!("trampoline {index} released");
        true
    }

    pub fn lookup(&self, index: usize) -> Option<(u64, Arc<Binding>)> {
        let slots = self.slots.lock();
        let slot = slots.entries.get(index)?;
        slot.binding.clone().map(|b| (slot.generation, b))
    }

    #[must_use]
    pub fn is_current(&self, index: usize, generation: u64) -> bool {
        let slots = self.slots.lock();
        slots
            .entries
            .get(index)
            .is_some_and(|s| s.generation == generation && s.binding.is_some())
    }

    pub fn record_stale(&self, err: AlienError) {
        self.stale.lock().push(err);
    }

    pub fn take_stale(&self) -> Vec<AlienError> {
        std::mem::take(&mut *self.stale.lock())
    }
}

/// The table behind the native thunks.
pub fn global() -> &'static TrampolineTable {
    static TABLE: OnceLock<TrampolineTable> = OnceLock::new();
    TABLE.get_or_init(|| TrampolineTable::new(MAX_TRAMPOLINES))
}
