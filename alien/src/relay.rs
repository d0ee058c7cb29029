//! The reverse path: native code calling a managed function through a
//! trampoline slot.
//!
//! Arguments are read out of the saved register image and the caller's
//! stack with the same placement table the forward path writes with. The
//! return value is placed into outgoing result registers, or written
//! through the hidden pointer. Errors never reach native code: they zero
//! the result and are recorded for the owning instance.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use ctype::{Direction, Extend, FunctionLayout, Location, PassMode, Piece, TypeRef};
use log::{trace, warn};

use crate::{
    AlienError, AlienResult, ArgPosition,
    abi::{FrameShape, classifier},
    broker::Broker,
    codec::{CallContext, OutArg, decode_value, encode_value, read_uint},
    dispatch::RawResult,
    frame::{fetch, store},
    pool::Pool,
    trampoline::{self, Binding, TrampolineTable},
    value::{Function, Value},
};

/// The instance side of a relay.
pub trait RelayOwner: Send + Sync {
    /// Whether the calling thread may run managed code directly.
    fn is_owner_thread(&self) -> bool;

    /// Queue drained by the owning thread; `None` when the event loop is
    /// disabled.
    fn broker(&self) -> Option<&Broker>;

    /// Keeps a relay error for the owner's next safe point.
    fn record_error(&self, err: AlienError);
}

/// Incoming argument state: the saved argument registers, laid out like a
/// frame's register images, and the caller's stack arguments.
#[derive(Debug, Clone, Copy)]
pub struct RegisterImage<'a> {
    pub regs: &'a [u8],
    pub stack: &'a [u8],
}

/// Scratch for encoding a callback's return value.
struct ReturnContext<'a> {
    pool: &'a Pool,
}

impl CallContext for ReturnContext<'_> {
    fn alloc_scratch(&mut self, size: usize, align: usize) -> AlienResult<*mut u8> {
        self.pool
            .alloc_scratch(size, align)
            .map(|addr| addr as *mut u8)
    }

    fn reserve_trampoline(&mut self, ty: &TypeRef, _func: &crate::value::Function) -> AlienResult<usize> {
        Err(AlienError::conversion(
            ArgPosition::Return,
            format!("native pointer for {}", ty.name()),
            "function",
        ))
    }

    fn push_out(&mut self, _out: OutArg) {}
}

/// Result image layout: two integer registers, then the vector results at
/// the ABI's stride.
fn result_shape(vec_slot: u32) -> FrameShape {
    FrameShape {
        gpr_count: 2,
        gpr_slot: 8,
        vec_count: (32 / vec_slot) as u8,
        vec_slot,
        stack_slot: 8,
        shadow: 0,
    }
}

fn address_in(shape: &FrameShape, image: &RegisterImage<'_>, loc: Location) -> AlienResult<usize> {
    let width = shape.gpr_slot;
    let mut bytes = [0u8; 8];
    fetch(
        shape,
        image.regs,
        image.stack,
        &Piece::raw(0, width, loc),
        &mut bytes[..width as usize],
    )?;
    Ok(read_uint(&bytes, false) as usize)
}

fn read_arguments(
    binding: &Binding,
    shape: &FrameShape,
    image: &RegisterImage<'_>,
) -> AlienResult<Vec<Value>> {
    let sig = &binding.signature;
    let mut args = Vec::with_capacity(sig.params.len());
    for (param, placement) in sig.params.iter().zip(&binding.layout.params) {
        let size = param.ty.size();
        let mut bytes = vec![0u8; size];
        match placement.mode {
            PassMode::Ignore => {}
            PassMode::Direct => {
                for piece in &placement.pieces {
                    fetch(shape, image.regs, image.stack, piece, &mut bytes)?;
                }
            }
            PassMode::Indirect => {
                if let Some(piece) = placement.pieces.first() {
                    let addr = address_in(shape, image, piece.dest)?;
                    // SAFETY: the caller passed a copy of `size` bytes here
                    let src = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
                    bytes.copy_from_slice(src);
                }
            }
        }
        // SAFETY: native callers pass terminated strings
        args.push(unsafe { encode_value(&bytes, &param.ty)? });
    }
    Ok(args)
}

fn invoke(func: &Function, args: &[Value]) -> AlienResult<Value> {
    catch_unwind(AssertUnwindSafe(|| func.call(args))).unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "callback panicked".to_string());
        Err(AlienError::Callback { message })
    })
}

fn write_return(
    layout: &FunctionLayout,
    shape: &FrameShape,
    pool: &Pool,
    ret: &TypeRef,
    value: &Value,
    hidden: Option<usize>,
) -> AlienResult<RawResult> {
    let mut raw = RawResult::default();
    if layout.ret.mode == PassMode::Ignore {
        return Ok(raw);
    }
    let mut bytes = vec![0u8; ret.size()];
    let mut ctx = ReturnContext { pool };
    decode_value(&mut ctx, value, ret, Direction::In, &mut bytes, ArgPosition::Return)?;
    if let Some(addr) = hidden {
        // SAFETY: the caller provided a buffer for the return value
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
        raw.gpr[0] = addr as u64;
        return Ok(raw);
    }
    let out_shape = result_shape(shape.vec_slot);
    let mut image = raw.to_bytes();
    for piece in &layout.ret.pieces {
        if piece.extend == Extend::X87 {
            let from = piece.src as usize;
            let double = match piece.len {
                4 => f64::from(f32::from_bits(read_uint(&bytes[from..from + 4], false) as u32)),
                _ => f64::from_bits(read_uint(&bytes[from..from + 8], false)),
            };
            let widened = Piece::raw(0, 8, piece.dest);
            store(&out_shape, &mut image, &mut [], &widened, &double.to_le_bytes())?;
        } else {
            store(&out_shape, &mut image, &mut [], piece, &bytes)?;
        }
    }
    Ok(RawResult::from_bytes(&image))
}

fn relay_bound(
    table: &TrampolineTable,
    index: usize,
    generation: u64,
    binding: &Binding,
    image: &RegisterImage<'_>,
    thread_switch: bool,
) -> AlienResult<RawResult> {
    let layout = &binding.layout;
    let shape = classifier(layout.abi).shape();
    let args = read_arguments(binding, &shape, image)?;
    let hidden = match (layout.ret.mode, layout.ret.hidden) {
        (PassMode::Indirect, Some(loc)) => Some(address_in(&shape, image, loc)?),
        _ => None,
    };
    if !table.is_current(index, generation) {
        return Err(AlienError::StaleCallback { index });
    }

    let result = if thread_switch {
        let owner = binding
            .owner
            .upgrade()
            .ok_or(AlienError::StaleCallback { index })?;
        let broker = owner
            .broker()
            .ok_or(AlienError::ResourceExhaustion(crate::Resource::EventLoop))?;
        trace!("relay {index}: handing off to the owner thread");
        let func = binding.func.clone();
        broker.call(move || invoke(&func, &args))
    } else {
        invoke(&binding.func, &args)
    }?;

    write_return(layout, &shape, &binding.pool, &binding.signature.ret, &result, hidden)
}

/// Runs the managed function bound to slot `index`.
///
/// Never fails: on any error the result is zeroed and the error recorded,
/// with the owning instance when it is still alive, with the table
/// otherwise.
pub fn relay(
    table: &TrampolineTable,
    index: usize,
    image: &RegisterImage<'_>,
    thread_switch: bool,
) -> RawResult {
    let Some((generation, binding)) = table.lookup(index) else {
        warn!("trampoline {index} invoked while free");
        table.record_stale(AlienError::StaleCallback { index });
        return RawResult::default();
    };
    match relay_bound(table, index, generation, &binding, image, thread_switch) {
        Ok(raw) => raw,
        Err(err) => {
            if matches!(err, AlienError::StaleCallback { .. }) {
                warn!("trampoline {index} went stale during its call");
            }
            match binding.owner.upgrade() {
                Some(owner) => owner.record_error(err),
                None => table.record_stale(err),
            }
            RawResult::default()
        }
    }
}

/// Called by the native thunks with the saved argument registers, the
/// caller's stack arguments and the result block to fill.
///
/// # Safety
/// `regs` must hold the host ABI's register images and `stack` the
/// caller's outgoing argument area.
pub(crate) unsafe extern "C" fn relay_entry(
    index: usize,
    regs: *const u8,
    stack: usize,
    out: *mut RawResult,
) {
    let table = trampoline::global();
    let binding: Option<Arc<Binding>> = table.lookup(index).map(|(_, b)| b);
    let raw = match binding {
        Some(binding) => {
            let layout = &binding.layout;
            let shape = classifier(layout.abi).shape();
            // SAFETY: the thunk saved the full register images
            let regs = unsafe { std::slice::from_raw_parts(regs, shape.prefix()) };
            // SAFETY: the caller's argument area spans `args_size` bytes
            let stack = unsafe {
                std::slice::from_raw_parts(stack as *const u8, layout.args_size as usize)
            };
            let thread_switch = binding
                .owner
                .upgrade()
                .is_some_and(|owner| !owner.is_owner_thread());
            relay(table, index, &RegisterImage { regs, stack }, thread_switch)
        }
        None => relay(table, index, &RegisterImage { regs: &[], stack: &[] }, false),
    };
    // SAFETY: the thunk passes a writable result block
    unsafe { out.write(raw) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abi::tests::{prim, record, reg},
        decode::result_image,
        frame::Frame,
        trampoline::tests::{LocalOwner, binding},
    };
    use ctype::{Abi, FunctionSignature, PrimitiveKind};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    /// Builds the incoming image a native caller would produce, the same
    /// way a forward call lays out its frame.
    fn incoming(layout: &FunctionLayout, args: &[&[u8]]) -> (Vec<u8>, Vec<u8>) {
        let shape = classifier(layout.abi).shape();
        let mut regs = vec![0u8; shape.prefix()];
        let mut stack = vec![0u8; layout.args_size as usize];
        for (placement, bytes) in layout.params.iter().zip(args) {
            for piece in &placement.pieces {
                store(&shape, &mut regs, &mut stack, piece, bytes).expect("store");
            }
        }
        (regs, stack)
    }

    #[test]
    fn arguments_are_read_back_for_every_abi() {
        for abi in Abi::ALL {
            let mut r = reg(abi);
            let i32_ = prim(&mut r, PrimitiveKind::Int32);
            let f64_ = prim(&mut r, PrimitiveKind::Float64);
            let sig = FunctionSignature::new("add", f64_.clone())
                .param(i32_.clone())
                .param(f64_.clone())
                .param(i32_);
            let owner = Arc::new(LocalOwner::default());
            let func = Function::new(|_, args| {
                let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
                Ok(Value::Number(sum))
            });
            let bound = binding(&owner, abi, sig, func);
            let layout = bound.layout.clone();
            let table = TrampolineTable::new(4);
            let slot = table.reserve(bound).expect("reserve");

            let (regs, stack) = incoming(
                &layout,
                &[&(-3i32).to_le_bytes(), &0.5f64.to_le_bytes(), &40i32.to_le_bytes()],
            );
            let raw = relay(&table, slot.index, &RegisterImage { regs: &regs, stack: &stack }, false);
            let shape = classifier(abi).shape();
            // SAFETY: direct return, no hidden buffer involved
            let image = unsafe { result_image(&layout, &shape, &f64_, &raw, None) }.expect("image");
            assert_eq!(image, 37.5f64.to_le_bytes(), "{abi}");
            assert!(owner.errors.lock().is_empty(), "{abi}");
        }
    }

    #[test]
    fn stale_slots_return_zero_and_record() {
        let table = TrampolineTable::new(2);
        let raw = relay(&table, 1, &RegisterImage { regs: &[], stack: &[] }, false);
        assert_eq!(raw, RawResult::default());
        let stale = table.take_stale();
        assert!(matches!(stale.as_slice(), [AlienError::StaleCallback { index: 1 }]));
    }

    #[test]
    fn callback_errors_are_recorded_not_raised() {
        let mut r = reg(Abi::Arm64);
        let i32_ = prim(&mut r, PrimitiveKind::Int32);
        let sig = FunctionSignature::new("fail", i32_);
        let owner = Arc::new(LocalOwner::default());
        let bound = binding(
            &owner,
            Abi::Arm64,
            sig,
            Function::new(|_, _| Err(AlienError::Callback { message: "boom".into() })),
        );
        let table = TrampolineTable::new(1);
        let slot = table.reserve(bound).expect("reserve");
        let regs = vec![0u8; classifier(Abi::Arm64).shape().prefix()];
        let raw = relay(&table, slot.index, &RegisterImage { regs: &regs, stack: &[] }, false);
        assert_eq!(raw, RawResult::default());
        assert_eq!(owner.errors.lock().len(), 1);
    }

    #[test]
    fn panics_become_callback_errors() {
        let mut r = reg(Abi::X64SysV);
        let void = prim(&mut r, PrimitiveKind::Void);
        let owner = Arc::new(LocalOwner::default());
        let bound = binding(
            &owner,
            Abi::X64SysV,
            FunctionSignature::new("oops", void),
            Function::new(|_, _| panic!("callback exploded")),
        );
        let table = TrampolineTable::new(1);
        let slot = table.reserve(bound).expect("reserve");
        let regs = vec![0u8; 112];
        relay(&table, slot.index, &RegisterImage { regs: &regs, stack: &[] }, false);
        let errors = owner.errors.lock();
        assert!(matches!(
            errors.as_slice(),
            [AlienError::Callback { message }] if message == "callback exploded"
        ));
    }

    #[test]
    fn unsigned_results_keep_their_width() {
        let mut r = reg(Abi::RiscV64);
        let u32_ = prim(&mut r, PrimitiveKind::UInt32);
        let owner = Arc::new(LocalOwner::default());
        let bound = binding(
            &owner,
            Abi::RiscV64,
            FunctionSignature::new("big", u32_),
            Function::new(|_, _| Ok(Value::Number(f64::from(u32::MAX)))),
        );
        let table = TrampolineTable::new(1);
        let slot = table.reserve(bound).expect("reserve");
        let regs = vec![0u8; 128];
        let raw = relay(&table, slot.index, &RegisterImage { regs: &regs, stack: &[] }, false);
        assert_eq!(raw.gpr[0], u64::from(u32::MAX));
    }

    #[test]
    fn hidden_pointer_returns_are_written_through() {
        let mut r = reg(Abi::X64SysV);
        let rec = record(
            &mut r,
            &[PrimitiveKind::Int64, PrimitiveKind::Int64, PrimitiveKind::Int64],
        );
        let owner = Arc::new(LocalOwner::default());
        let bound = binding(
            &owner,
            Abi::X64SysV,
            FunctionSignature::new("triple", rec),
            Function::new(|_, _| {
                Ok(Value::object([
                    ("m0", Value::Number(1.0)),
                    ("m1", Value::Number(2.0)),
                    ("m2", Value::Number(3.0)),
                ]))
            }),
        );
        let layout = bound.layout.clone();
        let table = TrampolineTable::new(1);
        let slot = table.reserve(bound).expect("reserve");

        let mut out = [0i64; 3];
        let mut arena = crate::arena::StackArena::new(16 << 10, 0).expect("arena");
        let mut frame = Frame::carve(&mut arena, classifier(Abi::X64SysV).shape(), 0).expect("frame");
        let hidden = layout.ret.hidden.expect("hidden");
        frame
            .place_address(hidden, out.as_mut_ptr() as usize, ArgPosition::Return)
            .expect("hidden");
        let (regs, stack) = frame.image().split_at(112);
        let raw = relay(&table, slot.index, &RegisterImage { regs, stack }, false);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(raw.gpr[0], out.as_ptr() as u64);
    }

    #[test]
    fn off_thread_relays_run_on_the_owner() {
        let mut r = reg(Abi::X64SysV);
        let i32_ = prim(&mut r, PrimitiveKind::Int32);
        let owner = Arc::new(LocalOwner {
            broker: Some(Broker::new()),
            ..LocalOwner::default()
        });
        let here = thread::current().id();
        let ran_here = Arc::new(AtomicUsize::new(0));
        let seen = ran_here.clone();
        let bound = binding(
            &owner,
            Abi::X64SysV,
            FunctionSignature::new("where", i32_),
            Function::new(move |_, _| {
                if thread::current().id() == here {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Value::Number(9.0))
            }),
        );
        let table = Arc::new(TrampolineTable::new(1));
        let slot = table.reserve(bound).expect("reserve");

        let remote = table.clone();
        let worker = thread::spawn(move || {
            let regs = vec![0u8; 112];
            relay(&remote, slot.index, &RegisterImage { regs: &regs, stack: &[] }, true)
        });
        let broker = owner.broker.as_ref().expect("broker");
        while broker.pump() == 0 {
            broker.wait(|| false);
        }
        let raw = worker.join().expect("join");
        assert_eq!(raw.gpr[0], 9);
        assert_eq!(ran_here.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_thread_relays_without_event_loop_fail() {
        let mut r = reg(Abi::X64SysV);
        let void = prim(&mut r, PrimitiveKind::Void);
        let owner = Arc::new(LocalOwner::default());
        let bound = binding(
            &owner,
            Abi::X64SysV,
            FunctionSignature::new("nowhere", void),
            Function::new(|_, _| Ok(Value::Undefined)),
        );
        let table = TrampolineTable::new(1);
        let slot = table.reserve(bound).expect("reserve");
        let regs = vec![0u8; 112];
        relay(&table, slot.index, &RegisterImage { regs: &regs, stack: &[] }, true);
        assert!(matches!(
            owner.errors.lock().as_slice(),
            [AlienError::ResourceExhaustion(crate::Resource::EventLoop)]
        ));
    }
}
