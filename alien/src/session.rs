//! One forward call: build the frame, run it, decode the result, clean up.
//!
//! A session owns everything the call allocates. Disposing it (explicitly
//! or on drop) restores the pool cursors, releases the trampolines the
//! arguments reserved and returns an async pool to its set.

use std::sync::{Arc, Weak};

use ctype::{FunctionLayout, FunctionSignature, PassMode, TypeRef};
use log::trace;

use crate::{
    AlienError, AlienResult, ArgPosition,
    abi::classifier,
    codec::{CallContext, OutArg, decode_value, pop_out},
    decode::decode_result,
    dispatch::{RawResult, host},
    frame::{Frame, address_image},
    instance::Shared,
    pool::{Pool, PoolMark},
    relay::RelayOwner,
    trampoline::{self, Binding},
    value::{Function, Value},
};

pub struct CallSession {
    shared: Arc<Shared>,
    pool: Arc<Pool>,
    is_async: bool,
    // `None` once disposed
    mark: Option<PoolMark>,
    sig: FunctionSignature,
    layout: Arc<FunctionLayout>,
    frame: Option<Frame>,
    hidden: Option<usize>,
    outs: Vec<OutArg>,
    trampolines: Vec<(usize, u64)>,
    position: ArgPosition,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("function", &self.sig.name)
            .field("abi", &self.layout.abi)
            .field("is_async", &self.is_async)
            .field("prepared", &self.frame.is_some())
            .field("trampolines", &self.trampolines.len())
            .finish_non_exhaustive()
    }
}

impl CallSession {
    pub(crate) fn begin(
        shared: Arc<Shared>,
        pool: Arc<Pool>,
        is_async: bool,
        sig: FunctionSignature,
        layout: Arc<FunctionLayout>,
    ) -> CallSession {
        let mark = pool.enter();
        trace!("session for {} at depth {}", sig.name, pool.depth());
        CallSession {
            shared,
            pool,
            is_async,
            mark: Some(mark),
            sig,
            layout,
            frame: None,
            hidden: None,
            outs: Vec::new(),
            trampolines: Vec::new(),
            position: ArgPosition::Return,
        }
    }

    #[must_use]
    pub fn signature(&self) -> &FunctionSignature {
        &self.sig
    }

    #[must_use]
    pub fn layout(&self) -> &FunctionLayout {
        &self.layout
    }

    #[must_use]
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Native addresses of the trampolines reserved for this call.
    #[must_use]
    pub fn trampolines(&self) -> Vec<usize> {
        self.trampolines
            .iter()
            .filter_map(|&(index, _)| crate::thunks::address(index))
            .collect()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.mark.is_none()
    }

    /// Converts `args` and writes them into a fresh frame. Conversion
    /// errors name the parameter and leave no native state behind once
    /// the session is disposed. A session is prepared once; after a failed
    /// attempt it may be prepared again.
    pub fn prepare(&mut self, args: &[Value]) -> AlienResult<()> {
        if self.mark.is_none() {
            return Err(AlienError::Unprepared);
        }
        if self.frame.is_some() {
            return Err(AlienError::AlreadyPrepared);
        }
        self.discard_attempt();
        let layout = self.layout.clone();
        let params = self.sig.params.clone();
        if args.len() != params.len() {
            return Err(AlienError::conversion(
                ArgPosition::Param(args.len().min(params.len())),
                format!("{} arguments", params.len()),
                format!("{}", args.len()),
            ));
        }
        let shape = classifier(layout.abi).shape();
        let args_size = layout.args_size as usize;
        let mut frame = self
            .pool
            .with_arenas(|a| Frame::carve(&mut a.stack, shape, args_size))?;

        if layout.ret.mode == PassMode::Indirect {
            let (size, align) = (self.sig.ret.size().max(1), self.sig.ret.align().max(16));
            let buf = self.alloc_scratch(size, align)? as usize;
            if let Some(loc) = layout.ret.hidden {
                frame.place_address(loc, buf, ArgPosition::Return)?;
            }
            self.hidden = Some(buf);
        }

        for (i, ((param, placement), value)) in
            params.iter().zip(&layout.params).zip(args).enumerate()
        {
            let position = ArgPosition::Param(i);
            self.position = position;
            let mut bytes = vec![0u8; param.ty.size()];
            decode_value(self, value, &param.ty, param.direction, &mut bytes, position)?;
            match placement.mode {
                PassMode::Ignore => {}
                PassMode::Direct => {
                    for piece in &placement.pieces {
                        frame.place(piece, &bytes)?;
                    }
                }
                PassMode::Indirect => {
                    let copy = self.alloc_scratch(bytes.len().max(1), param.ty.align().max(8))?;
                    // SAFETY: fresh scratch of at least `bytes.len()` bytes
                    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), copy, bytes.len()) };
                    if let Some(piece) = placement.pieces.first() {
                        let image = address_image(copy as usize, piece.len as usize, position)?;
                        frame.place(piece, &image)?;
                    }
                }
            }
        }
        frame.apply_fixups(&layout)?;
        trace!(
            "prepared {}: {} byte frame, {} stack bytes",
            self.sig.name,
            frame.len(),
            frame.args_size()
        );
        self.frame = Some(frame);
        Ok(())
    }

    /// Runs the prepared frame against `func`.
    ///
    /// # Safety
    /// `func` must be a native function matching the session's signature.
    pub unsafe fn execute(&self, func: usize) -> AlienResult<RawResult> {
        let frame = self.frame.as_ref().ok_or(AlienError::Unprepared)?;
        let abi = self.layout.abi;
        if self.shared.host_forward() && !host::supports(abi) {
            return Err(AlienError::UnsupportedHost { abi });
        }
        // SAFETY: the frame was built from this layout; `func` is the caller's
        Ok(unsafe { self.shared.forward().forward(func, &self.layout, frame) })
    }

    /// Decodes the return value, runs its disposer and copies output
    /// arguments back into their values.
    pub fn complete(&mut self, raw: RawResult) -> AlienResult<Value> {
        let frame = self.frame.as_ref().ok_or(AlienError::Unprepared)?;
        let shape = frame.shape();
        // SAFETY: the hidden buffer, if any, is scratch owned by this session
        let value = unsafe { decode_result(&self.layout, &shape, &self.sig.ret, &raw, self.hidden)? };
        for out in std::mem::take(&mut self.outs) {
            // SAFETY: out-argument storage lives until dispose
            unsafe { pop_out(&out)? };
        }
        Ok(value)
    }

    // Drops what a failed `prepare` left behind. Its scratch stays until
    // dispose.
    fn discard_attempt(&mut self) {
        let table = trampoline::global();
        for (index, generation) in self.trampolines.drain(..) {
            table.release(index, generation);
        }
        self.outs.clear();
        self.hidden = None;
    }

    /// Frees everything the call allocated. Safe to call more than once.
    pub fn dispose(&mut self) {
        let Some(mark) = self.mark.take() else {
            return;
        };
        self.discard_attempt();
        self.frame = None;
        self.pool.leave(mark);
        if self.is_async {
            self.shared.pools().release(&self.pool);
        }
        trace!("session for {} disposed", self.sig.name);
    }
}

impl CallContext for CallSession {
    fn alloc_scratch(&mut self, size: usize, align: usize) -> AlienResult<*mut u8> {
        self.pool
            .alloc_scratch(size, align)
            .map(|addr| addr as *mut u8)
    }

    fn reserve_trampoline(&mut self, ty: &TypeRef, func: &Function) -> AlienResult<usize> {
        let sig = ty
            .signature()
            .ok_or_else(|| AlienError::conversion(self.position, "callback type", ty.name()))?;
        let layout = self.shared.callback_layout(sig)?;
        let owner: Arc<dyn RelayOwner> = self.shared.clone();
        let owner: Weak<dyn RelayOwner> = Arc::downgrade(&owner);
        let slot = trampoline::global().reserve(Binding {
            owner,
            ty: ty.clone(),
            signature: sig.clone(),
            layout,
            func: func.clone(),
            pool: self.pool.clone(),
        })?;
        self.trampolines.push((slot.index, slot.generation));
        Ok(slot.address)
    }

    fn push_out(&mut self, out: OutArg) {
        self.outs.push(out);
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.dispose();
    }
}
