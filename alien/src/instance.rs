//! The engine instance: configuration, layout caches, pools, the event
//! loop broker and the error queue relays report into.
//!
//! An `Instance` belongs to the thread that created it. Native code may
//! call back from any thread; those calls are handed to the owner through
//! the broker and run when the owner pumps or waits on an async call.

use std::{
    collections::{HashMap, VecDeque},
    marker::PhantomData,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use ctype::{Abi, FunctionLayout, FunctionSignature, PrimitiveKind, SignatureKey, TypeRef};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    AlienError, AlienResult, ArgPosition, Resource,
    abi::{classify, classify_callback},
    broker::{Broker, OneShot},
    config::{AlienCreateInfo, AlienSettings},
    dispatch::{ForwardCall, HostForwardCall, RawResult},
    pool::PoolSet,
    relay::RelayOwner,
    session::CallSession,
    threading::{PlatformThread, current_thread_token, spawn_platform},
    thunks,
    trampoline::{self, Binding},
    value::{Function, Handle, Value},
};

type LayoutCache = Mutex<HashMap<SignatureKey, AlienResult<Arc<FunctionLayout>>>>;

fn cached(
    cache: &LayoutCache,
    sig: &FunctionSignature,
    classify: impl FnOnce() -> AlienResult<FunctionLayout>,
) -> AlienResult<Arc<FunctionLayout>> {
    let key = sig.key();
    if let Some(hit) = cache.lock().get(&key) {
        return hit.clone();
    }
    let result = classify().map(Arc::new);
    cache.lock().insert(key, result.clone());
    result
}

pub(crate) struct Shared {
    settings: AlienSettings,
    abi: Abi,
    forward: Box<dyn ForwardCall>,
    host_forward: bool,
    pools: PoolSet,
    broker: Option<Broker>,
    owner: u64,
    functions: LayoutCache,
    callbacks: LayoutCache,
    errors: Mutex<VecDeque<AlienError>>,
    async_calls: AtomicUsize,
    workers: AtomicUsize,
    // persistent callbacks: slot index -> generation
    persistent: Mutex<HashMap<usize, u64>>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("abi", &self.abi)
            .field("host_forward", &self.host_forward)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl Shared {
    pub(crate) fn forward(&self) -> &dyn ForwardCall {
        self.forward.as_ref()
    }

    pub(crate) fn host_forward(&self) -> bool {
        self.host_forward
    }

    pub(crate) fn pools(&self) -> &PoolSet {
        &self.pools
    }

    pub(crate) fn function_layout(&self, sig: &FunctionSignature) -> AlienResult<Arc<FunctionLayout>> {
        cached(&self.functions, sig, || classify(self.abi, sig))
    }

    pub(crate) fn callback_layout(&self, sig: &FunctionSignature) -> AlienResult<Arc<FunctionLayout>> {
        cached(&self.callbacks, sig, || classify_callback(self.abi, sig))
    }

    fn take_error(&self) -> Option<AlienError> {
        let mut errors = self.errors.lock();
        errors.extend(trampoline::global().take_stale());
        errors.pop_front()
    }
}

impl RelayOwner for Shared {
    fn is_owner_thread(&self) -> bool {
        current_thread_token() == self.owner
    }

    fn broker(&self) -> Option<&Broker> {
        self.broker.as_ref()
    }

    fn record_error(&self, err: AlienError) {
        debug!("relay error recorded: {err}");
        self.errors.lock().push_back(err);
    }
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub resident_pools: usize,
    pub temporary_pools: usize,
    pub reserved_trampolines: usize,
    pub cached_signatures: usize,
    pub async_calls: usize,
}

pub struct Instance {
    inner: Arc<Shared>,
    _marker: PhantomData<*const ()>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Instance").field(&self.inner).finish()
    }
}

impl Instance {
    /// Creates an instance calling through the host forward primitive.
    pub fn new(info: &AlienCreateInfo) -> AlienResult<Instance> {
        let settings = AlienSettings::resolve(info);
        Self::build(settings, Box::new(HostForwardCall), true)
    }

    /// Creates an instance with a custom forward primitive. Frames for any
    /// ABI are handed to it.
    pub fn with_forward(info: &AlienCreateInfo, forward: Box<dyn ForwardCall>) -> AlienResult<Instance> {
        let settings = AlienSettings::resolve(info);
        Self::build(settings, forward, false)
    }

    fn build(
        settings: AlienSettings,
        forward: Box<dyn ForwardCall>,
        host_forward: bool,
    ) -> AlienResult<Instance> {
        let abi = settings.abi.ok_or(AlienError::UnknownHost)?;
        let pools = PoolSet::new(&settings)?;
        let broker = settings.event_loop.then(Broker::new);
        debug!(
            "instance for {abi}: {} resident async pools, event loop {}",
            settings.resident_async_pools,
            if broker.is_some() { "on" } else { "off" }
        );
        let inner = Shared {
            abi,
            forward,
            host_forward,
            pools,
            broker,
            owner: current_thread_token(),
            functions: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            errors: Mutex::new(VecDeque::new()),
            async_calls: AtomicUsize::new(0),
            workers: AtomicUsize::new(0),
            persistent: Mutex::new(HashMap::new()),
            settings,
        };
        Ok(Instance {
            inner: Arc::new(inner),
            _marker: PhantomData,
        })
    }

    #[must_use]
    pub fn abi(&self) -> Abi {
        self.inner.abi
    }

    #[must_use]
    pub fn settings(&self) -> &AlienSettings {
        &self.inner.settings
    }

    /// Classifies `sig` once; later calls, failures included, come from
    /// the cache.
    pub fn analyse_function(&self, sig: &FunctionSignature) -> AlienResult<Arc<FunctionLayout>> {
        self.inner.function_layout(sig)
    }

    /// Opens a session on the synchronous pool. Calls from other threads
    /// get an async pool of their own.
    pub fn begin(&self, sig: &FunctionSignature) -> AlienResult<CallSession> {
        let layout = self.analyse_function(sig)?;
        let shared = &self.inner;
        let (pool, is_async) = if shared.is_owner_thread() {
            (shared.pools.sync().clone(), false)
        } else {
            (shared.pools.acquire_async()?, true)
        };
        Ok(CallSession::begin(shared.clone(), pool, is_async, sig.clone(), layout))
    }

    /// Calls `func` synchronously. Errors recorded by callbacks during
    /// the call are returned in place of the value.
    ///
    /// # Safety
    /// `func` must be a native function matching `sig`.
    pub unsafe fn call(&self, func: usize, sig: &FunctionSignature, args: &[Value]) -> AlienResult<Value> {
        let mut session = self.begin(sig)?;
        session.prepare(args)?;
        // SAFETY: forwarded from the caller
        let raw = unsafe { session.execute(func)? };
        let value = session.complete(raw);
        session.dispose();
        let value = value?;
        match self.take_pending_error() {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }

    /// Starts `func` on a worker thread. Callbacks it triggers run on
    /// this thread while it pumps or waits.
    ///
    /// # Safety
    /// `func` must be a native function matching `sig`, safe to call from
    /// another thread.
    pub unsafe fn call_async(
        &self,
        func: usize,
        sig: &FunctionSignature,
        args: &[Value],
    ) -> AlienResult<AsyncCall> {
        let shared = &self.inner;
        let layout = self.analyse_function(sig)?;
        let calls_back = sig
            .params
            .iter()
            .any(|p| p.ty.kind() == PrimitiveKind::Callback);
        if calls_back && shared.broker.is_none() {
            return Err(AlienError::ResourceExhaustion(Resource::EventLoop));
        }
        let admission = Admission::enter(shared)?;
        let pool = shared.pools.acquire_async()?;
        let mut session = CallSession::begin(shared.clone(), pool, true, sig.clone(), layout);
        session.prepare(args)?;

        let done: Arc<OneShot<Finished>> = Arc::new(OneShot::new());
        let tx = done.clone();
        let worker_shared = shared.clone();
        let n = shared.workers.fetch_add(1, Ordering::AcqRel) + 1;
        let thread = spawn_platform(format!("alien-async-{n}"), move || {
            // SAFETY: forwarded from `call_async`
            let raw = unsafe { session.execute(func) };
            tx.set((session, raw));
            if let Some(broker) = worker_shared.broker.as_ref() {
                broker.signal();
            }
        })
        .map_err(|err| {
            debug!("async worker could not start: {err}");
            AlienError::ResourceExhaustion(Resource::AsyncCalls)
        })?;
        trace!("async call {} started on alien-async-{n}", sig.name);
        Ok(AsyncCall {
            shared: shared.clone(),
            done,
            thread: Some(thread),
            _admission: admission,
        })
    }

    /// Publishes `func` as a native function pointer of callback type `ty`
    /// until [`Instance::unregister_callback`].
    pub fn register_callback(&self, ty: &TypeRef, func: Function) -> AlienResult<Handle> {
        let shared = &self.inner;
        let sig = ty
            .signature()
            .ok_or_else(|| AlienError::conversion(ArgPosition::Param(0), "callback type", ty.name()))?;
        let layout = shared.callback_layout(sig)?;
        let owner: Arc<dyn RelayOwner> = shared.clone();
        let owner: Weak<dyn RelayOwner> = Arc::downgrade(&owner);
        let slot = trampoline::global().reserve(Binding {
            owner,
            ty: ty.clone(),
            signature: sig.clone(),
            layout,
            func,
            pool: shared.pools.sync().clone(),
        })?;
        shared.persistent.lock().insert(slot.index, slot.generation);
        debug!("persistent callback {} on slot {}", ty.name(), slot.index);
        Ok(Handle::new(slot.address, Some(ty.clone())))
    }

    /// Returns false when `handle` is not a live persistent callback of
    /// this instance.
    pub fn unregister_callback(&self, handle: &Handle) -> bool {
        let Some(index) = thunks::index_of(handle.addr()) else {
            return false;
        };
        let Some(generation) = self.inner.persistent.lock().remove(&index) else {
            return false;
        };
        trampoline::global().release(index, generation)
    }

    /// Runs callbacks queued by other threads. Returns how many ran.
    pub fn pump(&self) -> usize {
        self.inner.broker.as_ref().map_or(0, Broker::pump)
    }

    /// Oldest error recorded by a relay, if any.
    pub fn take_pending_error(&self) -> Option<AlienError> {
        self.inner.take_error()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let shared = &self.inner;
        EngineStats {
            resident_pools: shared.pools.resident_count() + 1,
            temporary_pools: shared.pools.temporary_count(),
            reserved_trampolines: trampoline::global().reserved(),
            cached_signatures: shared.functions.lock().len() + shared.callbacks.lock().len(),
            async_calls: shared.async_calls.load(Ordering::Acquire),
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        let table = trampoline::global();
        for (index, generation) in self.inner.persistent.lock().drain() {
            table.release(index, generation);
        }
    }
}

/// Holds one of the `max_async_calls` slots.
struct Admission(Arc<Shared>);

impl Admission {
    fn enter(shared: &Arc<Shared>) -> AlienResult<Admission> {
        let max = shared.settings.max_async_calls;
        let admitted = shared
            .async_calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1));
        match admitted {
            Ok(_) => Ok(Admission(shared.clone())),
            Err(_) => Err(AlienError::ResourceExhaustion(Resource::AsyncCalls)),
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.0.async_calls.fetch_sub(1, Ordering::AcqRel);
    }
}

type Finished = (CallSession, AlienResult<RawResult>);

/// A forward call running on a worker thread.
pub struct AsyncCall {
    shared: Arc<Shared>,
    done: Arc<OneShot<Finished>>,
    thread: Option<PlatformThread<()>>,
    _admission: Admission,
}

impl std::fmt::Debug for AsyncCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCall")
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl AsyncCall {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_none() || self.done.is_set()
    }

    // Pumps callbacks until the worker hands its session back.
    fn finish(&mut self) -> Option<Finished> {
        self.thread.as_ref()?;
        let finished = loop {
            if let Some(finished) = self.done.try_take() {
                break finished;
            }
            match self.shared.broker.as_ref() {
                Some(broker) => {
                    broker.pump();
                    broker.wait(|| self.done.is_set());
                }
                None => break self.done.take(),
            }
        };
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            debug!("async worker panicked after handing back its session");
        }
        Some(finished)
    }

    /// Blocks until the call returns, running callbacks meanwhile. Must
    /// be called on the instance's thread.
    pub fn wait(mut self) -> AlienResult<Value> {
        let (mut session, raw) = self.finish().ok_or(AlienError::Unprepared)?;
        let value = raw.and_then(|raw| session.complete(raw));
        session.dispose();
        let value = value?;
        match self.shared.take_error() {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }
}

impl Drop for AsyncCall {
    fn drop(&mut self) {
        if let Some((mut session, _)) = self.finish() {
            session.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abi::tests::{prim, reg},
        frame::Frame,
    };
    use ctype::TypeDescriptor;

    struct Echo;

    // Returns the first integer argument register.
    impl ForwardCall for Echo {
        unsafe fn forward(&self, _func: usize, _layout: &FunctionLayout, frame: &Frame) -> RawResult {
            RawResult {
                gpr: [frame.gpr_word(0), 0],
                vec: [0; 4],
            }
        }
    }

    fn info(abi: Abi) -> AlienCreateInfo {
        AlienCreateInfo {
            abi: Some(abi),
            resident_async_pools: Some(1),
            max_async_calls: Some(1),
            sync_stack_size: Some(128 << 10),
            sync_heap_size: Some(64 << 10),
            async_stack_size: Some(128 << 10),
            async_heap_size: Some(64 << 10),
            ..AlienCreateInfo::default()
        }
    }

    #[test]
    fn classification_failures_are_cached() {
        let inst = Instance::with_forward(&info(Abi::X64SysV), Box::new(Echo)).expect("instance");
        let mut r = reg(Abi::X64SysV);
        let void = prim(&mut r, PrimitiveKind::Void);
        let bad = FunctionSignature::new("bad", void.clone()).param(void);
        assert!(inst.analyse_function(&bad).is_err());
        assert!(inst.analyse_function(&bad).is_err());
        assert_eq!(inst.stats().cached_signatures, 1);
    }

    #[test]
    fn synchronous_calls_round_trip_through_the_forwarder() {
        let inst = Instance::with_forward(&info(Abi::Arm64), Box::new(Echo)).expect("instance");
        let mut r = reg(Abi::Arm64);
        let i64_ = prim(&mut r, PrimitiveKind::Int64);
        let sig = FunctionSignature::new("id", i64_.clone()).param(i64_);
        // SAFETY: the forwarder never calls the address
        let value = unsafe { inst.call(0, &sig, &[Value::Number(-42.0)]) }.expect("call");
        assert_eq!(value, Value::Number(-42.0));
    }

    #[test]
    fn async_admission_is_bounded() {
        let inst = Instance::with_forward(&info(Abi::RiscV64), Box::new(Echo)).expect("instance");
        let mut r = reg(Abi::RiscV64);
        let i32_ = prim(&mut r, PrimitiveKind::Int32);
        let sig = FunctionSignature::new("id", i32_.clone()).param(i32_);
        // SAFETY: the forwarder never calls the address
        let first = unsafe { inst.call_async(0, &sig, &[Value::Number(7.0)]) }.expect("first");
        // SAFETY: as above
        let second = unsafe { inst.call_async(0, &sig, &[Value::Number(8.0)]) };
        assert!(matches!(
            second,
            Err(AlienError::ResourceExhaustion(Resource::AsyncCalls))
        ));
        assert_eq!(first.wait().expect("wait"), Value::Number(7.0));
        assert_eq!(inst.stats().async_calls, 0);
    }

    #[test]
    fn async_callbacks_need_an_event_loop() {
        let inst = Instance::with_forward(
            &AlienCreateInfo {
                event_loop: Some(false),
                ..info(Abi::X64SysV)
            },
            Box::new(Echo),
        )
        .expect("instance");
        let mut r = reg(Abi::X64SysV);
        let void = prim(&mut r, PrimitiveKind::Void);
        let proto = TypeDescriptor::prototype(FunctionSignature::new("cb", void.clone()));
        let cb = TypeDescriptor::callback(proto, Abi::X64SysV.data_model()).expect("callback");
        let sig = FunctionSignature::new("f", void).param(cb);
        // SAFETY: rejected before any native call
        let err = unsafe { inst.call_async(0, &sig, &[Value::Null]) }.expect_err("no loop");
        assert!(matches!(err, AlienError::ResourceExhaustion(Resource::EventLoop)));
    }

    #[test]
    fn persistent_callbacks_live_until_unregistered() {
        let inst = Instance::with_forward(&info(Abi::X64SysV), Box::new(Echo)).expect("instance");
        let mut r = reg(Abi::X64SysV);
        let i32_ = prim(&mut r, PrimitiveKind::Int32);
        let proto = TypeDescriptor::prototype(FunctionSignature::new("cb", i32_.clone()).param(i32_));
        let cb = TypeDescriptor::callback(proto, Abi::X64SysV.data_model()).expect("callback");
        let handle = inst
            .register_callback(&cb, Function::new(|_, args| Ok(args[0].clone())))
            .expect("register");
        assert_eq!(handle.ty().map(|t| t.id()), Some(cb.id()));
        assert!(inst.unregister_callback(&handle));
        assert!(!inst.unregister_callback(&handle));
    }

    #[test]
    fn unknown_host_without_abi_is_an_error() {
        if Abi::host().is_none() {
            assert!(matches!(
                Instance::new(&AlienCreateInfo::default()),
                Err(AlienError::UnknownHost)
            ));
        } else {
            assert!(Instance::new(&AlienCreateInfo::default()).is_ok());
        }
    }
}
