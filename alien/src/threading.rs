//! Thread identity and worker threads.
//!
//! Every thread that touches the engine gets a process-unique token on
//! first use. An instance remembers the token of the thread that created
//! it; callbacks arriving on any other thread are handed over to it.

use std::{
    cell::Cell,
    io,
    sync::atomic::{AtomicU64, Ordering},
    thread::{self, JoinHandle},
};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // 0 until the thread first asks for its token
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(0) };
}

fn next_token() -> u64 {
    NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed)
}

#[must_use]
pub fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|t| {
        if t.get() == 0 {
            t.set(next_token());
        }
        t.get()
    })
}

pub struct PlatformThread<T> {
    handle: Option<JoinHandle<T>>,
    token: u64,
}

impl<T> PlatformThread<T> {
    /// Token the thread runs under.
    #[must_use]
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn join(mut self) -> thread::Result<T> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Err(Box::new("thread handle already consumed")),
        }
    }
}

/// Spawns a named OS thread. The token is assigned up front so the caller
/// can recognise the thread before it has run any code.
pub fn spawn_platform<F, T>(name: String, f: F) -> io::Result<PlatformThread<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let token = next_token();
    let handle = thread::Builder::new().name(name).spawn(move || {
        THREAD_TOKEN.with(|t| t.set(token));
        f()
    })?;
    Ok(PlatformThread {
        handle: Some(handle),
        token,
    })
}
