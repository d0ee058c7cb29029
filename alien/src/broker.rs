//! Hand-off of callbacks to the owning thread.
//!
//! A worker that receives a native callback pushes a job and blocks on a
//! [`OneShot`] until the owning thread has run it. The owner drains the
//! queue in FIFO order with [`Broker::pump`], or while it waits for an
//! async call.

use std::{collections::VecDeque, sync::Arc};

use log::trace;
use parking_lot::{Condvar, Mutex};

pub type Job = Box<dyn FnOnce() + Send>;

/// A value handed from one thread to another exactly once.
#[derive(Debug)]
pub struct OneShot<T> {
    value: Mutex<Option<T>>,
    cv: Condvar,
}

impl<T> Default for OneShot<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
            cv: Condvar::new(),
        }
    }
}

impl<T> OneShot<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: T) {
        let mut slot = self.value.lock();
        *slot = Some(value);
        self.cv.notify_all();
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }

    pub fn try_take(&self) -> Option<T> {
        self.value.lock().take()
    }

    /// Blocks until a value is set.
    pub fn take(&self) -> T {
        let mut slot = self.value.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.cv.wait(&mut slot);
        }
    }
}

#[derive(Default)]
pub struct Broker {
    queue: Mutex<VecDeque<Job>>,
    ready: Condvar,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

impl Broker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Job) {
        let mut queue = self.queue.lock();
        queue.push_back(job);
        self.ready.notify_all();
    }

    /// Runs `f` on the owning thread and blocks until it returns.
    pub fn call<T, F>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let done = Arc::new(OneShot::new());
        let tx = done.clone();
        self.push(Box::new(move || tx.set(f())));
        trace!("waiting for the owner thread");
        done.take()
    }

    /// Runs every queued job. Returns how many ran.
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.queue.lock().pop_front();
            let Some(job) = job else {
                return ran;
            };
            job();
            ran += 1;
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Wakes a thread blocked in [`Broker::wait`].
    pub fn signal(&self) {
        let _queue = self.queue.lock();
        self.ready.notify_all();
    }

    /// Blocks until a job is queued or `done` holds. `done` is checked
    /// under the queue lock, so a [`Broker::signal`] issued after the
    /// condition became true is never lost.
    pub fn wait(&self, done: impl Fn() -> bool) {
        let mut queue = self.queue.lock();
        while queue.is_empty() && !done() {
            self.ready.wait(&mut queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
    };

    #[test]
    fn jobs_run_on_the_pumping_thread() {
        let broker = Arc::new(Broker::new());
        let here = thread::current().id();
        let remote = broker.clone();
        let worker = thread::spawn(move || remote.call(move || thread::current().id()));
        while broker.pending() == 0 {
            broker.wait(|| false);
        }
        assert_eq!(broker.pump(), 1);
        assert_eq!(worker.join().expect("join"), here);
    }

    #[test]
    fn every_waiting_worker_is_served() {
        let broker = Arc::new(Broker::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut workers = Vec::new();
        for i in 0..4 {
            let remote = broker.clone();
            let order = order.clone();
            workers.push(thread::spawn(move || {
                remote.call(move || order.lock().push(i));
            }));
        }
        let mut ran = 0;
        while ran < 4 {
            broker.wait(|| false);
            ran += broker.pump();
        }
        for worker in workers {
            worker.join().expect("join");
        }
        let mut seen = order.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn signal_wakes_a_waiter() {
        let broker = Arc::new(Broker::new());
        let flag = Arc::new(AtomicBool::new(false));
        let (remote, remote_flag) = (broker.clone(), flag.clone());
        let setter = thread::spawn(move || {
            remote_flag.store(true, Ordering::SeqCst);
            remote.signal();
        });
        broker.wait(|| flag.load(Ordering::SeqCst));
        setter.join().expect("join");
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn one_shot_hands_over_once() {
        let shot = Arc::new(OneShot::new());
        let tx = shot.clone();
        thread::spawn(move || tx.set(5)).join().expect("join");
        assert!(shot.is_set());
        assert_eq!(shot.take(), 5);
        assert_eq!(shot.try_take(), None);
    }
}
