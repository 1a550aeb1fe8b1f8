// SPDX-License-Identifier: MPL-2.0

//! Keyed wait queues.
//!
//! Threads that wait on one [`WaitQueue`] attach a key to their [`Waker`],
//! and a wake-up only considers the wakers whose key matches. This lets a
//! small, fixed set of queues serve an unbounded number of wait events.

use std::{
    collections::VecDeque,
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    thread::{self, Thread},
};

use spin::Mutex as SpinLock;

use crate::prelude::*;

/// A wait queue whose waiters are selected by key.
///
/// Exclusive waiters are queued at the back and non-exclusive waiters at the
/// front, so a wake-up that stops after one exclusive waiter still reaches
/// every non-exclusive one queued before it.
pub(crate) struct WaitQueue<K> {
    // A copy of `wakers.len()`, used for the lock-free fast path in `wake`.
    num_wakers: AtomicU32,
    wakers: SpinLock<VecDeque<KeyedWaker<K>>>,
}

struct KeyedWaker<K> {
    key: K,
    exclusive: bool,
    waker: Arc<Waker>,
}

impl<K: PartialEq> WaitQueue<K> {
    /// Creates a new, empty wait queue.
    pub(crate) const fn new() -> Self {
        WaitQueue {
            num_wakers: AtomicU32::new(0),
            wakers: SpinLock::new(VecDeque::new()),
        }
    }

    /// Wakes up the waiters whose key is `key`.
    ///
    /// All matching waiters are woken if `wake_all` is true. Otherwise every
    /// matching non-exclusive waiter ahead of the first matching exclusive
    /// waiter, and that exclusive waiter, are woken.
    ///
    /// Returns the number of waiters woken.
    pub(crate) fn wake(&self, key: &K, wake_all: bool) -> usize {
        if self.is_empty() {
            return 0;
        }

        let mut num_woken = 0;

        loop {
            let mut picked = Vec::new();
            let mut wakers = self.wakers.lock();
            let mut pos = 0;
            let mut reached_exclusive = false;
            while pos < wakers.len() {
                if wakers[pos].key != *key {
                    pos += 1;
                    continue;
                }
                let Some(keyed) = wakers.remove(pos) else {
                    break;
                };
                self.num_wakers.fetch_sub(1, Ordering::Release);
                let exclusive = keyed.exclusive;
                picked.push(keyed);
                if exclusive && !wake_all {
                    reached_exclusive = true;
                    break;
                }
            }
            drop(wakers);

            let mut exclusive_woken = !reached_exclusive;
            for keyed in picked {
                if keyed.waker.wake_up() {
                    num_woken += 1;
                    exclusive_woken |= keyed.exclusive;
                }
            }

            // A closed exclusive waker must not swallow the wake-up.
            if exclusive_woken {
                return num_woken;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.num_wakers.fetch_add(0, Ordering::Release) == 0
    }

    /// Enqueues `waker` under `key`.
    pub(crate) fn enqueue(&self, key: K, waker: Arc<Waker>, exclusive: bool) {
        let keyed = KeyedWaker {
            key,
            exclusive,
            waker,
        };
        let mut wakers = self.wakers.lock();
        if exclusive {
            wakers.push_back(keyed);
        } else {
            wakers.push_front(keyed);
        }
        self.num_wakers.fetch_add(1, Ordering::Acquire);
    }
}

/// A waiter that can put the current thread to sleep until it is woken up by
/// the associated [`Waker`].
///
/// By definition, a waiter belongs to the current thread, so it cannot be sent
/// to another thread and its reference cannot be shared with another thread.
pub(crate) struct Waiter {
    waker: Arc<Waker>,
    _not_send: PhantomData<*const ()>,
}

/// A waker that can wake up the associated [`Waiter`].
///
/// A waker can be created by calling [`Waiter::new_pair`]. This method creates an `Arc<Waker>`
/// that can be used across different threads.
pub(crate) struct Waker {
    has_woken: AtomicBool,
    thread: Thread,
}

impl Waiter {
    /// Creates a waiter and its associated [`Waker`].
    pub(crate) fn new_pair() -> (Self, Arc<Waker>) {
        let waker = Arc::new(Waker {
            has_woken: AtomicBool::new(false),
            thread: thread::current(),
        });
        let waiter = Self {
            waker: waker.clone(),
            _not_send: PhantomData,
        };
        (waiter, waker)
    }

    /// Waits until the waiter is woken up by calling [`Waker::wake_up`] on the associated
    /// [`Waker`].
    ///
    /// This method returns immediately if the waiter has been woken since the end of the last call
    /// to this method (or since the waiter was created, if this method has not been called
    /// before). Otherwise, it puts the current thread to sleep until the waiter is woken up.
    pub(crate) fn wait(&self) {
        self.waker.do_wait();
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        // When dropping the waiter, we need to close the waker to ensure that if the waiter is
        // woken up later, the wake-up is reported as lost.
        self.waker.close();
    }
}

impl Waker {
    /// Wakes up the associated [`Waiter`].
    ///
    /// This method returns `true` if the waiter is woken by this call. It returns `false` if the
    /// waiter has already been woken by a previous call to the method, or if the waiter has been
    /// dropped.
    pub(crate) fn wake_up(&self) -> bool {
        if self.has_woken.swap(true, Ordering::Release) {
            return false;
        }
        self.thread.unpark();

        true
    }

    fn do_wait(&self) {
        while !self.has_woken.swap(false, Ordering::Acquire) {
            thread::park();
        }
    }

    fn close(&self) {
        let _ = self.has_woken.swap(true, Ordering::Acquire);
    }
}
