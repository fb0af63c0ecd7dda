use once_cell::sync::OnceCell;
use std::{
    collections::{btree_map::Entry, BTreeMap},
    mem::drop,
    sync::atomic::{AtomicBool, Ordering},
    sync::{Arc, Mutex},
    thread::{self, Thread},
    time::Instant,
};

/// Outcome of a [`WaitQueue::wait`] call.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitState {
    /// The recheck predicate no longer held, so the thread never slept.
    Skipped,
    /// The deadline elapsed before any wake arrived.
    TimedOut,
    /// The thread slept and was released by a wake on its address.
    Woken,
}

impl WaitState {
    /// Returns true unless the wait ended in a timeout.
    ///
    /// A `Skipped` wait counts as woken: the condition had already changed
    /// by the time the queue validated it.
    #[inline]
    pub fn was_woken(self) -> bool {
        self != WaitState::TimedOut
    }
}

/// An address-keyed blocking and waking service.
///
/// Addresses are opaque correlation keys; a single service instance may be
/// shared by unrelated primitives as long as their keys are distinct. The
/// service never interprets the address beyond routing waits and wakes.
///
/// `wait` may only suspend the caller if `validate` still returns true once
/// the caller is registered on `address` (checked under the queue lock, so a
/// wake that races with registration is never lost). `before_sleep` is called
/// exactly once, after the decision to sleep and before the thread suspends;
/// it is skipped entirely when validation fails.
pub trait WaitQueue: Sync {
    fn wait(
        &self,
        address: usize,
        validate: impl FnOnce() -> bool,
        before_sleep: impl FnOnce(),
        deadline: Option<Instant>,
    ) -> WaitState;

    /// Wakes every thread currently waiting on `address`. No-op if none are.
    fn wake_all(&self, address: usize);
}

struct Waiter {
    thread: Thread,
    notified: AtomicBool,
}

impl Waiter {
    fn with<F>(f: impl FnOnce(&Arc<Self>) -> F) -> F {
        thread_local!(static TLS_WAITER: Arc<Waiter> = Arc::new(Waiter {
            thread: thread::current(),
            notified: AtomicBool::new(false),
        }));
        TLS_WAITER.with(f)
    }

    fn wait(&self, deadline: Option<Instant>) -> bool {
        loop {
            if self.notified.load(Ordering::Acquire) {
                return true;
            }

            match deadline {
                None => thread::park(),
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(timeout) => thread::park_timeout(timeout),
                    None => return false,
                },
            }
        }
    }

    fn wake(&self) {
        // Release barrier ensures the dequeue happens before the wait() thread returns.
        self.notified.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

type WaitList = Vec<Arc<Waiter>>;

#[derive(Default)]
struct Bucket {
    waiting: Mutex<BTreeMap<usize, WaitList>>,
}

impl Bucket {
    fn from(address: usize) -> &'static Bucket {
        const NUM_BUCKETS: usize = 64;
        static BUCKETS: OnceCell<Box<[Bucket]>> = OnceCell::new();
        let buckets = BUCKETS.get_or_init(|| (0..NUM_BUCKETS).map(|_| Bucket::default()).collect());

        #[cfg(target_pointer_width = "64")]
        const HASH_MULT: usize = 0x9E3779B97F4A7C15;
        #[cfg(target_pointer_width = "32")]
        const HASH_MULT: usize = 0x9E3779B9;

        let hash = address.wrapping_mul(HASH_MULT);
        let index = hash % NUM_BUCKETS;
        &buckets[index]
    }
}

/// Handle to the process-wide wait queue.
///
/// All handles refer to the same bucketed wait lists, so waits and wakes
/// correlate purely through their address keys.
#[derive(Copy, Clone, Default, Debug)]
pub struct GlobalWaitQueue;

impl WaitQueue for GlobalWaitQueue {
    fn wait(
        &self,
        address: usize,
        validate: impl FnOnce() -> bool,
        before_sleep: impl FnOnce(),
        deadline: Option<Instant>,
    ) -> WaitState {
        let bucket = Bucket::from(address);
        let mut waiting = bucket.waiting.lock().unwrap();

        if !validate() {
            return WaitState::Skipped;
        }

        Waiter::with(|waiter| {
            waiter.notified.store(false, Ordering::Relaxed);
            waiting.entry(address).or_default().push(waiter.clone());
            drop(waiting);

            before_sleep();

            if waiter.wait(deadline) {
                return WaitState::Woken;
            }

            // Timed out: unlink ourselves so a later wake_all can't touch us.
            let mut waiting = bucket.waiting.lock().unwrap();
            let removed = match waiting.entry(address) {
                Entry::Vacant(_) => None,
                Entry::Occupied(mut entry) => {
                    let index = entry.get().iter().position(|w| Arc::ptr_eq(w, waiter));
                    let removed = index.map(|i| entry.get_mut().swap_remove(i));
                    if entry.get().is_empty() {
                        entry.remove();
                    }
                    removed
                }
            };
            drop(waiting);

            match removed {
                Some(_removed) => WaitState::TimedOut,
                None => {
                    // A racing wake_all already dequeued us; its unpark is
                    // on the way, so finish the wake instead of timing out.
                    waiter.wait(None);
                    WaitState::Woken
                }
            }
        })
    }

    fn wake_all(&self, address: usize) {
        let bucket = Bucket::from(address);
        let mut waiting = bucket.waiting.lock().unwrap();
        let woken = waiting.remove(&address);
        drop(waiting);

        for waiter in woken.unwrap_or_default() {
            waiter.wake();
        }
    }
}
