use super::wait_queue::{GlobalWaitQueue, WaitQueue, WaitState};
use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

const PARKED: usize = 0b1;
const GENERATION: usize = !PARKED;
const GENERATION_ONE: usize = PARKED + 1;

/// Snapshot of an [`EventCount`] generation.
///
/// Produced by [`EventCount::prepare_wait`] and consumed by one of the wait
/// calls on the same `EventCount`. Tokens from other instances are
/// meaningless (not memory-unsafe, just logically wrong) and this is a
/// caller contract rather than something checked at runtime.
#[derive(Copy, Clone, Debug)]
pub struct EventCountToken(usize);

impl Default for EventCountToken {
    fn default() -> Self {
        // Real tokens always have the parked bit masked off.
        Self(PARKED)
    }
}

impl EventCountToken {
    /// Returns true only for tokens produced by `prepare_wait`.
    /// A default-constructed token is an unarmed sentinel.
    #[inline]
    pub fn is_armed(self) -> bool {
        self.0 & PARKED == 0
    }
}

/// A generation-counted event notification primitive.
///
/// An event count lets threads block until "something changed" without losing
/// a notification that races with their own check of the condition. Waiters
/// follow a prepare/check/wait pattern: snapshot the generation with
/// [`prepare_wait`](EventCount::prepare_wait), re-check the condition they
/// actually care about, and only then call [`wait`](EventCount::wait) with
/// the snapshot. Any [`notify`](EventCount::notify) after the snapshot bumps
/// the generation, so the wait either returns on its fast-path comparison or
/// is woken from the wait queue. Notifications are broadcast: one effective
/// `notify` releases every waiter that prepared before it.
///
/// # State table
///
///  PARKED | Generation | Description
///    0    |     g      | Nothing has prepared to wait since the last
///         |            | effective notify. notify() is a no-op here.
/// --------+------------+----------------------------------------------------
///    1    |     g      | At least one thread snapshotted generation `g` and
///         |            | may be about to block. The next notify() moves to
///         |            | (0, g + 1) and wakes the wait queue.
///
/// The generation only ever increases; it may wrap after `usize::MAX / 2`
/// effective notifies, which is an accepted limitation and not special-cased.
///
/// Dropping an `EventCount` while a thread is blocked in a wait call is
/// undefined behavior, the same contract as a condition variable.
///
/// # Examples
///
/// ```
/// use uevent::EventCount;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::thread;
///
/// let count = Arc::new(EventCount::new());
/// let ready = Arc::new(AtomicBool::new(false));
///
/// let waiter = {
///     let count = count.clone();
///     let ready = ready.clone();
///     thread::spawn(move || loop {
///         let token = count.prepare_wait();
///         if ready.load(Ordering::Acquire) {
///             break;
///         }
///         count.wait(token);
///     })
/// };
///
/// ready.store(true, Ordering::Release);
/// count.notify();
/// waiter.join().unwrap();
/// ```
pub struct EventCount<Q: WaitQueue = GlobalWaitQueue> {
    state: AtomicUsize,
    queue: Q,
}

impl EventCount {
    /// Creates an event count at generation zero, backed by the
    /// process-wide wait queue.
    pub const fn new() -> Self {
        Self::with_queue(GlobalWaitQueue)
    }
}

impl<Q: WaitQueue + Default> Default for EventCount<Q> {
    fn default() -> Self {
        Self::with_queue(Q::default())
    }
}

impl<Q: WaitQueue> fmt::Debug for EventCount<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("EventCount")
            .field("generation", &(state >> 1))
            .field("parked", &(state & PARKED != 0))
            .finish()
    }
}

impl<Q: WaitQueue> EventCount<Q> {
    /// Creates an event count backed by a caller-provided wait queue.
    pub const fn with_queue(queue: Q) -> Self {
        Self {
            state: AtomicUsize::new(0),
            queue,
        }
    }

    /// The key this instance waits and wakes on. Only used as an opaque
    /// correlation token by the wait queue.
    #[inline]
    fn address(&self) -> usize {
        &self.state as *const AtomicUsize as usize
    }

    /// Returns true once the generation has moved past the token's snapshot.
    /// Acquire barrier ensures the notify that bumped it happens before we return.
    #[inline]
    fn poll(&self, token: EventCountToken) -> bool {
        self.state.load(Ordering::Acquire) & GENERATION != token.0
    }

    /// Snapshots the current generation and asserts the parked bit.
    ///
    /// Setting the parked bit *before* the caller re-checks its condition is
    /// what closes the lost-wakeup race: any notify from here on either shows
    /// up in the wait call's generation comparison or wakes the wait queue.
    /// Never blocks.
    #[inline]
    pub fn prepare_wait(&self) -> EventCountToken {
        let state = self.state.fetch_or(PARKED, Ordering::AcqRel);
        EventCountToken(state & GENERATION)
    }

    /// Blocks until the generation no longer matches the token's snapshot.
    ///
    /// Returns immediately if a notify already fired since `prepare_wait`.
    /// A token may be waited on at most once.
    #[inline]
    pub fn wait(&self, token: EventCountToken) {
        debug_assert!(token.is_armed(), "waiting with a token not from prepare_wait");
        while !self.poll(token) {
            self.park(token, None);
        }
    }

    /// Like [`wait`](Self::wait), but gives up at `deadline`.
    ///
    /// Returns true if the generation changed before the deadline and false
    /// otherwise. Timing out leaves the event count untouched: a still-set
    /// parked bit is simply discovered by a future notify.
    #[inline]
    pub fn wait_until(&self, token: EventCountToken, deadline: Instant) -> bool {
        debug_assert!(token.is_armed(), "waiting with a token not from prepare_wait");
        loop {
            if self.poll(token) {
                return true;
            }
            if let WaitState::TimedOut = self.park(token, Some(deadline)) {
                return self.poll(token);
            }
        }
    }

    /// Like [`wait_until`](Self::wait_until), with a relative timeout.
    #[inline]
    pub fn wait_for(&self, token: EventCountToken, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(token, deadline),
            None => {
                self.wait(token);
                true
            }
        }
    }

    #[cold]
    fn park(&self, token: EventCountToken, deadline: Option<Instant>) -> WaitState {
        self.queue
            .wait(self.address(), || !self.poll(token), || {}, deadline)
    }

    /// Wakes every thread that prepared to wait since the last effective
    /// notify, bumping the generation exactly once.
    ///
    /// When the parked bit is clear this is one atomic load and never touches
    /// the wait queue, which keeps the common notify-with-no-waiters path
    /// cheap. Never blocks.
    #[inline]
    pub fn notify(&self) {
        let state = self.notify_state();
        if state & PARKED != 0 {
            self.notify_slow(state);
        }
    }

    #[cold]
    fn notify_slow(&self, mut state: usize) {
        while state & PARKED != 0 {
            // Bump the generation and reclaim the parked bit in one step.
            // Release barrier ensures the condition writes that prompted this
            // notify happen before a waiter observes the new generation.
            let new_state = state.wrapping_add(GENERATION_ONE) & GENERATION;
            match self.state.compare_exchange_weak(
                state,
                new_state,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return self.queue.wake_all(self.address()),
                Err(e) => state = e,
            }
        }
    }

    /// Reads the counter for notify()'s parked-bit check.
    ///
    /// x86 keeps read-modify-writes totally ordered, so the fetch_or done by
    /// a racing prepare_wait is already visible to a plain load here.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[inline]
    fn notify_state(&self) -> usize {
        self.state.load(Ordering::Relaxed)
    }

    /// Weakly-ordered targets need a store-load fence before the load or a
    /// concurrently in-flight prepare_wait's parked bit can go unseen,
    /// reintroducing the lost-wakeup race. A zero fetch_add is serializing
    /// and doubles as the load.
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    #[inline]
    fn notify_state(&self) -> usize {
        self.state.fetch_add(0, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::{EventCount, EventCountToken, GlobalWaitQueue, WaitQueue, WaitState};
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        sync::{mpsc::channel, Arc},
        thread,
        time::{Duration, Instant},
    };

    /// Wait queue double that counts how often the event count actually
    /// reaches the service.
    #[derive(Default)]
    struct CountingQueue {
        waits: AtomicUsize,
        wakes: AtomicUsize,
        queue: GlobalWaitQueue,
    }

    impl WaitQueue for CountingQueue {
        fn wait(
            &self,
            address: usize,
            validate: impl FnOnce() -> bool,
            before_sleep: impl FnOnce(),
            deadline: Option<Instant>,
        ) -> WaitState {
            self.waits.fetch_add(1, Ordering::Relaxed);
            self.queue.wait(address, validate, before_sleep, deadline)
        }

        fn wake_all(&self, address: usize) {
            self.wakes.fetch_add(1, Ordering::Relaxed);
            self.queue.wake_all(address)
        }
    }

    #[test]
    fn smoke() {
        let count = EventCount::new();
        count.notify();
        count.notify();
    }

    #[test]
    fn default_token_is_unarmed() {
        assert!(!EventCountToken::default().is_armed());
    }

    #[test]
    fn prepare_then_notify_then_wait_returns_immediately() {
        let count = EventCount::with_queue(CountingQueue::default());

        let token = count.prepare_wait();
        assert!(token.is_armed());

        count.notify();
        count.wait(token);

        // The notify landed between prepare_wait and wait, so the fast path
        // must return without ever reaching the wait queue.
        assert_eq!(count.queue.waits.load(Ordering::Relaxed), 0);
        assert_eq!(count.queue.wakes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn notify_without_waiters_skips_the_queue() {
        let count = EventCount::with_queue(CountingQueue::default());

        count.notify();
        count.notify();

        assert_eq!(count.queue.wakes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn repeated_notify_bumps_the_generation_once() {
        let count = EventCount::with_queue(CountingQueue::default());

        let token = count.prepare_wait();
        count.notify();
        count.notify();

        assert_eq!(count.queue.wakes.load(Ordering::Relaxed), 1);
        count.wait(token);
        assert_eq!(count.queue.waits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn no_lost_wakeup() {
        const WAITERS: usize = 8;

        let count = Arc::new(EventCount::new());
        let ready = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel();

        let threads = (0..WAITERS)
            .map(|_| {
                let count = count.clone();
                let ready = ready.clone();
                let tx = tx.clone();
                thread::spawn(move || loop {
                    let token = count.prepare_wait();
                    if ready.load(Ordering::Acquire) {
                        return;
                    }
                    let _ = tx.send(());
                    thread::yield_now();
                    count.wait(token);
                })
            })
            .collect::<Vec<_>>();

        // Every waiter has committed to a token before the notify fires.
        for _ in 0..WAITERS {
            rx.recv().unwrap();
        }
        thread::sleep(Duration::from_millis(10));
        ready.store(true, Ordering::Release);
        count.notify();

        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn single_notify_releases_all_prepared_waiters() {
        const WAITERS: usize = 8;

        let count = Arc::new(EventCount::new());
        let (tx, rx) = channel();

        let threads = (0..WAITERS)
            .map(|_| {
                let count = count.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let token = count.prepare_wait();
                    tx.send(()).unwrap();
                    count.wait(token);
                })
            })
            .collect::<Vec<_>>();

        // Every token predates the notify, so one broadcast must release all
        // of them whether they managed to park yet or not.
        for _ in 0..WAITERS {
            rx.recv().unwrap();
        }
        count.notify();

        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn wait_for_times_out_and_leaves_the_count_usable() {
        let count = Arc::new(EventCount::new());

        let token = count.prepare_wait();
        let started = Instant::now();
        assert!(!count.wait_for(token, Duration::from_millis(100)));
        assert!(started.elapsed() >= Duration::from_millis(100));

        // The parked bit left behind by the timed-out wait is discovered by
        // this notify, and a fresh prepare/wait cycle still works.
        let (tx, rx) = channel();
        let waiter = {
            let count = count.clone();
            thread::spawn(move || {
                let token = count.prepare_wait();
                tx.send(()).unwrap();
                count.wait(token);
            })
        };

        rx.recv().unwrap();
        count.notify();
        waiter.join().unwrap();
    }

    #[test]
    fn wait_until_with_elapsed_deadline_returns_false() {
        let count = EventCount::new();
        let token = count.prepare_wait();
        assert!(!count.wait_until(token, Instant::now()));
    }

    #[test]
    fn wait_until_reports_a_racing_notify_as_success() {
        let count = EventCount::new();
        let token = count.prepare_wait();
        count.notify();
        assert!(count.wait_until(token, Instant::now()));
    }

    #[test]
    fn notify_on_one_count_ignores_another() {
        let woken = EventCount::new();
        let ignored = EventCount::new();

        let token = ignored.prepare_wait();
        woken.prepare_wait();
        woken.notify();

        assert!(!ignored.wait_for(token, Duration::from_millis(50)));
    }

    #[test]
    fn debug_reports_state() {
        let count = EventCount::new();
        assert_eq!(
            format!("{:?}", count),
            "EventCount { generation: 0, parked: false }"
        );

        count.prepare_wait();
        count.notify();
        assert_eq!(
            format!("{:?}", count),
            "EventCount { generation: 1, parked: false }"
        );
    }
}
