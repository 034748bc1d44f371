//! The event loop.
//!
//! strand owns exactly one loop thread per [`EventLoop`]. Every piece of
//! transport state (endpoints, connections, streams, reassembly buffers)
//! lives on that thread and is only ever touched from it; the thread-safe
//! surface is the job queue ([`call`](EventLoop::call) /
//! [`call_soon`](EventLoop::call_soon) /
//! [`call_get`](EventLoop::call_get)) and the timer handles. The job
//! queue mutex is the only lock taken in steady state.
//!
//! The loop thread parks in `mio::Poll::poll` with a timeout derived from
//! the nearest timer deadline; a `mio::Waker` doubles as the job-queue
//! wakeup. The queue is swap-drained: the whole queue is moved out under
//! the lock and executed after release, so jobs may post further jobs
//! without re-entering the lock.

use std::cell::Cell;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::cmp::Reverse;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use slab::Slab;
use tracing::{debug, error, trace, warn};

use crate::endpoint::EndpointState;
use crate::error::Error;

/// A queued unit of work. Runs to completion on the loop thread.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// A timer callback. Fired on the loop thread, outside any state borrow.
pub(crate) type TimerCb = Box<dyn FnMut() + Send + 'static>;

const WAKER_TOKEN: mio::Token = mio::Token(usize::MAX);

const MODE_RUN: u8 = 0;
const MODE_GRACEFUL: u8 = 1;
const MODE_IMMEDIATE: u8 = 2;

// ── Scoped reactor access ───────────────────────────────────────────

thread_local! {
    /// Raw pointer to the running reactor, set for the lifetime of the
    /// loop thread's run function.
    ///
    /// Safe because the pointer is only installed on the loop thread,
    /// the reactor outlives the run loop, and [`with_reactor`] guards
    /// against re-entrant borrows with `BORROWED`.
    static CURRENT: Cell<*mut Reactor> = const { Cell::new(std::ptr::null_mut()) };
    static BORROWED: Cell<bool> = const { Cell::new(false) };
}

/// Borrow the loop-thread reactor. Panics off the loop thread or when the
/// reactor is already borrowed (application callbacks always run outside
/// the borrow, so a panic here is a bug in strand, not the application).
pub(crate) fn with_reactor<R>(f: impl FnOnce(&mut Reactor) -> R) -> R {
    let ptr = CURRENT.with(|c| c.get());
    assert!(!ptr.is_null(), "not on an event loop thread");
    assert!(
        !BORROWED.with(|b| b.replace(true)),
        "reactor re-entered while borrowed"
    );
    struct Unborrow;
    impl Drop for Unborrow {
        fn drop(&mut self) {
            BORROWED.with(|b| b.set(false));
        }
    }
    let _reset = Unborrow;
    f(unsafe { &mut *ptr })
}

struct ReactorGuard;

impl ReactorGuard {
    fn install(reactor: &mut Reactor) -> Self {
        CURRENT.with(|c| c.set(reactor as *mut Reactor));
        ReactorGuard
    }
}

impl Drop for ReactorGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(std::ptr::null_mut()));
    }
}

// ── Shared loop state ───────────────────────────────────────────────

pub(crate) struct LoopShared {
    waker: mio::Waker,
    jobs: Mutex<VecDeque<Job>>,
    /// Accepting jobs. Cleared when the loop thread exits.
    running: AtomicBool,
    mode: AtomicU8,
    loop_thread: OnceLock<thread::ThreadId>,
    /// Live tickers, so shutdown can stop them after the join.
    tickers: Mutex<Vec<std::sync::Weak<TickerInner>>>,
}

impl LoopShared {
    pub(crate) fn in_loop(&self) -> bool {
        self.loop_thread.get() == Some(&thread::current().id())
    }

    /// Enqueue a job and wake the loop. Returns false when the loop is no
    /// longer accepting work.
    pub(crate) fn post(&self, job: Job) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut q = self.jobs.lock().unwrap();
            q.push_back(job);
        }
        if let Err(e) = self.waker.wake() {
            warn!("loop waker failed: {e}");
        }
        true
    }
}

// ── Public handle ───────────────────────────────────────────────────

/// Handle to a running event loop. Cheap to clone; all clones refer to
/// the same loop thread.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
    thread: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl EventLoop {
    /// Spawn a new loop thread.
    pub fn new() -> Result<Self, Error> {
        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(LoopShared {
            waker,
            jobs: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
            mode: AtomicU8::new(MODE_RUN),
            loop_thread: OnceLock::new(),
            tickers: Mutex::new(Vec::new()),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("strand-loop".to_string())
            .spawn(move || run(thread_shared, poll))
            .map_err(Error::Io)?;

        Ok(Self {
            shared,
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// True when called from this loop's thread.
    pub fn in_loop(&self) -> bool {
        self.shared.in_loop()
    }

    /// Run `f` immediately when already on the loop thread, otherwise
    /// enqueue it.
    pub fn call(&self, f: impl FnOnce() + Send + 'static) {
        if self.in_loop() {
            f();
        } else {
            self.call_soon(f);
        }
    }

    /// Unconditionally enqueue `f` and wake the loop. Jobs from the same
    /// submitter run in FIFO order. Work posted after shutdown is
    /// dropped.
    pub fn call_soon(&self, f: impl FnOnce() + Send + 'static) {
        if !self.shared.post(Box::new(f)) {
            debug!("job dropped: event loop is shut down");
        }
    }

    /// Run `f` on the loop thread and wait for its result. Runs inline
    /// when already on the loop thread (a blocking wait there would
    /// deadlock). Errors reaching the caller are exactly those `f`
    /// returns; a shut-down loop yields [`Error::LoopClosed`].
    pub fn call_get<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.in_loop() {
            return Ok(f());
        }
        let (tx, rx) = mpsc::sync_channel(1);
        let posted = self.shared.post(Box::new(move || {
            let _ = tx.send(f());
        }));
        if !posted {
            return Err(Error::LoopClosed);
        }
        rx.recv().map_err(|_| Error::LoopClosed)
    }

    /// Run `f` once after `delay`.
    pub fn call_later(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let mut f = Some(f);
        self.call(move || {
            let mut f = f.take();
            with_reactor(|r| {
                let id = r.timers.create(
                    Box::new(move || {
                        if let Some(f) = f.take() {
                            f();
                        }
                    }),
                    None,
                    false,
                    None,
                );
                r.timers.arm(id, Instant::now() + delay);
            });
        });
    }

    /// Run `f` every `interval`, starting now. The returned [`Ticker`]
    /// pauses and resumes the repetition; dropping it cancels the timer.
    pub fn call_every(&self, interval: Duration, f: impl FnMut() + Send + 'static) -> Ticker {
        let running = Arc::new(AtomicBool::new(true));
        let inner = Arc::new(TickerInner {
            shared: self.shared.clone(),
            id: OnceLock::new(),
            running: running.clone(),
        });
        self.shared
            .tickers
            .lock()
            .unwrap()
            .push(Arc::downgrade(&inner));

        let setup = inner.clone();
        self.call(move || {
            with_reactor(|r| {
                let id = r.timers.create(Box::new(f), Some(interval), true, Some(running));
                setup.id.set(id).ok();
                r.timers.arm(id, Instant::now() + interval);
            });
        });

        Ticker { inner }
    }

    /// Create a [`Trigger`]: fires `f` up to `n` times back-to-back, then
    /// cools down for `cooldown` and resumes, until halted.
    pub fn trigger(
        &self,
        cooldown: Duration,
        n: usize,
        f: impl FnMut() + Send + 'static,
        start_immediately: bool,
    ) -> Trigger {
        Trigger::new(self, cooldown, n, f, start_immediately)
    }

    /// Shut the loop down and join its thread.
    ///
    /// `immediate` breaks the loop without draining; otherwise queued
    /// jobs run first. Either way all outstanding tickers are stopped
    /// after the join. Panics when called from the loop thread.
    pub fn shutdown(&self, immediate: bool) {
        assert!(
            !self.in_loop(),
            "EventLoop::shutdown called from the loop thread"
        );
        self.shared.mode.store(
            if immediate { MODE_IMMEDIATE } else { MODE_GRACEFUL },
            Ordering::Release,
        );
        let _ = self.shared.waker.wake();

        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("loop thread panicked");
            }
        }

        let tickers = std::mem::take(&mut *self.shared.tickers.lock().unwrap());
        for ticker in tickers {
            if let Some(t) = ticker.upgrade() {
                t.running.store(false, Ordering::Release);
            }
        }
    }

}

// ── Run loop ────────────────────────────────────────────────────────

fn run(shared: Arc<LoopShared>, poll: mio::Poll) {
    shared.loop_thread.set(thread::current().id()).ok();
    debug!("event loop starting");

    let mut reactor = Reactor {
        shared: shared.clone(),
        poll,
        events: mio::Events::with_capacity(256),
        timers: Timers::default(),
        endpoints: Slab::new(),
    };
    let _guard = ReactorGuard::install(&mut reactor);

    loop {
        match shared.mode.load(Ordering::Acquire) {
            MODE_IMMEDIATE => break,
            MODE_GRACEFUL => {
                // Drain to quiescence, including jobs the drained jobs
                // post (close packets flush this way).
                loop {
                    let jobs = {
                        let mut q = shared.jobs.lock().unwrap();
                        std::mem::take(&mut *q)
                    };
                    if jobs.is_empty() {
                        break;
                    }
                    for job in jobs {
                        job();
                    }
                }
                break;
            }
            _ => {}
        }

        let timeout = with_reactor(|r| r.timers.next_timeout(Instant::now()));
        let ready = with_reactor(|r| r.poll_io(timeout));

        drain_jobs(&shared);

        for (endpoint, readable, writable) in ready {
            crate::endpoint::on_socket_event(endpoint, readable, writable);
        }

        loop {
            let now = Instant::now();
            let due = with_reactor(|r| r.timers.pop_due(now));
            match due {
                Some((id, mut cb)) => {
                    cb();
                    with_reactor(|r| r.timers.restore(id, cb));
                }
                None => break,
            }
        }
    }

    shared.running.store(false, Ordering::Release);
    // Unblock any call_get waiters: their jobs are dropped, which drops
    // the result senders and surfaces LoopClosed on the caller side.
    shared.jobs.lock().unwrap().clear();
    debug!("event loop finished");
}

fn drain_jobs(shared: &Arc<LoopShared>) {
    trace!("processing job queue");
    let jobs = {
        let mut q = shared.jobs.lock().unwrap();
        std::mem::take(&mut *q)
    };
    for job in jobs {
        job();
    }
}

// ── Reactor ─────────────────────────────────────────────────────────

/// Loop-thread state: the poller, the timer wheel and every endpoint.
pub(crate) struct Reactor {
    pub(crate) shared: Arc<LoopShared>,
    poll: mio::Poll,
    events: mio::Events,
    pub(crate) timers: Timers,
    pub(crate) endpoints: Slab<EndpointState>,
}

impl Reactor {
    fn poll_io(&mut self, timeout: Option<Duration>) -> Vec<(usize, bool, bool)> {
        self.events.clear();
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                error!("poll failed: {e}");
            }
        }
        self.events
            .iter()
            .filter(|ev| ev.token() != WAKER_TOKEN)
            .map(|ev| (ev.token().0, ev.is_readable(), ev.is_writable()))
            .collect()
    }

    pub(crate) fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }
}

// ── Timers ──────────────────────────────────────────────────────────

struct TimerEntry {
    /// Taken while firing so the callback can re-enter the reactor.
    cb: Option<TimerCb>,
    /// `Some` = repeating; re-armed from the fire deadline.
    interval: Option<Duration>,
    /// Persistent one-shot entries survive a fire and are re-armed by
    /// hand (triggers, retransmit timers).
    persistent: bool,
    /// Only the heap item carrying this sequence number is live; stale
    /// items are skipped on pop (lazy cancellation).
    armed_seq: u64,
    running: Option<Arc<AtomicBool>>,
}

/// Binary-heap timer wheel with lazy cancellation.
#[derive(Default)]
pub(crate) struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
    next_seq: u64,
}

impl Timers {
    pub(crate) fn create(
        &mut self,
        cb: TimerCb,
        interval: Option<Duration>,
        persistent: bool,
        running: Option<Arc<AtomicBool>>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            TimerEntry {
                cb: Some(cb),
                interval,
                persistent,
                armed_seq: 0,
                running,
            },
        );
        id
    }

    pub(crate) fn arm(&mut self, id: u64, deadline: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            self.next_seq += 1;
            entry.armed_seq = self.next_seq;
            self.heap.push(Reverse((deadline, self.next_seq, id)));
        }
    }

    pub(crate) fn disarm(&mut self, id: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.armed_seq = 0;
        }
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.entries.remove(&id);
    }

    /// Time until the nearest live deadline; `None` when no timer is
    /// armed. Pops stale heap items on the way.
    fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        loop {
            let &Reverse((deadline, seq, id)) = self.heap.peek()?;
            match self.entries.get(&id) {
                Some(entry) if entry.armed_seq == seq => {
                    return Some(deadline.saturating_duration_since(now));
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// Take the next due timer's callback, re-arming repeating entries
    /// and removing finished one-shots. The caller fires the callback
    /// outside the reactor borrow and hands it back via
    /// [`restore`](Self::restore).
    fn pop_due(&mut self, now: Instant) -> Option<(u64, TimerCb)> {
        loop {
            let &Reverse((deadline, seq, id)) = self.heap.peek()?;
            if deadline > now {
                return None;
            }
            self.heap.pop();

            let entry = match self.entries.get_mut(&id) {
                Some(e) if e.armed_seq == seq => e,
                _ => continue,
            };
            if let Some(running) = &entry.running {
                if !running.load(Ordering::Acquire) {
                    entry.armed_seq = 0;
                    continue;
                }
            }
            let cb = match entry.cb.take() {
                Some(cb) => cb,
                None => continue,
            };
            if let Some(interval) = entry.interval {
                self.next_seq += 1;
                entry.armed_seq = self.next_seq;
                self.heap.push(Reverse((deadline + interval, self.next_seq, id)));
            } else if !entry.persistent {
                self.entries.remove(&id);
            }
            return Some((id, cb));
        }
    }

    /// Give a fired callback back to its entry (if the entry survived
    /// the fire).
    fn restore(&mut self, id: u64, cb: TimerCb) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.cb.is_none() {
                entry.cb = Some(cb);
            }
        }
    }
}

// ── Event handles ───────────────────────────────────────────────────

/// Common capability of the loop's event primitives.
pub trait EventHandle {
    /// Begin (or resume) the event. Returns false when already running.
    fn start(&self) -> bool;
    /// Stop the event. Returns false when already stopped.
    fn stop(&self) -> bool;
    /// Whether the event is currently live.
    fn is_running(&self) -> bool;
}

struct TickerInner {
    shared: Arc<LoopShared>,
    id: OnceLock<u64>,
    running: Arc<AtomicBool>,
}

impl Drop for TickerInner {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(&id) = self.id.get() {
            let _ = self
                .shared
                .post(Box::new(move || with_reactor(|r| r.timers.remove(id))));
        }
    }
}

/// Handle to a repeating event created by
/// [`call_every`](EventLoop::call_every).
///
/// Dropping the last handle cancels the repetition.
#[derive(Clone)]
pub struct Ticker {
    inner: Arc<TickerInner>,
}

impl EventHandle for Ticker {
    fn start(&self) -> bool {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let inner = self.inner.clone();
        self.inner.shared.post(Box::new(move || {
            if let Some(&id) = inner.id.get() {
                with_reactor(|r| {
                    // Interval lives on the entry; re-arm one tick out.
                    if let Some(interval) = r.timers.entries.get(&id).and_then(|e| e.interval) {
                        r.timers.arm(id, Instant::now() + interval);
                    }
                });
            }
        }));
        true
    }

    fn stop(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        let inner = self.inner.clone();
        self.inner.shared.post(Box::new(move || {
            if let Some(&id) = inner.id.get() {
                with_reactor(|r| r.timers.disarm(id));
            }
        }));
        true
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}

// ── Trigger ─────────────────────────────────────────────────────────

const TRIGGER_HALTED: u8 = 0;
const TRIGGER_ITERATING: u8 = 1;
const TRIGGER_COOLING: u8 = 2;

struct TriggerInner {
    shared: Arc<LoopShared>,
    id: OnceLock<u64>,
    state: AtomicU8,
    count: AtomicUsize,
    n: usize,
    cooldown: Duration,
}

impl TriggerInner {
    fn arm_now(self: &Arc<Self>) {
        let inner = self.clone();
        self.shared.post(Box::new(move || {
            if let Some(&id) = inner.id.get() {
                with_reactor(|r| r.timers.arm(id, Instant::now()));
            }
        }));
    }
}

/// Burst-and-cooldown event: fires its callback up to `n` times with zero
/// interval, cools down, resumes, until halted. The callback never fires
/// while cooling down or halted.
#[derive(Clone)]
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

impl Trigger {
    fn new(
        ev_loop: &EventLoop,
        cooldown: Duration,
        n: usize,
        mut f: impl FnMut() + Send + 'static,
        start_immediately: bool,
    ) -> Trigger {
        let inner = Arc::new(TriggerInner {
            shared: ev_loop.shared.clone(),
            id: OnceLock::new(),
            state: AtomicU8::new(if start_immediately {
                TRIGGER_ITERATING
            } else {
                TRIGGER_HALTED
            }),
            count: AtomicUsize::new(0),
            n,
            cooldown,
        });

        let fire = inner.clone();
        let setup = inner.clone();
        ev_loop.call(move || {
            let cb: TimerCb = Box::new(move || {
                if fire.state.load(Ordering::Acquire) != TRIGGER_ITERATING {
                    return;
                }
                let count = fire.count.load(Ordering::Acquire);
                if count < fire.n {
                    fire.count.store(count + 1, Ordering::Release);
                    f();
                }
                if fire.count.load(Ordering::Acquire) >= fire.n {
                    // Burst finished: cool down, then resume.
                    if fire
                        .state
                        .compare_exchange(
                            TRIGGER_ITERATING,
                            TRIGGER_COOLING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let resume = fire.clone();
                        with_reactor(|r| {
                            let id = r.timers.create(
                                Box::new(move || {
                                    if resume
                                        .state
                                        .compare_exchange(
                                            TRIGGER_COOLING,
                                            TRIGGER_ITERATING,
                                            Ordering::AcqRel,
                                            Ordering::Acquire,
                                        )
                                        .is_ok()
                                    {
                                        resume.count.store(0, Ordering::Release);
                                        resume.arm_now();
                                    }
                                }),
                                None,
                                false,
                                None,
                            );
                            r.timers.arm(id, Instant::now() + fire.cooldown);
                        });
                    }
                } else if let Some(&id) = fire.id.get() {
                    with_reactor(|r| r.timers.arm(id, Instant::now()));
                }
            });

            with_reactor(|r| {
                let id = r.timers.create(cb, None, true, None);
                setup.id.set(id).ok();
                if setup.state.load(Ordering::Acquire) == TRIGGER_ITERATING {
                    r.timers.arm(id, Instant::now());
                }
            });
        });

        Trigger { inner }
    }

    /// Permanently stop the trigger.
    pub fn halt(&self) {
        self.inner.state.store(TRIGGER_HALTED, Ordering::Release);
        let inner = self.inner.clone();
        self.inner.shared.post(Box::new(move || {
            if let Some(&id) = inner.id.get() {
                with_reactor(|r| r.timers.disarm(id));
            }
        }));
    }

    /// Restart iteration from a fresh burst.
    pub fn begin(&self) -> bool {
        if self.inner.state.swap(TRIGGER_ITERATING, Ordering::AcqRel) == TRIGGER_ITERATING {
            return false;
        }
        self.inner.count.store(0, Ordering::Release);
        self.inner.arm_now();
        true
    }
}

impl EventHandle for Trigger {
    fn start(&self) -> bool {
        self.begin()
    }

    fn stop(&self) -> bool {
        let halted = self.inner.state.load(Ordering::Acquire) == TRIGGER_HALTED;
        self.halt();
        !halted
    }

    fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != TRIGGER_HALTED
    }
}

// ── Deferred destruction ────────────────────────────────────────────

/// Shared handle whose contents are always released on the loop thread.
///
/// Every clone's drop ships its reference to the loop, so wherever the
/// last clone is dropped, the wrapped value's destructor runs on the
/// loop thread. After shutdown the value is released inline (best
/// effort).
pub struct LoopBound<T: Send + Sync + 'static> {
    inner: Option<Arc<T>>,
    shared: Arc<LoopShared>,
}

impl<T: Send + Sync + 'static> LoopBound<T> {
    /// Wrap `value`, binding its destruction to `ev_loop`'s thread.
    pub fn new(ev_loop: &EventLoop, value: T) -> Self {
        Self {
            inner: Some(Arc::new(value)),
            shared: ev_loop.shared.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Clone for LoopBound<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Deref for LoopBound<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().expect("LoopBound used after drop")
    }
}

impl<T: Send + Sync + 'static> Drop for LoopBound<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if self.shared.in_loop() {
                drop(inner);
            } else {
                let _ = self.shared.post(Box::new(move || drop(inner)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_get_roundtrip() {
        let ev = EventLoop::new().unwrap();
        let value = ev.call_get(|| 21 * 2).unwrap();
        assert_eq!(value, 42);
        ev.shutdown(false);
    }

    #[test]
    fn test_call_get_after_shutdown() {
        let ev = EventLoop::new().unwrap();
        ev.shutdown(false);
        assert!(matches!(ev.call_get(|| ()), Err(Error::LoopClosed)));
    }

    #[test]
    fn test_jobs_fifo() {
        let ev = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let order = order.clone();
            ev.call_soon(move || order.lock().unwrap().push(i));
        }
        // Rendezvous behind the queued jobs.
        ev.call_get(|| ()).unwrap();
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
        ev.shutdown(false);
    }

    #[test]
    fn test_jobs_may_post_jobs() {
        let ev = EventLoop::new().unwrap();
        let hit = Arc::new(AtomicBool::new(false));
        let hit2 = hit.clone();
        let ev2 = ev.clone();
        ev.call_soon(move || {
            // Posting from inside a job must not deadlock on the queue
            // mutex.
            ev2.call_soon(move || hit2.store(true, Ordering::Release));
        });
        std::thread::sleep(Duration::from_millis(100));
        assert!(hit.load(Ordering::Acquire));
        ev.shutdown(false);
    }

    #[test]
    fn test_call_later() {
        let ev = EventLoop::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let begun = Instant::now();
        ev.call_later(Duration::from_millis(50), move || {
            tx.send(Instant::now()).unwrap();
        });
        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.duration_since(begun) >= Duration::from_millis(45));
        ev.shutdown(false);
    }

    #[test]
    fn test_ticker_start_stop_idempotent() {
        let ev = EventLoop::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let ticker = ev.call_every(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::AcqRel);
        });
        assert!(ticker.is_running());
        assert!(!ticker.start(), "start while running must be a no-op");
        std::thread::sleep(Duration::from_millis(100));
        assert!(ticker.stop());
        assert!(!ticker.stop(), "double stop must be a no-op");
        let frozen = count.load(Ordering::Acquire);
        assert!(frozen >= 2, "expected a few ticks, got {frozen}");
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::Acquire), frozen, "ticks after stop");
        ev.shutdown(false);
    }

    #[test]
    fn test_trigger_burst_and_halt() {
        let ev = EventLoop::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let trigger = ev.trigger(
            Duration::from_secs(60),
            3,
            move || {
                c.fetch_add(1, Ordering::AcqRel);
            },
            true,
        );
        std::thread::sleep(Duration::from_millis(200));
        // Exactly one burst; the long cooldown keeps it from resuming.
        assert_eq!(count.load(Ordering::Acquire), 3);
        assert!(trigger.is_running());
        trigger.halt();
        assert!(!trigger.is_running());
        ev.shutdown(false);
    }

    #[test]
    fn test_loop_bound_drops_on_loop_thread() {
        struct DropProbe(Arc<Mutex<Option<thread::ThreadId>>>);
        impl Drop for DropProbe {
            fn drop(&mut self) {
                *self.0.lock().unwrap() = Some(thread::current().id());
            }
        }

        let ev = EventLoop::new().unwrap();
        let loop_id = ev.call_get(thread::current).unwrap().id();
        let dropped_on = Arc::new(Mutex::new(None));
        let bound = LoopBound::new(&ev, DropProbe(dropped_on.clone()));
        drop(bound);
        ev.call_get(|| ()).unwrap();
        assert_eq!(*dropped_on.lock().unwrap(), Some(loop_id));
        ev.shutdown(false);
    }
}
