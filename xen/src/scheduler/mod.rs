//! Cooperative green thread scheduler
//!
//! Threads run until they call [`Scheduler::schedule`] (directly, or by sleeping, waiting or
//! exiting). The context that creates the scheduler becomes the idle thread: it never sits on
//! the run queue and is switched to whenever no other thread is runnable. The idle thread is
//! responsible for blocking the domain until the next wakeup time.

use {
    crate::{
        memory::{alloc_pages, free_pages},
        platform::consts::PAGE_SIZE,
    },
    alloc::{
        alloc::{handle_alloc_error, Layout},
        boxed::Box,
        collections::VecDeque,
        string::String,
        sync::Arc,
        vec::Vec,
    },
    core::{cell::UnsafeCell, ptr::NonNull},
    log::{debug, info, trace},
    spin::Mutex,
};

mod context;
pub mod operation;
mod wait;

pub use {
    context::{Context, Entry},
    wait::WaitQueue,
};

/// Identifier of a thread
pub type ThreadId = u32;

/// Identifier of the idle thread
pub const IDLE_THREAD: ThreadId = 0;

/// Stack size of threads created by [`Scheduler::new`]
pub const DEFAULT_STACK_SIZE: usize = 16 * PAGE_SIZE;

/// How long the idle thread blocks the domain when no thread sleeps
pub const DEFAULT_IDLE_TIMEOUT: u64 = 10_000_000_000;

const CANARY: usize = 0x57AD_D057_57AD_D057_u64 as usize;
const CANARY_WORDS: usize = 8;

/// Source of time and a way to stop the domain until something happens
pub trait Idle: Send + Sync {
    /// System time in nanoseconds
    fn now(&self) -> u64;

    /// Blocks the domain until `deadline` or until an event arrives
    fn block_until(&self, deadline: u64);
}

impl<T: Idle + ?Sized> Idle for Arc<T> {
    fn now(&self) -> u64 {
        (**self).now()
    }

    fn block_until(&self, deadline: u64) {
        (**self).block_until(deadline)
    }
}

/// Stack of a thread with a canary at its lowest address
struct Stack {
    base: NonNull<u8>,
    order: u32,
}

// Only touched by the thread running on it and by the scheduler while that thread is switched out
unsafe impl Send for Stack {}

impl Stack {
    fn new(size: usize) -> Self {
        let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        let order = pages.next_power_of_two().trailing_zeros();

        let base = match alloc_pages(order) {
            Some(base) => base,
            None => handle_alloc_error(Layout::new::<[u8; PAGE_SIZE]>()),
        };

        let stack = Self { base, order };
        for word in stack.canary() {
            unsafe { word.write_volatile(CANARY) };
        }

        stack
    }

    fn size(&self) -> usize {
        PAGE_SIZE << self.order
    }

    fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.size()) }
    }

    fn canary(&self) -> impl Iterator<Item = *mut usize> {
        let base = self.base.as_ptr() as *mut usize;
        (0..CANARY_WORDS).map(move |i| unsafe { base.add(i) })
    }

    fn is_intact(&self) -> bool {
        self.canary()
            .all(|word| unsafe { word.read_volatile() } == CANARY)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { free_pages(self.base, self.order) }
    }
}

struct Thread {
    id: ThreadId,
    name: String,
    stack: Option<Stack>,
    context: Box<UnsafeCell<Context>>,
    runnable: bool,
    wakeup: Option<u64>,
}

// The context is only written by the switch of the thread it belongs to
unsafe impl Send for Thread {}

impl Thread {
    fn new(id: ThreadId, name: String, stack: Option<Stack>, context: Context) -> Box<Self> {
        Box::new(Self {
            id,
            name,
            stack,
            context: Box::new(UnsafeCell::new(context)),
            runnable: true,
            wakeup: None,
        })
    }

    fn check_stack(&self) {
        if let Some(stack) = &self.stack {
            assert!(
                stack.is_intact(),
                "stack overflow in thread {} ({})",
                self.id,
                self.name
            );
        }
    }
}

struct State {
    idle: Box<Thread>,
    threads: VecDeque<Box<Thread>>,
    exited: Vec<Box<Thread>>,
    current: ThreadId,
    next_id: ThreadId,
}

impl State {
    fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        if id == IDLE_THREAD {
            return Some(&mut *self.idle);
        }

        self.threads
            .iter_mut()
            .find(|thread| thread.id == id)
            .map(|thread| &mut **thread)
    }

    fn context_of(&self, id: ThreadId) -> *mut Context {
        if id == IDLE_THREAD {
            return self.idle.context.get();
        }

        self.threads
            .iter()
            .chain(self.exited.iter())
            .find(|thread| thread.id == id)
            .map(|thread| thread.context.get())
            .unwrap_or_else(|| panic!("no context for thread {}", id))
    }

    fn wake_sleepers(&mut self, now: u64) {
        for thread in self.threads.iter_mut() {
            if let Some(wakeup) = thread.wakeup {
                if wakeup <= now {
                    thread.wakeup = None;
                    thread.runnable = true;
                }
            }
        }
    }
}

/// Start of a new thread, passed to it through its stack
struct Start {
    scheduler: *const Scheduler,
    main: Box<dyn FnOnce() + Send>,
}

extern "C" fn thread_entry(arg: *mut u8) -> ! {
    let start = unsafe { Box::from_raw(arg as *mut Start) };
    let Start { scheduler, main } = *start;

    // SAFETY: the scheduler lives in an `Arc` and only it resumes its threads
    let scheduler = unsafe { &*scheduler };

    scheduler.reap();
    main();
    scheduler.exit_thread()
}

/// Round robin scheduler of cooperative threads
pub struct Scheduler {
    idle: Box<dyn Idle>,
    stack_size: usize,
    state: Mutex<State>,
}

impl Scheduler {
    /// Creates a scheduler with [`DEFAULT_STACK_SIZE`] stacks, the caller becomes its idle thread
    pub fn new(idle: Box<dyn Idle>) -> Arc<Self> {
        Self::with_stack_size(idle, DEFAULT_STACK_SIZE)
    }

    /// Creates a scheduler whose threads get stacks of at least `stack_size` bytes
    pub fn with_stack_size(idle: Box<dyn Idle>, stack_size: usize) -> Arc<Self> {
        let stack_size = stack_size.max(PAGE_SIZE);

        Arc::new(Self {
            idle,
            stack_size,
            state: Mutex::new(State {
                idle: Thread::new(IDLE_THREAD, "idle".into(), None, Context::default()),
                threads: VecDeque::new(),
                exited: Vec::new(),
                current: IDLE_THREAD,
                next_id: IDLE_THREAD + 1,
            }),
        })
    }

    /// Creates a runnable thread that runs `main` and then exits
    pub fn create_thread<F>(self: &Arc<Self>, name: &str, main: F) -> ThreadId
    where
        F: FnOnce() + Send + 'static,
    {
        let start = Box::into_raw(Box::new(Start {
            scheduler: Arc::as_ptr(self),
            main: Box::new(main),
        }));

        let stack = Stack::new(self.stack_size);
        let context = unsafe { Context::new(stack.top(), thread_entry, start as *mut u8) };

        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        debug!(
            "thread {} ({}) created, stack {:p}-{:p}",
            id,
            name,
            stack.base,
            stack.top()
        );

        state
            .threads
            .push_back(Thread::new(id, name.into(), Some(stack), context));

        id
    }

    /// Thread currently running
    pub fn current(&self) -> ThreadId {
        self.state.lock().current
    }

    /// Number of threads that have not exited, the idle thread excluded
    pub fn thread_count(&self) -> usize {
        self.state.lock().threads.len()
    }

    /// Whether thread `id` exists and is runnable
    pub fn is_runnable(&self, id: ThreadId) -> bool {
        self.state
            .lock()
            .thread_mut(id)
            .map(|thread| thread.runnable)
            .unwrap_or(false)
    }

    /// Marks thread `id` as not runnable, it keeps running until it calls `schedule`
    pub fn block(&self, id: ThreadId) {
        if let Some(thread) = self.state.lock().thread_mut(id) {
            thread.runnable = false;
        }
    }

    /// Makes thread `id` runnable and cancels its pending wakeup
    pub fn wake(&self, id: ThreadId) {
        if let Some(thread) = self.state.lock().thread_mut(id) {
            thread.wakeup = None;
            thread.runnable = true;
        }
    }

    /// Blocks the current thread for `millis` milliseconds
    pub fn msleep(&self, millis: u64) {
        let deadline = self
            .idle
            .now()
            .saturating_add(millis.saturating_mul(1_000_000));

        {
            let mut state = self.state.lock();
            let current = state.current;
            if current == IDLE_THREAD {
                drop(state);
                while self.idle.now() < deadline {
                    self.idle.block_until(deadline);
                }
                return;
            }

            if let Some(thread) = state.thread_mut(current) {
                thread.wakeup = Some(deadline);
                thread.runnable = false;
            }
        }

        self.schedule();
    }

    /// Terminates the current thread
    ///
    /// Its stack is freed by the next context that runs.
    pub fn exit_thread(&self) -> ! {
        {
            let mut state = self.state.lock();
            let current = state.current;
            assert_ne!(current, IDLE_THREAD, "the idle thread cannot exit");

            if let Some(index) = state.threads.iter().position(|thread| thread.id == current) {
                if let Some(thread) = state.threads.remove(index) {
                    debug!("thread {} ({}) exited", thread.id, thread.name);
                    state.exited.push(thread);
                }
            }
        }

        self.schedule();

        unreachable!("exited thread resumed")
    }

    /// Frees the stacks of exited threads other than the running one
    fn reap(&self) {
        let reaped = {
            let mut state = self.state.lock();
            let current = state.current;

            let (keep, reaped): (Vec<_>, Vec<_>) = state
                .exited
                .drain(..)
                .partition(|thread| thread.id == current);
            state.exited = keep;

            reaped
        };

        for thread in reaped {
            trace!("freeing stack of thread {}", thread.id);
        }
    }

    /// Switches to the next runnable thread
    ///
    /// Sleepers whose wakeup time passed are woken first. The chosen thread moves to the back
    /// of the run queue. With no thread runnable the idle thread runs, if it is already running
    /// this returns immediately.
    pub fn schedule(&self) {
        self.reap();

        let now = self.idle.now();

        let (prev, next) = {
            let mut state = self.state.lock();
            state.wake_sleepers(now);

            let index = state.threads.iter().position(|thread| thread.runnable);
            let picked = index.and_then(|index| state.threads.remove(index));

            let next = match picked {
                Some(thread) => {
                    let id = thread.id;
                    state.threads.push_back(thread);
                    id
                }
                None => IDLE_THREAD,
            };

            let prev = state.current;
            if prev == next {
                return;
            }

            if let Some(thread) = state
                .threads
                .iter()
                .chain(state.exited.iter())
                .find(|thread| thread.id == prev)
            {
                thread.check_stack();
            }

            state.current = next;
            trace!("switching from thread {} to {}", prev, next);

            (state.context_of(prev), state.context_of(next))
        };

        // SAFETY: both contexts are boxed and outlive the switch, exited threads are only freed
        // by `reap` once another thread runs
        unsafe { Context::switch(prev, next) };

        self.reap();
    }

    /// Earliest time the idle thread has to be back, `None` if a thread can run now
    fn idle_deadline(&self) -> Option<u64> {
        let now = self.idle.now();
        let mut state = self.state.lock();
        state.wake_sleepers(now);

        if state.threads.iter().any(|thread| thread.runnable) {
            return None;
        }

        Some(
            state
                .threads
                .iter()
                .filter_map(|thread| thread.wakeup)
                .min()
                .unwrap_or_else(|| now.saturating_add(DEFAULT_IDLE_TIMEOUT)),
        )
    }

    /// One round of the idle loop: run threads, then block the domain if none is runnable
    fn idle_step(&self) {
        self.schedule();

        if let Some(deadline) = self.idle_deadline() {
            self.idle.block_until(deadline);
        }
    }

    /// Idle loop of the domain
    pub fn run_idle_thread(&self) -> ! {
        info!("idle thread running");

        loop {
            self.idle_step();
        }
    }

    /// Idle loop that returns once every thread has exited
    pub fn run_until_exit(&self) {
        loop {
            self.schedule();

            if self.thread_count() == 0 {
                break;
            }

            if let Some(deadline) = self.idle_deadline() {
                self.idle.block_until(deadline);
            }
        }

        self.reap();
    }

    /// Logs the run queue
    pub fn print_runqueue(&self) {
        let state = self.state.lock();

        info!("run queue (current {}):", state.current);
        for thread in state.threads.iter() {
            info!(
                "  {} {:<16} runnable: {} wakeup: {:?}",
                thread.id, thread.name, thread.runnable, thread.wakeup
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::fake::FakeIdle,
        alloc::{format, vec},
        core::sync::atomic::{AtomicUsize, Ordering},
    };

    fn scheduler() -> (Arc<Scheduler>, Arc<FakeIdle>) {
        let idle = FakeIdle::new();
        (Scheduler::new(Box::new(idle.clone())), idle)
    }

    #[test]
    fn threads_run_to_completion() {
        let (sched, _) = scheduler();
        let ran = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let ran = ran.clone();
            sched.create_thread(&format!("worker{}", i), move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(sched.thread_count(), 3);

        sched.run_until_exit();

        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(sched.thread_count(), 0);
        assert_eq!(sched.current(), IDLE_THREAD);
        assert!(sched.state.lock().exited.is_empty());
    }

    #[test]
    fn yielding_threads_alternate() {
        let (sched, _) = scheduler();
        let trace = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b", "c"].iter() {
            let trace = trace.clone();
            let handle = sched.clone();
            let name = *name;
            sched.create_thread(name, move || {
                for round in 0..3 {
                    trace.lock().push(format!("{}{}", name, round));
                    handle.schedule();
                }
            });
        }

        sched.run_until_exit();

        assert_eq!(
            *trace.lock(),
            vec!["a0", "b0", "c0", "a1", "b1", "c1", "a2", "b2", "c2"]
        );
    }

    #[test]
    fn every_thread_runs_within_n_decisions() {
        let (sched, _) = scheduler();
        let runs = Arc::new(Mutex::new(Vec::new()));
        const THREADS: usize = 5;

        for _ in 0..THREADS {
            let runs = runs.clone();
            let handle = sched.clone();
            sched.create_thread("fair", move || {
                for _ in 0..20 {
                    runs.lock().push(handle.current());
                    handle.schedule();
                }
            });
        }

        sched.run_until_exit();

        let runs = runs.lock();
        for window in runs.windows(THREADS) {
            let mut ids = window.to_vec();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), THREADS);
        }
    }

    #[test]
    fn msleep_blocks_until_deadline() {
        let (sched, idle) = scheduler();
        let woke_at = Arc::new(AtomicUsize::new(0));

        {
            let handle = sched.clone();
            let woke_at = woke_at.clone();
            let clock = idle.clone();
            sched.create_thread("sleeper", move || {
                handle.msleep(25);
                woke_at.store(clock.now() as usize, Ordering::SeqCst);
            });
        }

        sched.run_until_exit();

        assert_eq!(woke_at.load(Ordering::SeqCst), 25_000_000);
        assert_eq!(idle.blocks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_blocks_for_default_timeout_without_sleepers() {
        let (sched, idle) = scheduler();

        let blocked = {
            let handle = sched.clone();
            sched.create_thread("blocked", move || {
                let id = handle.current();
                handle.block(id);
                handle.schedule();
            })
        };

        let waker = sched.clone();
        idle.on_block(move || waker.wake(blocked));

        sched.run_until_exit();

        assert_eq!(idle.now.load(Ordering::SeqCst), DEFAULT_IDLE_TIMEOUT);
    }

    #[test]
    fn block_and_wake() {
        let (sched, _) = scheduler();
        let id = sched.create_thread("t", || {});

        assert!(sched.is_runnable(id));
        sched.block(id);
        assert!(!sched.is_runnable(id));
        sched.wake(id);
        assert!(sched.is_runnable(id));
        assert!(!sched.is_runnable(99));

        sched.run_until_exit();
        assert!(!sched.is_runnable(id));
    }

    #[test]
    fn wait_queue_wakes_waiter() {
        let (sched, _) = scheduler();
        let queue = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));

        {
            let (handle, queue, flag, seen) =
                (sched.clone(), queue.clone(), flag.clone(), seen.clone());
            sched.create_thread("waiter", move || {
                queue.wait_until(&handle, || flag.load(Ordering::SeqCst) == 1);
                seen.store(1, Ordering::SeqCst);
            });
        }
        {
            let (handle, queue, flag) = (sched.clone(), queue.clone(), flag.clone());
            sched.create_thread("signaller", move || {
                assert_eq!(queue.len(), 1);
                flag.store(1, Ordering::SeqCst);
                queue.wake_up(&handle);
            });
        }

        sched.run_until_exit();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn wait_on_idle_thread_idles() {
        let (sched, idle) = scheduler();
        let queue = WaitQueue::new();

        let clock = idle.clone();
        queue.wait_until(&sched, move || clock.blocks.load(Ordering::SeqCst) >= 2);

        assert_eq!(idle.blocks.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn canary_detects_overflow() {
        let stack = Stack::new(PAGE_SIZE);
        assert!(stack.is_intact());

        unsafe { (stack.base.as_ptr() as *mut usize).add(3).write(0) };
        assert!(!stack.is_intact());
    }

    #[test]
    #[should_panic]
    fn corrupted_stack_is_fatal() {
        let (sched, _) = scheduler();
        let id = sched.create_thread("victim", || {});

        let mut state = sched.state.lock();
        let thread = state.thread_mut(id).unwrap();
        if let Some(stack) = &thread.stack {
            unsafe { (stack.base.as_ptr() as *mut usize).write(0) };
        }
        thread.check_stack();
    }

    #[test]
    fn stack_sizes_round_to_pages() {
        let stack = Stack::new(3 * PAGE_SIZE);
        assert_eq!(stack.size(), 4 * PAGE_SIZE);
        assert_eq!(stack.top() as usize % 16, 0);
    }

    #[test]
    fn partial_pages_round_up() {
        let size = 4 * PAGE_SIZE + 1;
        let stack = Stack::new(size);
        assert!(stack.size() >= size);
        assert_eq!(stack.size(), 8 * PAGE_SIZE);

        assert_eq!(Stack::new(1).size(), PAGE_SIZE);
    }
}
