//! Queues of threads waiting for a condition

use {
    super::{Scheduler, ThreadId, IDLE_THREAD},
    alloc::vec::Vec,
    spin::Mutex,
};

/// Threads blocked until some condition changes
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: Mutex<Vec<ThreadId>>,
}

impl WaitQueue {
    /// Creates an empty queue
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: ThreadId) {
        let mut waiters = self.waiters.lock();
        if !waiters.contains(&id) {
            waiters.push(id);
        }
    }

    fn remove(&self, id: ThreadId) {
        self.waiters.lock().retain(|waiter| *waiter != id);
    }

    /// Number of threads waiting
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Whether no thread is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks the current thread until `condition` holds
    ///
    /// The thread is queued and blocked before the condition is tested, a `wake_up` between the
    /// test and the switch leaves it runnable. On the idle thread the domain idles instead.
    pub fn wait_until<F: FnMut() -> bool>(&self, scheduler: &Scheduler, mut condition: F) {
        loop {
            let current = scheduler.current();

            if current == IDLE_THREAD {
                if condition() {
                    return;
                }
                scheduler.idle_step();
                continue;
            }

            self.add(current);
            scheduler.block(current);

            if condition() {
                self.remove(current);
                scheduler.wake(current);
                return;
            }

            scheduler.schedule();
            self.remove(current);
        }
    }

    /// Makes every waiting thread runnable
    pub fn wake_up(&self, scheduler: &Scheduler) {
        let waiters = core::mem::take(&mut *self.waiters.lock());

        for id in waiters {
            scheduler.wake(id);
        }
    }
}
