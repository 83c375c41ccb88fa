//! Cross-thread task queue and wakeup signal
//!
//! Worker threads enqueue pending callback invocations; exactly one
//! consumer thread drains them. The queue is a mutex-guarded FIFO; the
//! wakeup is a coalescing boolean under its own mutex + condvar, the
//! in-process analogue of a `uv_async`-style notifier: any number of
//! signals before a wait collapse into one wakeup.
//!
//! # Ordering
//!
//! Tasks run in the order their `enqueue` calls were linearized by the
//! queue mutex. `drain_and_run` pops one task at a time and never holds
//! the lock while a task executes, so tasks are free to enqueue more
//! work without deadlocking; the drain loop re-checks the queue until it
//! is observed empty.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

type Task<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Coalescing cross-thread notification primitive.
pub struct WakeupSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeupSignal {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Wake the waiting consumer. Idempotent: signals delivered before
    /// the next `wait` collapse into one wakeup.
    pub fn signal(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.cond.notify_one();
    }

    /// Block until a signal arrives, then consume it. Returns
    /// immediately if a signal is already pending.
    pub fn wait(&self) {
        let mut pending = self.pending.lock().unwrap();
        while !*pending {
            pending = self.cond.wait(pending).unwrap();
        }
        *pending = false;
    }

    /// Whether a signal is pending without consuming it.
    pub fn is_signalled(&self) -> bool {
        *self.pending.lock().unwrap()
    }
}

impl Default for WakeupSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe FIFO of pending tasks, drained by one consumer.
///
/// `C` is the consumer-side context handed to each task when it runs.
pub struct TaskQueue<C> {
    pending: Mutex<VecDeque<Task<C>>>,
    wakeup: WakeupSignal,
}

impl<C> TaskQueue<C> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            wakeup: WakeupSignal::new(),
        }
    }

    /// Append a task and wake the consumer. Callable from any thread;
    /// never blocks beyond the queue mutex hold.
    pub fn enqueue(&self, task: impl FnOnce(&mut C) + Send + 'static) {
        self.pending.lock().unwrap().push_back(Box::new(task));
        self.wakeup.signal();
    }

    /// Run queued tasks until the queue is observed empty. Returns the
    /// number of tasks executed.
    ///
    /// Only the designated consumer thread may call this. The lock is
    /// released before each task runs, so a task enqueued mid-drain is
    /// picked up by the same drain.
    pub fn drain_and_run(&self, ctx: &mut C) -> usize {
        let mut executed = 0;
        loop {
            let task = self.pending.lock().unwrap().pop_front();
            match task {
                Some(task) => {
                    task(ctx);
                    executed += 1;
                }
                None => break,
            }
        }
        executed
    }

    /// Block the consumer until the next enqueue.
    pub fn wait(&self) {
        self.wakeup.wait();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}

impl<C> Default for TaskQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::<Vec<u32>>::new();
        for i in 0..10 {
            queue.enqueue(move |seen| seen.push(i));
        }

        let mut seen = Vec::new();
        assert_eq!(queue.drain_and_run(&mut seen), 10);
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_on_empty_queue() {
        let queue = TaskQueue::<()>::new();
        assert_eq!(queue.drain_and_run(&mut ()), 0);
    }

    #[test]
    fn test_task_enqueued_mid_drain_runs_in_same_drain() {
        let queue = Arc::new(TaskQueue::<Vec<&'static str>>::new());
        let q = queue.clone();
        queue.enqueue(move |seen| {
            seen.push("first");
            q.enqueue(|seen| seen.push("second"));
        });

        let mut seen = Vec::new();
        assert_eq!(queue.drain_and_run(&mut seen), 2);
        assert_eq!(seen, vec!["first", "second"]);
    }

    #[test]
    fn test_concurrent_enqueue_drains_completely() {
        const THREADS: usize = 8;
        const TASKS_PER_THREAD: usize = 50;

        let queue = Arc::new(TaskQueue::<AtomicUsize>::new());
        let barrier = Arc::new(Barrier::new(THREADS));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let queue = queue.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..TASKS_PER_THREAD {
                        queue.enqueue(|count: &mut AtomicUsize| {
                            count.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        let mut count = AtomicUsize::new(0);
        assert_eq!(queue.drain_and_run(&mut count), THREADS * TASKS_PER_THREAD);
        assert_eq!(count.load(Ordering::SeqCst), THREADS * TASKS_PER_THREAD);
    }

    #[test]
    fn test_externally_ordered_enqueues_run_in_order() {
        // T1 is enqueued strictly before T2, from different threads; the
        // consumer must observe T1 first.
        let queue = Arc::new(TaskQueue::<Vec<u32>>::new());

        let q = queue.clone();
        std::thread::spawn(move || q.enqueue(|seen| seen.push(1)))
            .join()
            .unwrap();
        let q = queue.clone();
        std::thread::spawn(move || q.enqueue(|seen| seen.push(2)))
            .join()
            .unwrap();

        let mut seen = Vec::new();
        queue.drain_and_run(&mut seen);
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_wakeup_coalesces_signals() {
        let signal = WakeupSignal::new();
        signal.signal();
        signal.signal();
        signal.signal();

        // One wait consumes the whole burst.
        signal.wait();
        assert!(!signal.is_signalled());
    }

    #[test]
    fn test_wakeup_unblocks_waiter() {
        let signal = Arc::new(WakeupSignal::new());
        let s = signal.clone();
        let waiter = std::thread::spawn(move || s.wait());

        signal.signal();
        waiter.join().unwrap();
        assert!(!signal.is_signalled());
    }

    #[test]
    fn test_enqueue_signals_wakeup() {
        let queue = Arc::new(TaskQueue::<()>::new());
        let q = queue.clone();
        let consumer = std::thread::spawn(move || {
            q.wait();
            q.drain_and_run(&mut ())
        });

        queue.enqueue(|_| {});
        assert_eq!(consumer.join().unwrap(), 1);
    }
}
