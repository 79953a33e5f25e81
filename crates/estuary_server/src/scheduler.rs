//! Task scheduler: the framework's "main logic thread".
//!
//! One dispatcher task consumes an immediate-run queue and a deadline heap.
//! Any two tasks submitted to the same scheduler are mutually exclusive,
//! which is what gives handlers a single-writer view of their sessions
//! without locking. Immediate tasks from one producer run in enqueue
//! order; timed tasks fire in non-decreasing deadline order.
//!
//! A panicking task is caught and logged; it never takes the dispatcher
//! down with it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};

/// A unit of work for the dispatcher.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run tasks serially on its own executor.
///
/// Sessions carry named `LocalScheduler` capabilities so an application can
/// pin a user to a dedicated worker (for example, one scheduler per room).
/// [`Scheduler`] implements it, so a per-room `Scheduler` is the common
/// concrete choice.
pub trait LocalScheduler: Send + Sync {
    fn schedule(&self, task: Task);
}

enum Command {
    Run(Task),
    Put {
        task: Task,
        deadline: Instant,
        fire_at: Instant,
    },
    Close,
}

struct TimedTask {
    /// Requested deadline; total order for the heap.
    deadline: Instant,
    /// Deadline rounded up to the timer precision; when the task fires.
    fire_at: Instant,
    /// Submission order, breaks deadline ties.
    seq: u64,
    task: Task,
}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimedTask {}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedTask {
    // Reversed so BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

/// Cheap-to-clone handle to one dispatcher.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Command>,
    epoch: Instant,
    precision: Duration,
}

impl Scheduler {
    /// Spawn a dispatcher. `precision` is the timer granularity: deadlines
    /// are rounded up to the next precision boundary. Values below one
    /// millisecond are clamped to one millisecond.
    pub fn new(precision: Duration) -> Self {
        let precision = precision.max(Duration::from_millis(1));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx));
        Self {
            tx,
            epoch: Instant::now(),
            precision,
        }
    }

    /// Enqueue a task for immediate execution on the dispatcher.
    pub fn run(&self, task: Task) {
        // A send after close means the dispatcher is gone; the task is
        // dropped, matching close semantics for in-flight work.
        let _ = self.tx.send(Command::Run(task));
    }

    /// Enqueue a task to execute at `deadline`.
    pub fn put(&self, task: Task, deadline: Instant) {
        let fire_at = self.quantize(deadline);
        let _ = self.tx.send(Command::Put {
            task,
            deadline,
            fire_at,
        });
    }

    /// Run `task` every `interval`, re-arming after each run. The first
    /// execution happens one interval from now.
    pub fn repeat<F>(&self, task: F, interval: Duration)
    where
        F: FnMut() + Send + 'static,
    {
        fn arm<F: FnMut() + Send + 'static>(handle: Scheduler, mut task: F, interval: Duration) {
            let deadline = Instant::now() + interval;
            let rearm = handle.clone();
            handle.put(
                Box::new(move || {
                    task();
                    arm(rearm, task, interval);
                }),
                deadline,
            );
        }
        arm(self.clone(), task, interval);
    }

    /// Stop the dispatcher. Idempotent; timed tasks still in the heap are
    /// dropped.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }

    fn quantize(&self, deadline: Instant) -> Instant {
        let since = deadline.saturating_duration_since(self.epoch).as_nanos();
        let p = self.precision.as_nanos();
        let rem = since % p;
        if rem == 0 {
            deadline
        } else {
            deadline + Duration::from_nanos((p - rem) as u64)
        }
    }
}

impl LocalScheduler for Scheduler {
    fn schedule(&self, task: Task) {
        self.run(task);
    }
}

/// Run one task, containing any panic.
fn guarded(task: Task) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(task)) {
        let what = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!("scheduled task panicked: {what}");
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut heap: BinaryHeap<TimedTask> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let next_fire = heap.peek().map(|t| t.fire_at);
        tokio::select! {
            biased;
            cmd = rx.recv() => match cmd {
                Some(Command::Run(task)) => guarded(task),
                Some(Command::Put { task, deadline, fire_at }) => {
                    seq += 1;
                    // Already due: execute in place rather than bouncing
                    // through the heap.
                    if fire_at <= Instant::now() {
                        guarded(task);
                    } else {
                        heap.push(TimedTask { deadline, fire_at, seq, task });
                    }
                }
                Some(Command::Close) | None => break,
            },
            // One timer, always armed to the heap root.
            _ = tokio::time::sleep_until(next_fire.unwrap_or_else(Instant::now)), if next_fire.is_some() => {
                let now = Instant::now();
                while heap.peek().is_some_and(|t| t.fire_at <= now) {
                    let timed = heap.pop().expect("peeked entry is poppable");
                    guarded(timed.task);
                }
            }
        }
    }
    debug!("scheduler dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |n: u32| -> Task {
                let log = log.clone();
                Box::new(move || log.lock().unwrap().push(n))
            }
        };
        (log, make)
    }

    async fn drain(sched: &Scheduler) {
        let (tx, rx) = oneshot::channel();
        sched.run(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn run_preserves_submission_order() {
        let sched = Scheduler::new(Duration::from_millis(1));
        let (log, make) = recorder();
        for n in 0..100 {
            sched.run(make(n));
        }
        drain(&sched).await;
        assert_eq!(*log.lock().unwrap(), (0..100).collect::<Vec<_>>());
        sched.close();
    }

    #[tokio::test(start_paused = true)]
    async fn put_fires_in_deadline_order() {
        let sched = Scheduler::new(Duration::from_millis(1));
        let (log, make) = recorder();
        let now = Instant::now();
        // Submitted out of order on purpose.
        sched.put(make(2), now + Duration::from_millis(50));
        sched.put(make(1), now + Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;
        drain(&sched).await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        sched.close();
    }

    #[tokio::test(start_paused = true)]
    async fn equal_deadlines_fire_in_submission_order() {
        let sched = Scheduler::new(Duration::from_millis(1));
        let (log, make) = recorder();
        let deadline = Instant::now() + Duration::from_millis(10);
        for n in 0..10 {
            sched.put(make(n), deadline);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        drain(&sched).await;
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
        sched.close();
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_rearms() {
        let sched = Scheduler::new(Duration::from_millis(1));
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        sched.repeat(
            move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
            },
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(55)).await;
        drain(&sched).await;
        let fired = count.load(AtomicOrdering::Relaxed);
        assert!((4..=6).contains(&fired), "fired {fired} times");
        sched.close();
    }

    #[tokio::test]
    async fn panicking_task_does_not_stop_the_dispatcher() {
        let sched = Scheduler::new(Duration::from_millis(1));
        let (log, make) = recorder();
        sched.run(Box::new(|| panic!("boom")));
        sched.run(make(7));
        drain(&sched).await;
        assert_eq!(*log.lock().unwrap(), vec![7]);
        sched.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drops_later_tasks() {
        let sched = Scheduler::new(Duration::from_millis(1));
        sched.close();
        sched.close();
        // The dispatcher is gone; this must not panic.
        sched.run(Box::new(|| {}));
    }
}
