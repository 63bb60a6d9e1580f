//! Two-level priority load queue running brick loads on a blocking pool
//!
//! At most one live task exists per key. Submitting a key that already has a
//! task at equal or higher priority returns the existing handle; submitting
//! at a higher priority cancels the old task and queues a new one. HIGH tasks
//! are dispatched before any LOW task, FIFO within a level, and never more
//! than `concurrency` run at once. Cancellation is cooperative: a canceled
//! task never delivers its result.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::config::validate_concurrency;
use crate::core::cancel::CancelToken;
use crate::core::error::Error;
use crate::core::types::Result;

/// Scheduling priority of a load
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadPriority {
    /// Prefetch of bricks kept in host memory only
    Low,
    /// Bricks about to be displayed
    High,
}

/// Lifecycle of a load task. Terminal states are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Canceled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Canceled | TaskState::Failed)
    }
}

type LoadJob<T> = Box<dyn FnOnce(&CancelToken) -> Result<T> + Send>;
type Completion<K, T> = Box<dyn FnOnce(K, Result<T>) + Send>;

#[derive(Debug)]
struct TaskShared {
    id: u64,
    priority: LoadPriority,
    cancel: CancelToken,
    state: Mutex<TaskState>,
}

impl TaskShared {
    fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// May still deliver a result
    fn is_live(&self) -> bool {
        !self.cancel.is_canceled() && !self.state().is_terminal()
    }

    /// Apply a legal transition; returns false if `to` is not reachable
    fn advance(&self, to: TaskState) -> bool {
        let mut state = self.state.lock();
        let legal = matches!(
            (*state, to),
            (TaskState::Queued, TaskState::Running)
                | (TaskState::Queued, TaskState::Canceled)
                | (
                    TaskState::Running,
                    TaskState::Completed | TaskState::Canceled | TaskState::Failed
                )
        );
        if legal {
            *state = to;
        }
        legal
    }

    /// Request cancellation. Queued tasks are canceled at once; running
    /// tasks stay `Running` until their load returns.
    fn cancel(&self) {
        self.cancel.cancel();
        let mut state = self.state.lock();
        if *state == TaskState::Queued {
            *state = TaskState::Canceled;
        }
    }
}

/// Caller's view of a submitted load
#[derive(Clone, Debug)]
pub struct TaskHandle<K> {
    key: K,
    shared: Arc<TaskShared>,
}

impl<K> TaskHandle<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Unique per queue; a superseding task gets a new id
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn priority(&self) -> LoadPriority {
        self.shared.priority
    }

    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Cancel this task; a no-op once it has finished
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

struct QueuedTask<K, T> {
    key: K,
    shared: Arc<TaskShared>,
    load: LoadJob<T>,
    on_complete: Completion<K, T>,
}

struct QueueState<K, T> {
    /// Latest task per key that may still run
    live: HashMap<K, Arc<TaskShared>>,
    high: VecDeque<QueuedTask<K, T>>,
    low: VecDeque<QueuedTask<K, T>>,
    running: usize,
    concurrency: usize,
    next_id: u64,
}

impl<K, T> QueueState<K, T> {
    fn next_queued(&mut self) -> Option<QueuedTask<K, T>> {
        self.high.pop_front().or_else(|| self.low.pop_front())
    }

    fn drop_queued(&mut self, id: u64) {
        self.high.retain(|t| t.shared.id != id);
        self.low.retain(|t| t.shared.id != id);
    }

    fn queued_count(&self) -> usize {
        self.high
            .iter()
            .chain(self.low.iter())
            .filter(|t| t.shared.state() == TaskState::Queued)
            .count()
    }
}

struct QueueInner<K, T> {
    state: Mutex<QueueState<K, T>>,
    handle: Handle,
}

impl<K, T> QueueInner<K, T>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    T: Send + 'static,
{
    /// Dispatch queued tasks while worker slots are free
    fn pump(self: &Arc<Self>, state: &mut QueueState<K, T>) {
        while state.running < state.concurrency {
            let Some(task) = state.next_queued() else {
                break;
            };
            if !task.shared.advance(TaskState::Running) {
                // Canceled through its handle while waiting
                if state.live.get(&task.key).is_some_and(|s| s.id == task.shared.id) {
                    state.live.remove(&task.key);
                }
                continue;
            }
            state.running += 1;
            let inner = Arc::clone(self);
            self.handle.spawn_blocking(move || inner.run(task));
        }
    }

    fn run(self: Arc<Self>, task: QueuedTask<K, T>) {
        let QueuedTask { key, shared, load, on_complete } = task;

        let result = if shared.cancel.is_canceled() {
            Err(Error::Canceled)
        } else {
            panic::catch_unwind(AssertUnwindSafe(|| load(&shared.cancel)))
                .unwrap_or_else(|_| Err(Error::Runtime(format!("load of {key:?} panicked"))))
        };

        let canceled =
            shared.cancel.is_canceled() || result.as_ref().is_err_and(|e| e.is_canceled());
        let outcome = if canceled {
            TaskState::Canceled
        } else if result.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };

        if canceled {
            log::debug!("Load of {key:?} canceled");
        } else {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| on_complete(key.clone(), result)));
            if delivered.is_err() {
                log::error!("Completion handler for {key:?} panicked");
            }
        }
        shared.advance(outcome);

        let mut state = self.state.lock();
        state.running -= 1;
        if state.live.get(&key).is_some_and(|s| s.id == shared.id) {
            state.live.remove(&key);
        }
        self.pump(&mut state);
    }
}

/// Keyed load queue with HIGH/LOW priorities and a bounded worker pool
pub struct PriorityLoadQueue<K, T> {
    inner: Arc<QueueInner<K, T>>,
    submitted: Mutex<u64>,
    /// Dedicated runtime when not borrowing the caller's
    runtime: Option<Runtime>,
}

impl<K, T> PriorityLoadQueue<K, T>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    T: Send + 'static,
{
    /// Create a queue with its own runtime
    pub fn new(concurrency: usize) -> Result<Self> {
        validate_concurrency(concurrency)?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("brick-load")
            .build()
            .map_err(|e| Error::Runtime(format!("failed to start load runtime: {e}")))?;
        let handle = runtime.handle().clone();
        Ok(Self::build(handle, concurrency, Some(runtime)))
    }

    /// Create a queue that runs its loads on an existing runtime
    pub fn with_handle(handle: Handle, concurrency: usize) -> Result<Self> {
        validate_concurrency(concurrency)?;
        Ok(Self::build(handle, concurrency, None))
    }

    fn build(handle: Handle, concurrency: usize, runtime: Option<Runtime>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    live: HashMap::new(),
                    high: VecDeque::new(),
                    low: VecDeque::new(),
                    running: 0,
                    concurrency,
                    next_id: 0,
                }),
                handle,
            }),
            submitted: Mutex::new(0),
            runtime,
        }
    }

    /// Queue `load` for `key`.
    ///
    /// `on_complete` runs on the worker thread with the load's result, unless
    /// the task is canceled first.
    pub fn submit<L, C>(&self, key: K, priority: LoadPriority, load: L, on_complete: C) -> TaskHandle<K>
    where
        L: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
        C: FnOnce(K, Result<T>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();

        if let Some(existing) = state.live.get(&key).cloned() {
            if existing.is_live() {
                if existing.priority >= priority {
                    return TaskHandle { key, shared: existing };
                }
                log::debug!("Raising load of {key:?} from {:?} to {priority:?}", existing.priority);
                existing.cancel();
                state.drop_queued(existing.id);
            }
        }

        state.next_id += 1;
        *self.submitted.lock() += 1;
        let shared = Arc::new(TaskShared {
            id: state.next_id,
            priority,
            cancel: CancelToken::new(),
            state: Mutex::new(TaskState::Queued),
        });
        let task = QueuedTask {
            key: key.clone(),
            shared: Arc::clone(&shared),
            load: Box::new(load),
            on_complete: Box::new(on_complete),
        };
        match priority {
            LoadPriority::High => state.high.push_back(task),
            LoadPriority::Low => state.low.push_back(task),
        }
        state.live.insert(key.clone(), Arc::clone(&shared));
        self.inner.pump(&mut state);

        TaskHandle { key, shared }
    }

    /// Cancel the live task for `key`, if any
    pub fn cancel(&self, key: &K) -> bool {
        let mut state = self.inner.state.lock();
        let Some(shared) = state.live.remove(key) else {
            return false;
        };
        shared.cancel();
        state.drop_queued(shared.id);
        true
    }

    /// Cancel every queued and running task
    pub fn cancel_all(&self) {
        let mut state = self.inner.state.lock();
        for shared in state.live.values() {
            shared.cancel();
        }
        state.live.clear();
        for task in state.high.drain(..) {
            task.shared.cancel();
        }
        for task in state.low.drain(..) {
            task.shared.cancel();
        }
    }

    /// Resize the worker pool; takes effect as slots free up
    pub fn set_concurrency(&self, concurrency: usize) -> Result<()> {
        validate_concurrency(concurrency)?;
        let mut state = self.inner.state.lock();
        state.concurrency = concurrency;
        self.inner.pump(&mut state);
        Ok(())
    }

    pub fn concurrency(&self) -> usize {
        self.inner.state.lock().concurrency
    }

    /// Tasks waiting for a worker
    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().queued_count()
    }

    /// Tasks holding a worker slot, including canceled ones still returning
    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Nothing queued or running
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.running == 0 && state.queued_count() == 0
    }

    /// Whether `key` has a task that may still run
    pub fn contains(&self, key: &K) -> bool {
        self.priority_of(key).is_some()
    }

    /// Priority of the live task for `key`
    pub fn priority_of(&self, key: &K) -> Option<LoadPriority> {
        let state = self.inner.state.lock();
        state
            .live
            .get(key)
            .filter(|s| s.is_live())
            .map(|s| s.priority)
    }

    /// Tasks created since the queue was built; deduplicated submits don't count
    pub fn submitted_count(&self) -> u64 {
        *self.submitted.lock()
    }
}

impl<K, T> Drop for PriorityLoadQueue<K, T> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            for shared in state.live.values() {
                shared.cancel();
            }
            state.live.clear();
            state.high.clear();
            state.low.clear();
        }
        // Blocked loads are left to finish on their own
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Condvar;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        cv: Condvar,
    }

    impl Gate {
        fn wait(&self) {
            let mut open = self.open.lock();
            while !*open {
                self.cv.wait(&mut open);
            }
        }

        fn open(&self) {
            *self.open.lock() = true;
            self.cv.notify_all();
        }
    }

    fn blocker(queue: &PriorityLoadQueue<u32, u32>, key: u32, gate: &Arc<Gate>) -> TaskHandle<u32> {
        let gate = gate.clone();
        queue.submit(
            key,
            LoadPriority::High,
            move |_| {
                gate.wait();
                Ok(key)
            },
            |_, _| {},
        )
    }

    #[test]
    fn test_respects_concurrency() {
        let queue = PriorityLoadQueue::<u32, u32>::new(2).unwrap();
        let gate = Arc::new(Gate::default());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let (gate, active, peak, done) = (gate.clone(), active.clone(), peak.clone(), done.clone());
            queue.submit(
                i,
                LoadPriority::Low,
                move |_| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    gate.wait();
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                },
                move |key, result| {
                    assert_eq!(result.unwrap(), key);
                    done.fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        assert!(wait_until(|| queue.running_count() == 2));
        assert_eq!(queue.queued_count(), 3);

        gate.open();
        assert!(wait_until(|| done.load(Ordering::SeqCst) == 5));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(wait_until(|| queue.is_idle()));
        assert_eq!(queue.submitted_count(), 5);
    }

    #[test]
    fn test_high_dispatched_before_low() {
        let queue = PriorityLoadQueue::<u32, u32>::new(1).unwrap();
        let gate = Arc::new(Gate::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        blocker(&queue, 0, &gate);
        assert!(wait_until(|| queue.running_count() == 1));

        for (key, priority) in [(1, LoadPriority::Low), (2, LoadPriority::High), (3, LoadPriority::Low)] {
            let order = order.clone();
            queue.submit(key, priority, move |_| Ok(key), move |k, _| order.lock().push(k));
        }

        gate.open();
        assert!(wait_until(|| order.lock().len() == 3));
        assert_eq!(*order.lock(), vec![2, 1, 3]);
    }

    #[test]
    fn test_supersede_runs_once_at_high() {
        let queue = PriorityLoadQueue::<u32, u32>::new(1).unwrap();
        let gate = Arc::new(Gate::default());
        let runs = Arc::new(Mutex::new(Vec::new()));
        blocker(&queue, 0, &gate);
        assert!(wait_until(|| queue.running_count() == 1));

        let submit = |priority| {
            let runs = runs.clone();
            queue.submit(
                7,
                priority,
                move |_| {
                    runs.lock().push(priority);
                    Ok(7)
                },
                |_, _| {},
            )
        };
        let low = submit(LoadPriority::Low);
        let high = submit(LoadPriority::High);
        assert_eq!(low.state(), TaskState::Canceled);
        assert_ne!(low.id(), high.id());
        assert_eq!(queue.priority_of(&7), Some(LoadPriority::High));

        // Lower priority request for a key already queued at HIGH is a no-op
        let again = submit(LoadPriority::Low);
        assert_eq!(again.id(), high.id());

        gate.open();
        assert!(wait_until(|| high.state() == TaskState::Completed));
        assert_eq!(*runs.lock(), vec![LoadPriority::High]);
        assert_eq!(queue.submitted_count(), 3);
    }

    #[test]
    fn test_cancel_queued_task() {
        let queue = PriorityLoadQueue::<u32, u32>::new(1).unwrap();
        let gate = Arc::new(Gate::default());
        let ran = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));
        let first = blocker(&queue, 0, &gate);
        assert!(wait_until(|| queue.running_count() == 1));

        let (r, d) = (ran.clone(), delivered.clone());
        let handle = queue.submit(
            1,
            LoadPriority::Low,
            move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            },
            move |_, _| {
                d.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(queue.contains(&1));
        assert!(queue.cancel(&1));
        assert_eq!(handle.state(), TaskState::Canceled);
        assert!(!queue.contains(&1));
        assert_eq!(queue.queued_count(), 0);

        gate.open();
        assert!(wait_until(|| first.is_finished()));
        assert!(wait_until(|| queue.is_idle()));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_canceled_running_task_not_delivered() {
        let queue = PriorityLoadQueue::<u32, u32>::new(1).unwrap();
        let gate = Arc::new(Gate::default());
        let delivered = Arc::new(AtomicUsize::new(0));

        let (g, d) = (gate.clone(), delivered.clone());
        let handle = queue.submit(
            1,
            LoadPriority::High,
            move |_| {
                g.wait();
                Ok(1)
            },
            move |_, _| {
                d.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(wait_until(|| handle.state() == TaskState::Running));

        handle.cancel();
        assert_eq!(handle.state(), TaskState::Running);
        gate.open();

        assert!(wait_until(|| handle.is_finished()));
        assert_eq!(handle.state(), TaskState::Canceled);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resubmit_after_running_task_canceled() {
        let queue = PriorityLoadQueue::<u32, u32>::new(1).unwrap();
        let gate = Arc::new(Gate::default());
        let delivered = Arc::new(Mutex::new(Vec::new()));

        let first = blocker(&queue, 1, &gate);
        assert!(wait_until(|| first.state() == TaskState::Running));
        first.cancel();
        assert!(!queue.contains(&1));

        let d = delivered.clone();
        let second = queue.submit(1, LoadPriority::High, |_| Ok(11), move |key, result| {
            d.lock().push((key, result.unwrap()));
        });
        assert_ne!(second.id(), first.id());
        assert_eq!(second.state(), TaskState::Queued);
        assert_eq!(queue.priority_of(&1), Some(LoadPriority::High));

        gate.open();
        assert!(wait_until(|| second.is_finished()));
        assert_eq!(first.state(), TaskState::Canceled);
        assert_eq!(second.state(), TaskState::Completed);
        assert_eq!(*delivered.lock(), vec![(1, 11)]);
        assert_eq!(queue.submitted_count(), 2);
    }

    #[test]
    fn test_failed_load_delivered_as_error() {
        let queue = PriorityLoadQueue::<u32, u32>::new(1).unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        let handle = queue.submit(
            3,
            LoadPriority::Low,
            |_| Err(Error::load_decode("b3", "truncated")),
            move |key, result| e.lock().push((key, result.is_err())),
        );

        assert!(wait_until(|| handle.is_finished()));
        assert_eq!(handle.state(), TaskState::Failed);
        assert_eq!(*errors.lock(), vec![(3, true)]);
    }

    #[test]
    fn test_panicking_load_frees_slot() {
        let queue = PriorityLoadQueue::<u32, u32>::new(1).unwrap();
        let bad = queue.submit(1, LoadPriority::High, |_| panic!("boom"), |_, _| {});
        let good = queue.submit(2, LoadPriority::High, |_| Ok(2), |_, _| {});

        assert!(wait_until(|| good.is_finished()));
        assert_eq!(bad.state(), TaskState::Failed);
        assert_eq!(good.state(), TaskState::Completed);
    }

    #[test]
    fn test_set_concurrency() {
        let queue = PriorityLoadQueue::<u32, u32>::new(1).unwrap();
        let gate = Arc::new(Gate::default());
        for key in 0..3 {
            blocker(&queue, key, &gate);
        }
        assert!(wait_until(|| queue.running_count() == 1));

        queue.set_concurrency(3).unwrap();
        assert_eq!(queue.concurrency(), 3);
        assert!(wait_until(|| queue.running_count() == 3));
        assert!(matches!(queue.set_concurrency(0), Err(Error::Configuration(_))));

        gate.open();
        assert!(wait_until(|| queue.is_idle()));
    }

    #[test]
    fn test_cancel_all() {
        let queue = PriorityLoadQueue::<u32, u32>::new(1).unwrap();
        let gate = Arc::new(Gate::default());
        let running = blocker(&queue, 0, &gate);
        let queued = blocker(&queue, 1, &gate);
        assert!(wait_until(|| running.state() == TaskState::Running));

        queue.cancel_all();
        assert_eq!(queued.state(), TaskState::Canceled);
        assert!(!queue.contains(&0));

        gate.open();
        assert!(wait_until(|| running.is_finished()));
        assert_eq!(running.state(), TaskState::Canceled);
    }

    #[test]
    fn test_with_handle() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let queue = PriorityLoadQueue::<u32, u32>::with_handle(runtime.handle().clone(), 2).unwrap();
        let handle = queue.submit(9, LoadPriority::Low, |_| Ok(9), |_, _| {});
        assert!(wait_until(|| handle.state() == TaskState::Completed));
    }
}
