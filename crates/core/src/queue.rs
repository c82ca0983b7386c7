//! Task and result queues bridging HTTP handlers and the scheduler thread.
//!
//! [`TaskQueue`] is a FIFO with a parallel deferred lane for tasks that
//! found no free slot; the scheduler is its only consumer. [`ResultQueue`]
//! carries completed and partial results back, keyed by task id, with a
//! broadcast wake so any handler waiting on one of several ids resumes.
//!
//! Neither queue is ever held together with the other's lock, so there is
//! no ordering concern between them.

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex};

use tracing::trace;

use crate::task::{Task, TaskId, TaskResult};

// ─── Task queue ───────────────────────────────────────────────────────────

#[derive(Default)]
struct TaskQueueInner {
    queue: VecDeque<Task>,
    deferred: VecDeque<Task>,
    next_id: TaskId,
    terminated: bool,
}

impl TaskQueueInner {
    fn assign_id(&mut self, task: &mut Task) -> TaskId {
        if task.id < 0 {
            task.id = self.next_id;
            self.next_id += 1;
        }
        task.id
    }
}

/// FIFO of pending tasks plus the deferred lane.
pub struct TaskQueue {
    inner: Mutex<TaskQueueInner>,
    cond: Condvar,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TaskQueueInner::default()),
            cond: Condvar::new(),
        }
    }

    /// Push a task, assigning an id when it has none. `front` jumps the
    /// queue (cancellations, high-priority metrics).
    pub fn post(&self, mut task: Task, front: bool) -> TaskId {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        let id = inner.assign_id(&mut task);
        trace!(task = id, front, "task posted");
        if front {
            inner.queue.push_front(task);
        } else {
            inner.queue.push_back(task);
        }
        drop(inner);
        self.cond.notify_one();
        id
    }

    /// Atomic bulk post preserving input order.
    pub fn post_many(&self, mut tasks: Vec<Task>, front: bool) -> Vec<TaskId> {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        let ids: Vec<TaskId> = tasks.iter_mut().map(|t| inner.assign_id(t)).collect();
        if front {
            // reversed pushes keep input order at the head
            for task in tasks.into_iter().rev() {
                inner.queue.push_front(task);
            }
        } else {
            for task in tasks {
                inner.queue.push_back(task);
            }
        }
        drop(inner);
        self.cond.notify_one();
        ids
    }

    /// Reserve an id without posting anything.
    pub fn get_new_id(&self) -> TaskId {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Park a task that found no free slot. Ids are never reassigned here.
    pub fn defer(&self, task: Task) {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        trace!(task = task.id, "task deferred");
        inner.deferred.push_back(task);
    }

    /// Move the oldest deferred task back onto the main queue. Invoked once
    /// per slot release.
    pub fn pop_deferred(&self) {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        if let Some(task) = inner.deferred.pop_front() {
            trace!(task = task.id, "deferred task requeued");
            inner.queue.push_back(task);
            drop(inner);
            self.cond.notify_one();
        }
    }

    /// Non-blocking pop for the scheduler drain loop.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        inner.queue.pop_front()
    }

    /// Block until a task is available or the queue is terminated. Returns
    /// `false` when woken by termination with nothing left to drain.
    pub fn wait_nonempty_or_terminated(&self) -> bool {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        while inner.queue.is_empty() && !inner.terminated {
            inner = self.cond.wait(inner).expect("task queue poisoned");
        }
        !inner.queue.is_empty()
    }

    /// Wake everything and let the scheduler loop drain out.
    pub fn terminate(&self) {
        let mut inner = self.inner.lock().expect("task queue poisoned");
        inner.terminated = true;
        drop(inner);
        self.cond.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().expect("task queue poisoned").terminated
    }

    pub fn n_pending(&self) -> usize {
        self.inner.lock().expect("task queue poisoned").queue.len()
    }

    pub fn n_deferred(&self) -> usize {
        self.inner
            .lock()
            .expect("task queue poisoned")
            .deferred
            .len()
    }
}

// ─── Result queue ─────────────────────────────────────────────────────────

#[derive(Default)]
struct ResultQueueInner {
    results: Vec<TaskResult>,
    waiters: HashSet<TaskId>,
    terminated: bool,
}

/// Completed and partial results awaiting pickup by handler threads.
pub struct ResultQueue {
    inner: Mutex<ResultQueueInner>,
    cond: Condvar,
}

/// Why a `recv` returned without a result.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvError {
    Terminated,
}

impl Default for ResultQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ResultQueueInner::default()),
            cond: Condvar::new(),
        }
    }

    pub fn add_waiter(&self, id: TaskId) {
        self.inner
            .lock()
            .expect("result queue poisoned")
            .waiters
            .insert(id);
    }

    pub fn add_waiters(&self, ids: &[TaskId]) {
        let mut inner = self.inner.lock().expect("result queue poisoned");
        inner.waiters.extend(ids.iter().copied());
    }

    /// Deregister interest and drop anything already queued for the id.
    pub fn remove_waiter(&self, id: TaskId) {
        let mut inner = self.inner.lock().expect("result queue poisoned");
        inner.waiters.remove(&id);
        inner.results.retain(|r| r.id != id);
    }

    pub fn remove_waiters(&self, ids: &[TaskId]) {
        let mut inner = self.inner.lock().expect("result queue poisoned");
        for id in ids {
            inner.waiters.remove(id);
        }
        inner.results.retain(|r| !ids.contains(&r.id));
    }

    /// Publish a result and wake all waiters. Results for ids nobody waits
    /// on are dropped; this is what silences post-cancel stragglers.
    pub fn send(&self, result: TaskResult) {
        let mut inner = self.inner.lock().expect("result queue poisoned");
        if !inner.waiters.contains(&result.id) {
            trace!(task = result.id, "result dropped, no waiter");
            return;
        }
        inner.results.push(result);
        drop(inner);
        self.cond.notify_all();
    }

    /// Block until a result for one of `ids` arrives; the earliest sent
    /// match is removed and returned.
    pub fn recv(&self, ids: &[TaskId]) -> Result<TaskResult, RecvError> {
        let mut inner = self.inner.lock().expect("result queue poisoned");
        loop {
            if let Some(at) = inner.results.iter().position(|r| ids.contains(&r.id)) {
                return Ok(inner.results.remove(at));
            }
            if inner.terminated {
                return Err(RecvError::Terminated);
            }
            inner = self.cond.wait(inner).expect("result queue poisoned");
        }
    }

    /// Wake all blocked receivers with [`RecvError::Terminated`].
    pub fn terminate(&self) {
        let mut inner = self.inner.lock().expect("result queue poisoned");
        inner.terminated = true;
        drop(inner);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ResultData, TaskKind};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn marker() -> Task {
        Task::new(TaskKind::NextResponse)
    }

    #[test]
    fn ids_are_monotonic_from_zero() {
        let queue = TaskQueue::new();
        assert_eq!(queue.post(marker(), false), 0);
        assert_eq!(queue.post(marker(), false), 1);
        assert_eq!(queue.get_new_id(), 2);
        assert_eq!(queue.post(marker(), false), 3);
    }

    #[test]
    fn preassigned_id_is_kept() {
        let queue = TaskQueue::new();
        let id = queue.get_new_id();
        let posted = queue.post(Task::with_id(id, TaskKind::NextResponse), false);
        assert_eq!(posted, id);
    }

    #[test]
    fn fifo_order_with_front_insertion() {
        let queue = TaskQueue::new();
        let a = queue.post(marker(), false);
        let b = queue.post(marker(), false);
        let c = queue.post(marker(), true);

        assert_eq!(queue.pop().unwrap().id, c);
        assert_eq!(queue.pop().unwrap().id, a);
        assert_eq!(queue.pop().unwrap().id, b);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn post_many_preserves_order_both_ways() {
        let queue = TaskQueue::new();
        let tail = queue.post(marker(), false);

        let ids = queue.post_many(vec![marker(), marker()], false);
        assert_eq!(queue.pop().unwrap().id, tail);
        assert_eq!(queue.pop().unwrap().id, ids[0]);
        assert_eq!(queue.pop().unwrap().id, ids[1]);

        let tail = queue.post(marker(), false);
        let ids = queue.post_many(vec![marker(), marker()], true);
        assert_eq!(queue.pop().unwrap().id, ids[0]);
        assert_eq!(queue.pop().unwrap().id, ids[1]);
        assert_eq!(queue.pop().unwrap().id, tail);
    }

    #[test]
    fn deferred_returns_in_defer_order() {
        let queue = TaskQueue::new();
        let a = queue.post(marker(), false);
        let b = queue.post(marker(), false);
        let task_a = queue.pop().unwrap();
        let task_b = queue.pop().unwrap();

        queue.defer(task_a);
        queue.defer(task_b);
        assert_eq!(queue.n_deferred(), 2);

        queue.pop_deferred();
        assert_eq!(queue.pop().unwrap().id, a);
        queue.pop_deferred();
        assert_eq!(queue.pop().unwrap().id, b);
        assert_eq!(queue.n_deferred(), 0);
    }

    #[test]
    fn wait_returns_false_on_terminate() {
        let queue = Arc::new(TaskQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_nonempty_or_terminated())
        };
        thread::sleep(Duration::from_millis(20));
        queue.terminate();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn wait_returns_true_on_post() {
        let queue = Arc::new(TaskQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_nonempty_or_terminated())
        };
        thread::sleep(Duration::from_millis(20));
        queue.post(marker(), false);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn recv_gets_result_for_registered_waiter() {
        let results = Arc::new(ResultQueue::new());
        results.add_waiter(7);

        let receiver = {
            let results = Arc::clone(&results);
            thread::spawn(move || results.recv(&[7]))
        };
        thread::sleep(Duration::from_millis(20));
        results.send(TaskResult::finished(7, ResultData::Ok));

        let got = receiver.join().unwrap().unwrap();
        assert_eq!(got.id, 7);
        assert!(got.stop);
    }

    #[test]
    fn results_without_waiter_are_dropped() {
        let results = ResultQueue::new();
        results.send(TaskResult::finished(9, ResultData::Ok));

        // register afterwards; the earlier send must not be visible
        results.add_waiter(9);
        results.send(TaskResult::partial(9, ResultData::Ok));
        let got = results.recv(&[9]).unwrap();
        assert!(!got.stop);
    }

    #[test]
    fn recv_returns_earliest_matching() {
        let results = ResultQueue::new();
        results.add_waiters(&[1, 2]);
        results.send(TaskResult::partial(2, ResultData::Ok));
        results.send(TaskResult::partial(1, ResultData::Ok));

        assert_eq!(results.recv(&[1, 2]).unwrap().id, 2);
        assert_eq!(results.recv(&[1, 2]).unwrap().id, 1);
    }

    #[test]
    fn per_id_send_order_is_preserved() {
        let results = ResultQueue::new();
        results.add_waiter(4);
        results.send(TaskResult::partial(4, ResultData::Ok));
        results.send(TaskResult::finished(4, ResultData::Ok));

        assert!(!results.recv(&[4]).unwrap().stop);
        assert!(results.recv(&[4]).unwrap().stop);
    }

    #[test]
    fn remove_waiter_drops_queued_results() {
        let results = ResultQueue::new();
        results.add_waiter(5);
        results.send(TaskResult::partial(5, ResultData::Ok));
        results.remove_waiter(5);

        // nothing left and new sends are suppressed
        results.send(TaskResult::finished(5, ResultData::Ok));
        results.terminate();
        assert!(matches!(results.recv(&[5]), Err(RecvError::Terminated)));
    }

    #[test]
    fn terminate_unblocks_receivers() {
        let results = Arc::new(ResultQueue::new());
        results.add_waiter(1);
        let receiver = {
            let results = Arc::clone(&results);
            thread::spawn(move || results.recv(&[1]))
        };
        thread::sleep(Duration::from_millis(20));
        results.terminate();
        assert!(matches!(
            receiver.join().unwrap(),
            Err(RecvError::Terminated)
        ));
    }
}
