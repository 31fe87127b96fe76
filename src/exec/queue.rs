//! Running/completed task queues shared between the submitting worker and
//! the device's completion thread.
//!
//! One mutex guards both lists plus an in-flight count; it is held only for
//! list splices, never across device calls. A condvar wakes the consumer
//! when a completion lands. Failed tasks go to the *front* of the completed
//! list so the consumer drains the error before buffered successes; normal
//! completions append and preserve order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use super::task::ScanTask;

struct QueueState {
    running: Vec<ScanTask>,
    completed: VecDeque<ScanTask>,
    /// Tasks submitted but not yet on the completed list. Counts tasks a
    /// callback has spliced off `running` but not yet pushed, so waiters
    /// never conclude "nothing in flight" during that window.
    in_flight: usize,
}

pub(crate) struct TaskQueues {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl TaskQueues {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                running: Vec::new(),
                completed: VecDeque::new(),
                in_flight: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Insert a freshly submitted task into the running list.
    pub(crate) fn push_running(&self, task: ScanTask) {
        let mut state = self.state.lock().expect("task queue lock");
        state.in_flight += 1;
        state.running.push(task);
    }

    /// Splice a task off the running list. `None` if the abort path got to
    /// it first.
    pub(crate) fn remove_running(&self, id: u64) -> Option<ScanTask> {
        let mut state = self.state.lock().expect("task queue lock");
        let pos = state.running.iter().position(|t| t.id() == id)?;
        Some(state.running.swap_remove(pos))
    }

    /// Splice off a task whose submission never left the host and drop it
    /// from the in-flight count, so waiters do not hang on work that will
    /// never complete.
    pub(crate) fn cancel_running(&self, id: u64) -> Option<ScanTask> {
        let mut state = self.state.lock().expect("task queue lock");
        let pos = state.running.iter().position(|t| t.id() == id)?;
        state.in_flight = state.in_flight.saturating_sub(1);
        let task = state.running.swap_remove(pos);
        drop(state);
        self.ready.notify_all();
        Some(task)
    }

    /// Push a finished task onto the completed list and wake the consumer.
    /// `priority` puts it at the front ("error -- prioritize draining").
    pub(crate) fn push_completed(&self, task: ScanTask, priority: bool) {
        let mut state = self.state.lock().expect("task queue lock");
        state.in_flight = state.in_flight.saturating_sub(1);
        if priority {
            state.completed.push_front(task);
        } else {
            state.completed.push_back(task);
        }
        drop(state);
        self.ready.notify_all();
    }

    /// Non-blocking pop of the next finished task.
    pub(crate) fn pop_completed(&self) -> Option<ScanTask> {
        self.state.lock().expect("task queue lock").completed.pop_front()
    }

    /// Block until a finished task is available. Returns `None` when the
    /// scan died (`live` cleared) or when nothing is in flight to wait for.
    pub(crate) fn wait_completed(&self, live: &AtomicBool) -> Option<ScanTask> {
        let mut state = self.state.lock().expect("task queue lock");
        loop {
            if let Some(task) = state.completed.pop_front() {
                return Some(task);
            }
            if !live.load(Ordering::Acquire) || state.in_flight == 0 {
                return None;
            }
            state = self.ready.wait(state).expect("task queue lock");
        }
    }

    /// Empty both lists (abort path) and wake every waiter. Callbacks still
    /// holding a spliced-off task finish on their own; the in-flight count
    /// resets so waiters stop immediately.
    pub(crate) fn drain_all(&self) -> Vec<ScanTask> {
        let mut state = self.state.lock().expect("task queue lock");
        let mut tasks: Vec<ScanTask> = state.running.drain(..).collect();
        tasks.extend(state.completed.drain(..));
        state.in_flight = 0;
        drop(state);
        self.ready.notify_all();
        tasks
    }

    /// Tasks submitted and not yet drained by the consumer.
    pub(crate) fn in_flight(&self) -> usize {
        self.state.lock().expect("task queue lock").in_flight
    }
}

// ============================================================================
// Tests
// ============================================================================
