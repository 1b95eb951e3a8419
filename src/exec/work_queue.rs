use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use uuid::Uuid;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Uuid>,
    /// ids handed to a worker that haven't been marked done yet.
    in_flight: usize,
    closed: bool,
}

/// Ready queue shared by the workers of one stage.
///
/// A worker that pops an id must call [`WorkQueue::task_done`] once it has
/// pushed everything that id unblocked. `pop` returns `None` once the queue
/// is closed, or once it is empty with nothing in flight that could refill it.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl WorkQueue {
    pub fn new(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: ids.into_iter().collect(),
                ..Default::default()
            }),
            changed: Condvar::new(),
        }
    }

    // a worker that panicked while holding the lock can't have left the
    // state inconsistent, so keep going with it.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, id: Uuid) {
        let mut state = self.lock();
        if state.closed || state.ready.contains(&id) {
            return;
        }
        state.ready.push_back(id);
        self.changed.notify_one();
    }

    /// Block until an id is ready, or until no more work can arrive.
    pub fn pop(&self) -> Option<Uuid> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(id) = state.ready.pop_front() {
                state.in_flight += 1;
                return Some(id);
            }
            if state.in_flight == 0 {
                return None;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn task_done(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.changed.notify_all();
    }

    /// Stop handing out work. Ids already popped still finish.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.changed.notify_all();
    }
}
