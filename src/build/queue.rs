//! Bounded task queue shared by the controller and every worker.
//!
//! `try_pop` distinguishes a transiently empty queue from one that will never
//! yield another item, so workers never mistake a slow producer for the end of
//! the build.

use crate::target::BuildTarget;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One entry in the queue.
#[derive(Debug)]
pub enum QueueItem {
    Target(BuildTarget),
    /// End-of-work marker. One is pushed per worker.
    NoMoreWork,
}

/// Result of a non-blocking pop.
#[derive(Debug)]
pub enum Pop {
    Item(QueueItem),
    /// Nothing right now; more may follow.
    Empty,
    /// Closed and drained. Nothing will ever follow.
    Closed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("push on a closed task queue")]
    Closed,
    #[error("termination requested while waiting for queue space")]
    Terminated,
}

struct State {
    items: VecDeque<QueueItem>,
    closed: bool,
}

pub struct TaskQueue {
    state: Mutex<State>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    // Nothing panics while holding the lock, so a poisoned state is still
    // consistent.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, waiting for space. Re-checks `terminate` every `poll`
    /// so a producer never outlives a cancelled build.
    pub fn push(
        &self,
        item: QueueItem,
        terminate: &AtomicBool,
        poll: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(QueueError::Closed);
            }
            if terminate.load(Ordering::Acquire) {
                return Err(QueueError::Terminated);
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                self.not_empty.notify_one();
                return Ok(());
            }
            state = self
                .not_full
                .wait_timeout(state, poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Take the front item. Waits at most `wait` for one to arrive; a zero
    /// wait never blocks.
    pub fn try_pop(&self, wait: Duration) -> Pop {
        let mut state = self.lock();
        if state.items.is_empty() && !state.closed && !wait.is_zero() {
            state = self
                .not_empty
                .wait_timeout_while(state, wait, |s| s.items.is_empty() && !s.closed)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        match state.items.pop_front() {
            Some(item) => {
                self.not_full.notify_one();
                Pop::Item(item)
            }
            None if state.closed => Pop::Closed,
            None => Pop::Empty,
        }
    }

    /// No further pushes. Items already queued are still handed out.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Remove and return everything still queued.
    pub fn drain_remaining(&self) -> Vec<QueueItem> {
        let drained: Vec<QueueItem> = self.lock().items.drain(..).collect();
        self.not_full.notify_all();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetId;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn target(n: usize) -> QueueItem {
        QueueItem::Target(BuildTarget::new(
            TargetId::new(format!("mod{}", n), "m4"),
            "/src",
            format!("mod{}", n),
        ))
    }

    const POLL: Duration = Duration::from_millis(5);

    #[test]
    fn test_fifo_and_empty() {
        let q = TaskQueue::new(4);
        let flag = AtomicBool::new(false);
        assert!(matches!(q.try_pop(Duration::ZERO), Pop::Empty));

        q.push(target(1), &flag, POLL).unwrap();
        q.push(target(2), &flag, POLL).unwrap();
        q.push(QueueItem::NoMoreWork, &flag, POLL).unwrap();
        assert_eq!(q.len(), 3);

        match q.try_pop(Duration::ZERO) {
            Pop::Item(QueueItem::Target(t)) => assert_eq!(t.id.module, "mod1"),
            other => panic!("unexpected {:?}", other),
        }
        match q.try_pop(Duration::ZERO) {
            Pop::Item(QueueItem::Target(t)) => assert_eq!(t.id.module, "mod2"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            q.try_pop(Duration::ZERO),
            Pop::Item(QueueItem::NoMoreWork)
        ));
        assert!(matches!(q.try_pop(POLL), Pop::Empty));
    }

    #[test]
    fn test_closed_drains_before_reporting_closed() {
        let q = TaskQueue::new(4);
        let flag = AtomicBool::new(false);
        q.push(target(1), &flag, POLL).unwrap();
        q.close();

        assert_eq!(q.push(target(2), &flag, POLL), Err(QueueError::Closed));
        assert!(matches!(q.try_pop(POLL), Pop::Item(_)));
        assert!(matches!(q.try_pop(POLL), Pop::Closed));
    }

    #[test]
    fn test_full_push_gives_up_on_termination() {
        let q = TaskQueue::new(1);
        let flag = AtomicBool::new(false);
        q.push(target(1), &flag, POLL).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(30));
                flag.store(true, Ordering::Release);
            });
            assert_eq!(q.push(target(2), &flag, POLL), Err(QueueError::Terminated));
        });
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_full_push_resumes_after_pop() {
        let q = TaskQueue::new(1);
        let flag = AtomicBool::new(false);
        q.push(target(1), &flag, POLL).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                assert!(matches!(q.try_pop(Duration::ZERO), Pop::Item(_)));
            });
            q.push(target(2), &flag, POLL).unwrap();
        });
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_no_double_dequeue_under_contention() {
        const TARGETS: usize = 500;
        const WORKERS: usize = 8;

        let q = Arc::new(TaskQueue::new(16));
        let flag = AtomicBool::new(false);
        let taken: Vec<Vec<String>> = std::thread::scope(|s| {
            let consumers: Vec<_> = (0..WORKERS)
                .map(|_| {
                    let q = Arc::clone(&q);
                    s.spawn(move || {
                        let mut mine = Vec::new();
                        loop {
                            match q.try_pop(POLL) {
                                Pop::Item(QueueItem::Target(t)) => mine.push(t.id.module),
                                Pop::Item(QueueItem::NoMoreWork) | Pop::Closed => break,
                                Pop::Empty => {}
                            }
                        }
                        mine
                    })
                })
                .collect();

            for n in 0..TARGETS {
                q.push(target(n), &flag, POLL).unwrap();
            }
            for _ in 0..WORKERS {
                q.push(QueueItem::NoMoreWork, &flag, POLL).unwrap();
            }
            consumers.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let all: Vec<String> = taken.into_iter().flatten().collect();
        let unique: HashSet<&String> = all.iter().collect();
        assert_eq!(all.len(), TARGETS);
        assert_eq!(unique.len(), TARGETS);
    }

    #[test]
    fn test_drain_remaining() {
        let q = TaskQueue::new(8);
        let flag = AtomicBool::new(false);
        for n in 0..3 {
            q.push(target(n), &flag, POLL).unwrap();
        }
        assert_eq!(q.drain_remaining().len(), 3);
        assert!(q.is_empty());
    }
}
