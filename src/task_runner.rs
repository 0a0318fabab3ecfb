//! A single threaded task loop: an mpsc channel for immediate tasks plus a heap of delayed
//! ones. Each thread of the profiler owns one and processes tasks strictly one at a time.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, SendError, Sender};
use std::time::{Duration, Instant};

/// Cloneable handle for posting tasks onto a [`TaskRunner`] from anywhere.
pub struct TaskSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for TaskSender<T> {
    fn clone(&self) -> Self {
        TaskSender {
            tx: self.tx.clone(),
        }
    }
}

impl<T> TaskSender<T> {
    /// Posts `task`. Fails only if the runner is gone, in which case there is nobody left to
    /// care about the task.
    pub fn post(&self, task: T) -> Result<(), SendError<T>> {
        self.tx.send(task)
    }
}

struct DelayedTask<T> {
    deadline: Instant,
    seq: u64,
    task: T,
}

impl<T> PartialEq for DelayedTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for DelayedTask<T> {}

impl<T> PartialOrd for DelayedTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DelayedTask<T> {
    // Reversed so the BinaryHeap pops the earliest deadline first, FIFO among equal deadlines.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct TaskRunner<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    delayed: BinaryHeap<DelayedTask<T>>,
    next_seq: u64,
}

impl<T> Default for TaskRunner<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskRunner<T> {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        TaskRunner {
            tx,
            rx,
            delayed: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn sender(&self) -> TaskSender<T> {
        TaskSender {
            tx: self.tx.clone(),
        }
    }

    pub fn post(&self, task: T) {
        // We hold a receiver, so this can't fail.
        let _ = self.tx.send(task);
    }

    pub fn post_delayed(&mut self, task: T, delay: Duration) {
        self.delayed.push(DelayedTask {
            deadline: Instant::now() + delay,
            seq: self.next_seq,
            task,
        });
        self.next_seq += 1;
    }

    fn pop_expired(&mut self, now: Instant) -> Option<T> {
        if self.delayed.peek()?.deadline <= now {
            return self.delayed.pop().map(|d| d.task);
        }
        None
    }

    /// Blocks until the next task is runnable. Expired delayed tasks run before newly posted
    /// immediate ones.
    pub fn next_task(&mut self) -> T {
        loop {
            let now = Instant::now();
            if let Some(task) = self.pop_expired(now) {
                return task;
            }
            let res = match self.delayed.peek() {
                Some(next) => self.rx.recv_timeout(next.deadline - now),
                // Never disconnected, we hold a sender ourselves.
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match res {
                Ok(task) => return task,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => continue,
            }
        }
    }

    /// Like [`next_task`](Self::next_task) but gives up after `timeout`.
    pub fn next_task_timeout(&mut self, timeout: Duration) -> Option<T> {
        let give_up = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if let Some(task) = self.pop_expired(now) {
                return Some(task);
            }
            if now >= give_up {
                return None;
            }
            let wait = match self.delayed.peek() {
                Some(next) => (next.deadline - now).min(give_up - now),
                None => give_up - now,
            };
            match self.rx.recv_timeout(wait) {
                Ok(task) => return Some(task),
                Err(_) => continue,
            }
        }
    }

    /// Returns a task that is runnable right now, if any.
    pub fn try_next_task(&mut self) -> Option<T> {
        if let Some(task) = self.pop_expired(Instant::now()) {
            return Some(task);
        }
        self.rx.try_recv().ok()
    }

    pub fn pending_delayed(&self) -> usize {
        self.delayed.len()
    }

    /// Drops every delayed task for which `keep` returns false.
    pub fn retain_delayed<F: FnMut(&T) -> bool>(&mut self, mut keep: F) {
        self.delayed.retain(|delayed| keep(&delayed.task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_tasks_in_order() {
        let mut runner = TaskRunner::new();
        runner.post(1);
        runner.sender().post(2).unwrap();
        assert_eq!(runner.next_task(), 1);
        assert_eq!(runner.next_task(), 2);
        assert_eq!(runner.try_next_task(), None);
    }

    #[test]
    fn test_delayed_tasks_by_deadline() {
        let mut runner = TaskRunner::new();
        runner.post_delayed("late", Duration::from_millis(30));
        runner.post_delayed("early", Duration::from_millis(10));
        runner.post_delayed("early2", Duration::from_millis(10));
        assert_eq!(runner.try_next_task(), None);
        assert_eq!(runner.next_task(), "early");
        assert_eq!(runner.next_task(), "early2");
        assert_eq!(runner.next_task(), "late");
        assert_eq!(runner.pending_delayed(), 0);
    }

    #[test]
    fn test_posted_task_wakes_sleeping_runner() {
        let mut runner = TaskRunner::new();
        runner.post_delayed(0, Duration::from_secs(60));
        let sender = runner.sender();
        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            sender.post(1).unwrap();
        });
        assert_eq!(runner.next_task(), 1);
        poster.join().unwrap();
    }

    #[test]
    fn test_next_task_timeout() {
        let mut runner: TaskRunner<u32> = TaskRunner::new();
        assert_eq!(runner.next_task_timeout(Duration::from_millis(5)), None);
        runner.post_delayed(7, Duration::from_millis(1));
        assert_eq!(runner.next_task_timeout(Duration::from_secs(5)), Some(7));
    }

    #[test]
    fn test_retain_delayed() {
        let mut runner = TaskRunner::new();
        for task in [1, 2, 3, 4] {
            runner.post_delayed(task, Duration::from_millis(task));
        }
        runner.retain_delayed(|task| task % 2 == 0);
        assert_eq!(runner.pending_delayed(), 2);
        assert_eq!(runner.next_task(), 2);
        assert_eq!(runner.next_task(), 4);
    }
}
