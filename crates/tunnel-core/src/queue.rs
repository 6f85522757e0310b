use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// A bounded FIFO of byte chunks shared between a VC's reader and writer
/// threads, with a timeout-aware `push`. `std::sync::mpsc::sync_channel`
/// has no timed send, so backpressure (spec §4.5's `PUT_TIMEOUT`) is built
/// directly on a mutex and a pair of condvars instead.
pub struct BoundedQueue {
    state: Mutex<State>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

struct State {
    items: VecDeque<Vec<u8>>,
    closed: bool,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State { items: VecDeque::with_capacity(capacity), closed: false }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Blocks until there is room, the queue is closed, or `timeout`
    /// elapses. Returns `Err` on timeout (the caller treats this as queue
    /// overflow) or if the queue was already closed.
    pub fn push_timeout(&self, item: Vec<u8>, timeout: Duration) -> Result<(), ()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while guard.items.len() >= self.capacity {
            if guard.closed {
                return Err(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(());
            }
            let (next, timeout_result) =
                self.not_full.wait_timeout(guard, remaining).unwrap_or_else(|e| e.into_inner());
            guard = next;
            if timeout_result.timed_out() && guard.items.len() >= self.capacity {
                return Err(());
            }
        }
        if guard.closed {
            return Err(());
        }
        guard.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until an item is available or the queue is closed and empty.
    pub fn pop(&self) -> Option<Vec<u8>> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = guard.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if guard.closed {
                return None;
            }
            guard = self.not_empty.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Signals the writer to drain whatever is left and exit; further
    /// pushes fail.
    pub fn close(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.closed = true;
        drop(guard);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_is_preserved() {
        let queue = Arc::new(BoundedQueue::new(4));
        for i in 0..3u8 {
            queue.push_timeout(vec![i], Duration::from_millis(100)).unwrap();
        }
        assert_eq!(queue.pop(), Some(vec![0]));
        assert_eq!(queue.pop(), Some(vec![1]));
        assert_eq!(queue.pop(), Some(vec![2]));
    }

    #[test]
    fn push_times_out_when_full_and_uncollected() {
        let queue = BoundedQueue::new(1);
        queue.push_timeout(vec![0], Duration::from_millis(50)).unwrap();
        let start = Instant::now();
        let result = queue.push_timeout(vec![1], Duration::from_millis(50));
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn close_lets_pop_drain_then_return_none() {
        let queue = Arc::new(BoundedQueue::new(4));
        queue.push_timeout(vec![9], Duration::from_millis(50)).unwrap();
        queue.close();
        assert_eq!(queue.pop(), Some(vec![9]));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn blocked_pop_is_released_by_close() {
        let queue = Arc::new(BoundedQueue::new(4));
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(reader.join().unwrap(), None);
    }
}
