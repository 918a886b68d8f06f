//! Bounded drop-oldest channel for the video/audio demux (spec §4.3: "a full
//! video channel drops the *oldest* pending frame (keep-newest)"). `tokio`'s
//! `mpsc` only offers backpressure or immediate-reject on full, neither of
//! which keep-newest requires, so this is a small purpose-built queue rather
//! than a borrowed abstraction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

pub struct DropOldestSender<T> {
    inner: Arc<Inner<T>>,
}

pub struct DropOldestReceiver<T> {
    inner: Arc<Inner<T>>,
}

pub fn drop_oldest_channel<T>(capacity: usize) -> (DropOldestSender<T>, DropOldestReceiver<T>) {
    let inner = Arc::new(Inner {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        notify: Notify::new(),
        closed: AtomicBool::new(false),
    });
    (DropOldestSender { inner: inner.clone() }, DropOldestReceiver { inner })
}

impl<T> DropOldestSender<T> {
    /// Pushes an item, silently dropping the oldest queued item if the
    /// channel is already at capacity.
    pub fn push(&self, item: T) {
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
        drop(queue);
        self.inner.notify.notify_one();
    }

    /// Marks the channel closed; the receiver drains remaining items then
    /// observes end-of-stream.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }
}

impl<T> Clone for DropOldestSender<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DropOldestReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut queue = self.inner.queue.lock().unwrap();
                if let Some(item) = queue.pop_front() {
                    return Some(item);
                }
                if self.inner.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_oldest_when_over_capacity() {
        let (tx, mut rx) = drop_oldest_channel(2);
        tx.push(1);
        tx.push(2);
        tx.push(3); // 1 is dropped
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn closed_and_drained_yields_none() {
        let (tx, mut rx) = drop_oldest_channel::<u8>(2);
        tx.push(5);
        tx.close();
        assert_eq!(rx.recv().await, Some(5));
        assert_eq!(rx.recv().await, None);
    }
}
