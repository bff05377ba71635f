//! Hand-off point between the transport's read task and the command issuer.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::warn;

/// A completed reply line tagged with its arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedLine {
    /// Arrival order, counted from the first line since startup.
    pub seq: u64,
    /// Line text without terminator.
    pub text: String,
}

#[derive(Debug, Default)]
struct QueueInner {
    lines: VecDeque<QueuedLine>,
    next_seq: u64,
}

/// Bounded, ordered queue of reply lines plus the wake signal.
///
/// `push` is called from the transport's delivery context and never blocks
/// on anything but the short internal lock. When the queue is full the
/// oldest line is dropped.
#[derive(Debug)]
pub struct ReplyQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl ReplyQueue {
    /// Creates a queue holding at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a completed line and wake the waiting sender, if any.
    pub fn push(&self, text: String) -> u64 {
        let seq = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            if inner.lines.len() >= self.capacity {
                if let Some(dropped) = inner.lines.pop_front() {
                    warn!(seq = dropped.seq, line = %dropped.text, "Reply queue full, dropping oldest line");
                }
            }
            inner.lines.push_back(QueuedLine { seq, text });
            seq
        };
        self.notify.notify_waiters();
        seq
    }

    /// Remove and return everything queued.
    pub fn drain(&self) -> Vec<QueuedLine> {
        self.inner.lock().lines.drain(..).collect()
    }

    /// Take the oldest line and clear the rest, returning both.
    pub fn take_first(&self) -> Option<(QueuedLine, Vec<QueuedLine>)> {
        let mut inner = self.inner.lock();
        let first = inner.lines.pop_front()?;
        let extras = inner.lines.drain(..).collect();
        Some((first, extras))
    }

    /// Number of lines waiting.
    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    /// True when no line is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The wake signal. Waiters must create and `enable` their `Notified`
    /// future before the command is written; `push` does not store permits.
    pub(crate) fn notify(&self) -> &Notify {
        &self.notify
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_increase() {
        let queue = ReplyQueue::new(8);
        assert_eq!(queue.push("a".into()), 0);
        assert_eq!(queue.push("b".into()), 1);
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.push("c".into()), 2);
    }

    #[test]
    fn test_take_first_clears_extras() {
        let queue = ReplyQueue::new(8);
        queue.push("ok".into());
        queue.push("late".into());
        queue.push("later".into());

        let (first, extras) = queue.take_first().unwrap();
        assert_eq!(first.text, "ok");
        assert_eq!(extras.len(), 2);
        assert!(queue.is_empty());
        assert!(queue.take_first().is_none());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let queue = ReplyQueue::new(2);
        queue.push("1".into());
        queue.push("2".into());
        queue.push("3".into());
        let lines: Vec<_> = queue.drain().into_iter().map(|l| l.text).collect();
        assert_eq!(lines, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_enabled_waiter_sees_push() {
        let queue = std::sync::Arc::new(ReplyQueue::new(8));
        let notified = queue.notify().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let q = queue.clone();
        tokio::spawn(async move {
            q.push("ok".into());
        });

        notified.await;
        assert_eq!(queue.len(), 1);
    }
}
