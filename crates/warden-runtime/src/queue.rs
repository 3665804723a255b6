//! Bounded pipeline queues with explicit overflow policy. Real-time stages
//! prefer fresh data (drop-oldest); best-effort stages shed new load
//! (drop-newest).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Drop-oldest bounded queue: a full queue discards its oldest element to
/// make room, so the consumer always sees the freshest items.
pub struct RtQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for RtQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> RtQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Push, discarding the oldest queued item on overflow. Returns true when
    /// something was dropped.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => false,
            Err(TrySendError::Full(item)) => {
                let _ = self.rx.try_recv();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                // a racing consumer may have emptied the slot already
                let _ = self.tx.try_send(item);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn pop(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drop-newest bounded queue: a full queue rejects the incoming item. The
/// producer decides whether that deserves a warning.
pub struct LossyQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    rejected: Arc<AtomicU64>,
}

impl<T> Clone for LossyQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            rejected: self.rejected.clone(),
        }
    }
}

impl<T> LossyQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Push unless full; true on success.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rt_queue_never_exceeds_capacity_and_drops_oldest() {
        let q: RtQueue<u32> = RtQueue::new(2);
        for i in 0..30 {
            q.push(i);
            assert!(q.len() <= 2, "queue length must stay bounded");
        }
        assert_eq!(q.dropped(), 28);
        // the two most recent survive
        assert_eq!(q.try_pop(), Some(28));
        assert_eq!(q.try_pop(), Some(29));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn rt_queue_under_capacity_drops_nothing() {
        let q: RtQueue<u32> = RtQueue::new(4);
        q.push(1);
        q.push(2);
        assert_eq!(q.dropped(), 0);
        assert_eq!(q.try_pop(), Some(1));
    }

    #[test]
    fn lossy_queue_rejects_newest_when_full() {
        let q: LossyQueue<u32> = LossyQueue::new(2);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(!q.push(3));
        assert_eq!(q.rejected(), 1);
        // oldest content is intact
        assert_eq!(q.pop(Duration::from_millis(10)), Some(1));
        assert_eq!(q.pop(Duration::from_millis(10)), Some(2));
    }

    #[test]
    fn stalled_consumer_keeps_only_freshest_frames() {
        // a 1 s stall at 30 FPS: at least 28 of 30 frames dropped,
        // the 2 newest retained
        let q: RtQueue<u64> = RtQueue::new(2);
        for frame_id in 0..30u64 {
            q.push(frame_id);
        }
        assert!(q.dropped() >= 28);
        let survivors: Vec<u64> = std::iter::from_fn(|| q.try_pop()).collect();
        assert_eq!(survivors, vec![28, 29]);
    }
}
