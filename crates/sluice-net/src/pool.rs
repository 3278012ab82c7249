use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tracing::debug;

use crate::conn::Conn;

/// How often the recycle thread scans for records whose dwell elapsed.
pub(crate) const RECYCLE_SCAN_INTERVAL: Duration = Duration::from_millis(200);

struct RecycleEntry {
    slot: usize,
    since: Instant,
}

/// Fixed-size pool of connection records.
///
/// Checkout pops a slot from the free list and stamps a fresh sequence.
/// Teardown goes through the recycle list: a closed record waits out the
/// configured dwell before rejoining the free list, so readiness events
/// still queued for its old fd can never land on a new session. The free
/// list and recycle list each have their own mutex; both operations are
/// constant-time under their lock.
pub(crate) struct ConnPool {
    slots: Box<[Mutex<Conn>]>,
    free: Mutex<Vec<usize>>,
    recycle: Mutex<VecDeque<RecycleEntry>>,
    dwell: Duration,
    next_sequence: AtomicU64,
}

impl ConnPool {
    pub(crate) fn new(capacity: usize, dwell: Duration) -> Self {
        let slots = (0..capacity).map(|_| Mutex::new(Conn::unbound())).collect();
        // Reversed so slot 0 is handed out first.
        let free = (0..capacity).rev().collect();
        Self {
            slots,
            free: Mutex::new(free),
            recycle: Mutex::new(VecDeque::new()),
            dwell,
            next_sequence: AtomicU64::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub(crate) fn slot(&self, slot: usize) -> &Mutex<Conn> {
        &self.slots[slot]
    }

    /// Pops a record from the free list and stamps its new generation.
    /// Returns `None` when the pool is exhausted; binding the socket is the
    /// caller's job.
    pub(crate) fn checkout(&self) -> Option<usize> {
        let slot = self.free.lock().unwrap().pop()?;
        let mut conn = self.slots[slot].lock().unwrap();
        conn.sequence = self.bump_sequence();
        conn.reset_recv();
        conn.clear_send();
        Some(slot)
    }

    /// Tears the record down and parks it on the recycle list.
    ///
    /// The caller already holds the slot lock. Taking the stream here drops
    /// it, which is the only close of the fd; a second call on an already
    /// unbound record is a no-op. The sequence bump makes every envelope
    /// still in flight for the old session stale.
    pub(crate) fn defer_release(&self, slot: usize, conn: &mut Conn) {
        if conn.stream.take().is_none() {
            return;
        }
        conn.sequence = self.bump_sequence();
        conn.reset_recv();
        conn.clear_send();
        conn.peer_addr = None;
        conn.listener = None;
        conn.flags = crate::notifier::EventFlags::empty();
        self.recycle.lock().unwrap().push_back(RecycleEntry { slot, since: Instant::now() });
    }

    /// Recycle-thread pass: returns every record whose dwell elapsed to the
    /// free list. Entries are age-ordered, so the scan stops at the first
    /// one still dwelling.
    pub(crate) fn release_expired(&self, now: Instant) -> usize {
        let mut released = 0;
        loop {
            let slot = {
                let mut recycle = self.recycle.lock().unwrap();
                match recycle.front() {
                    Some(entry) if now.duration_since(entry.since) >= self.dwell => {
                        recycle.pop_front().unwrap().slot
                    }
                    _ => break,
                }
            };
            self.free.lock().unwrap().push(slot);
            released += 1;
        }
        if released > 0 {
            debug!(released, "pool: recycled connection records");
        }
        released
    }

    pub(crate) fn recycle_len(&self) -> usize {
        self.recycle.lock().unwrap().len()
    }

    fn bump_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }
}
