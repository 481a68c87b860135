use std::{
    cmp::Reverse,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, MutexGuard};

use crate::error::TimerListError;

/// Identifies one scheduled entry in a [`TimerList`].
///
/// Carries the identity of the list that issued it; any other list treats it
/// as not found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    list: u64,
    seq: u64,
}

static NEXT_LIST: AtomicU64 = AtomicU64::new(0);

// (deadline, insertion sequence); reversed so the earliest entry sits at the end
type Deadline = Reverse<(Instant, u64)>;
type TimerQueue<T> = PriorityQueue<T, Deadline>;

struct Timers<T> {
    id: u64,
    queue: TimerQueue<T>,
    next_seq: u64,
    closed: bool,
}

impl<T> Timers<T> {
    /// Pop the earliest entry if it was due at `now` and was inserted
    /// before the current expiry pass started.
    fn pop_due(&mut self, now: Instant, limit: u64) -> Option<(TimerHandle, T)> {
        let PriorityQueueEntry(_, Reverse((deadline, seq))) = self.queue.last()?;
        if *deadline > now || *seq >= limit {
            return None;
        }
        let PriorityQueueEntry(item, Reverse((_, seq))) = self.queue.pop()?;
        Some((
            TimerHandle {
                list: self.id,
                seq,
            },
            item,
        ))
    }
}

/// Pending deadlines ordered by expiry, ties broken by insertion order.
pub struct TimerList<T>(Mutex<Timers<T>>);

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        Self(Mutex::new(Timers {
            id: NEXT_LIST.fetch_add(1, Ordering::Relaxed),
            queue: Vec::new(),
            next_seq: 0,
            closed: false,
        }))
    }
}

impl<T> TimerList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> TimerListGuard<'_, T> {
        TimerListGuard(self.0.lock())
    }

    /// Remove every entry that is due and hand it to `fire`, earliest first.
    ///
    /// The lock is released while `fire` runs, so it may insert new entries.
    /// Those are never expired by the same pass, even with a zero duration.
    /// Returns the number of entries fired.
    pub fn expire_due(&self, mut fire: impl FnMut(TimerHandle, T)) -> usize {
        let (now, limit) = {
            let timers = self.0.lock();
            (Instant::now(), timers.next_seq)
        };

        let mut fired = 0;
        loop {
            let due = self.0.lock().pop_due(now, limit);
            match due {
                Some((handle, item)) => {
                    fire(handle, item);
                    fired += 1;
                }
                None => break fired,
            }
        }
    }

    /// Refuse further inserts and hand back every entry still scheduled.
    pub fn close(&self) -> Vec<T> {
        let mut timers = self.0.lock();
        timers.closed = true;
        timers
            .queue
            .drain(..)
            .map(|PriorityQueueEntry(item, _)| item)
            .collect()
    }
}

/// Exclusive access to a [`TimerList`]. Unlocks on drop.
pub struct TimerListGuard<'a, T>(MutexGuard<'a, Timers<T>>);

impl<'a, T> TimerListGuard<'a, T> {
    /// Schedule `item` to expire `duration` from now.
    pub fn insert_duration(
        &mut self,
        duration: Duration,
        item: T,
    ) -> Result<TimerHandle, TimerListError> {
        if self.0.closed {
            return Err(TimerListError::Closed);
        }
        let deadline = Instant::now()
            .checked_add(duration)
            .ok_or(TimerListError::DeadlineOverflow)?;

        let seq = self.0.next_seq;
        self.0.next_seq += 1;

        let entry = PriorityQueueEntry(item, Reverse((deadline, seq)));
        let queue = &mut self.0.queue;
        let index = match queue.binary_search(&entry) {
            Ok(index) => index,
            Err(index) => index,
        };
        queue.insert(index, entry);
        Ok(TimerHandle {
            list: self.0.id,
            seq,
        })
    }

    /// Whether `handle` was issued by this list. Says nothing about whether
    /// its entry is still scheduled.
    pub fn issued(&self, handle: TimerHandle) -> bool {
        handle.list == self.0.id
    }

    pub fn remove(&mut self, handle: TimerHandle) -> Result<T, TimerListError> {
        if !self.issued(handle) {
            return Err(TimerListError::NotFound(handle));
        }
        let index = self
            .0
            .queue
            .iter()
            .position(|PriorityQueueEntry(_, Reverse((_, seq)))| *seq == handle.seq)
            .ok_or(TimerListError::NotFound(handle))?;
        let PriorityQueueEntry(item, _) = self.0.queue.remove(index);
        Ok(item)
    }

    pub fn is_empty(&self) -> bool {
        self.0.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.queue.len()
    }

    /// Time left until the earliest deadline. Zero if it has already passed,
    /// `None` if nothing is scheduled.
    pub fn until_next(&self) -> Option<Duration> {
        let PriorityQueueEntry(_, Reverse((deadline, _))) = self.0.queue.last()?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }
}

struct PriorityQueueEntry<I, P>(I, P);
impl<I, P: PartialEq> PartialEq for PriorityQueueEntry<I, P> {
    fn eq(&self, other: &Self) -> bool {
        self.1 == other.1
    }
}
impl<I, P: Eq> Eq for PriorityQueueEntry<I, P> {}
impl<I, P: PartialOrd> PartialOrd for PriorityQueueEntry<I, P> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.1.partial_cmp(&other.1)
    }
}

impl<I, P: Ord> Ord for PriorityQueueEntry<I, P> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.1.cmp(&other.1)
    }
}

type PriorityQueue<I, P> = Vec<PriorityQueueEntry<I, P>>;
