use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{error::Error, timers::TimerHandle};

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Where a piece of work is in its submit / run / cancel cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkState {
    /// Never submitted.
    Idle = 0,
    /// Submitted and waiting for the reactor thread.
    Pending = 1,
    /// Cancelled before the reactor thread claimed it.
    Cancelled = 2,
    /// The callback is executing on the reactor thread.
    Running = 3,
    /// The callback has returned.
    Done = 4,
}

impl WorkState {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => WorkState::Idle,
            1 => WorkState::Pending,
            2 => WorkState::Cancelled,
            3 => WorkState::Running,
            _ => WorkState::Done,
        }
    }
}

const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

// the ticket lives in the bits above the state byte
fn pack(ticket: u64, state: WorkState) -> u64 {
    (ticket << STATE_BITS) | state as u64
}

fn unpack(word: u64) -> (u64, WorkState) {
    (word >> STATE_BITS, WorkState::from_bits(word & STATE_MASK))
}

/// Shared state behind a [`Work`] handle.
///
/// Every submission bumps a ticket stored next to the state, so a message or
/// timer entry left over from an earlier submission can never claim a later one.
/// Transitions out of `Pending`, and into it, happen with the callback slot
/// locked; `Running -> Done` is a lone compare-and-swap.
#[derive(Default)]
pub(crate) struct WorkCell {
    state: AtomicU64,
    callback: Mutex<Option<Callback>>,
}

impl WorkCell {
    pub(crate) fn state(&self) -> WorkState {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    /// Store `callback` and mark the work pending. Returns the new ticket.
    ///
    /// Allowed from every state but `Pending`, including from inside the
    /// work's own running callback.
    pub(crate) fn arm(&self, callback: Callback) -> Result<u64, Error> {
        let mut slot = self.callback.lock();
        let (ticket, state) = unpack(self.state.load(Ordering::Acquire));
        if state == WorkState::Pending {
            return Err(Error::AlreadyPending);
        }

        let ticket = ticket.wrapping_add(1) & (u64::MAX >> STATE_BITS);
        *slot = Some(callback);
        // a racing `Running -> Done` is overwritten, which is what we want
        self.state
            .store(pack(ticket, WorkState::Pending), Ordering::Release);
        Ok(ticket)
    }

    /// Withdraw a pending submission. The stored callback is dropped.
    pub(crate) fn cancel(&self) -> Result<(), Error> {
        let callback = {
            let mut slot = self.callback.lock();
            let (ticket, state) = unpack(self.state.load(Ordering::Acquire));
            if state != WorkState::Pending {
                return Err(Error::NotPending);
            }
            self.state
                .compare_exchange(
                    pack(ticket, WorkState::Pending),
                    pack(ticket, WorkState::Cancelled),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .map_err(|_| Error::NotPending)?;
            slot.take()
        };
        drop(callback);
        Ok(())
    }

    /// Claim submission `ticket` and run its callback on the calling thread.
    ///
    /// Returns false without running anything if that submission was
    /// cancelled, already ran, or has been superseded.
    pub(crate) fn run(&self, ticket: u64) -> bool {
        let callback = {
            let mut slot = self.callback.lock();
            let claimed = self.state.compare_exchange(
                pack(ticket, WorkState::Pending),
                pack(ticket, WorkState::Running),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if claimed.is_err() {
                return false;
            }
            slot.take()
        };

        if let Some(callback) = callback {
            callback();
        }

        // fails if the callback resubmitted its own work, which must stay pending
        let _ = self.state.compare_exchange(
            pack(ticket, WorkState::Running),
            pack(ticket, WorkState::Done),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        true
    }
}

/// A unit of work that can be handed to the reactor thread.
///
/// Cloning yields another handle to the same work; the scheduler keeps a
/// clone only while a submission is in flight. A `Work` can be submitted
/// again once it has run or been cancelled.
#[derive(Clone, Default)]
pub struct Work(pub(crate) Arc<WorkCell>);

impl Work {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkState {
        self.0.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == WorkState::Pending
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work").field("state", &self.state()).finish()
    }
}

/// Work that runs after a delay.
///
/// Remembers the timer entry of its latest submission so it can be cancelled.
#[derive(Clone, Default)]
pub struct DelayedWork {
    pub(crate) work: Work,
    pub(crate) timer: Arc<Mutex<Option<TimerHandle>>>,
}

impl DelayedWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkState {
        self.work.state()
    }

    pub fn is_pending(&self) -> bool {
        self.work.is_pending()
    }
}

impl fmt::Debug for DelayedWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedWork")
            .field("state", &self.state())
            .field("timer", &*self.timer.lock())
            .finish()
    }
}
