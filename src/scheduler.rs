use std::{
    io,
    ops::Deref,
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    error::{Error, TimerListError},
    reactor::{
        io::{Event, Registration},
        timerfd::CountdownTimer,
        Reactor,
    },
    ready::{self, Ready},
    timers::{TimerList, TimerListGuard},
    work::{Callback, DelayedWork, Work},
};

// shortest countdown the kernel will treat as armed rather than as "disarm"
const MIN_COUNTDOWN: Duration = Duration::from_nanos(1);

struct Shared {
    timer: CountdownTimer,
    queue: ready::Queue,
    timers: TimerList<Ready>,
    /// Set while the reactor thread expires timers; rearming waits until the pass ends.
    in_expiry: AtomicBool,
    /// Whether `timer` currently has a countdown programmed.
    armed: AtomicBool,
}

impl Shared {
    fn new() -> Result<Self, Error> {
        Ok(Self {
            timer: CountdownTimer::new().map_err(Error::Timer)?,
            queue: ready::Queue::new().map_err(Error::Channel)?,
            timers: TimerList::new(),
            in_expiry: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        })
    }

    fn submit_immediate(&self, work: &Work, callback: Callback) -> Result<(), Error> {
        let ticket = work.0.arm(callback)?;
        let ready = Ready {
            work: work.0.clone(),
            ticket,
        };
        match self.queue.push(ready) {
            Ok(()) => Ok(()),
            Err(Error::Closed) => {
                // nothing will ever run it
                let _ = work.0.cancel();
                Err(Error::Closed)
            }
            Err(err) => {
                tracing::error!(%err, "failed to queue work");
                Err(err)
            }
        }
    }

    fn submit_delayed(
        &self,
        work: &DelayedWork,
        delay_ms: u64,
        callback: Callback,
    ) -> Result<(), Error> {
        let mut timers = self.timers.lock();

        let ticket = work.work.0.arm(callback)?;
        let entry = Ready {
            work: work.work.0.clone(),
            ticket,
        };
        let handle = match timers.insert_duration(Duration::from_millis(delay_ms), entry) {
            Ok(handle) => handle,
            Err(err) => {
                let _ = work.work.0.cancel();
                return Err(match err {
                    TimerListError::Closed => Error::Closed,
                    err => {
                        tracing::error!(%err, delay_ms, "adding delayed work failed");
                        err.into()
                    }
                });
            }
        };
        *work.timer.lock() = Some(handle);

        // the entry stays scheduled even if this fails; a later rearm picks it up
        self.rearm(&timers).map_err(|err| {
            tracing::error!(%err, "failed to rearm countdown timer");
            Error::Rearm(err)
        })
    }

    fn cancel_delayed(&self, work: &DelayedWork) -> Result<(), Error> {
        // stop the countdown before taking the lock
        self.disarm();

        let mut timers = self.timers.lock();
        let mut slot = work.timer.lock();
        let stored = *slot;
        let cancelled = match stored {
            // its entry lives in another scheduler's list; leave both alone
            Some(handle) if !timers.issued(handle) => Err(Error::ForeignScheduler),
            _ => {
                let cancelled = work.work.0.cancel();
                if let Some(handle) = slot.take() {
                    if let Err(err) = timers.remove(handle) {
                        tracing::debug!(%err, "delayed work already left the timer list");
                    }
                }
                cancelled
            }
        };
        drop(slot);

        let rearmed = self.rearm(&timers).map_err(|err| {
            tracing::error!(%err, "failed to rearm countdown timer");
            Error::Rearm(err)
        });
        cancelled.and(rearmed)
    }

    /// Program the countdown for the earliest pending deadline.
    ///
    /// Requires the timer list lock, witnessed by `timers`.
    fn rearm(&self, timers: &TimerListGuard<'_, Ready>) -> io::Result<()> {
        if self.in_expiry.load(Ordering::Acquire) || timers.is_empty() {
            return Ok(());
        }
        let Some(until_next) = timers.until_next() else {
            return Ok(());
        };

        // a deadline that already passed still goes through the event loop
        self.timer.set(until_next.max(MIN_COUNTDOWN))?;
        self.armed.store(true, Ordering::Release);
        tracing::trace!(?until_next, "countdown armed");
        Ok(())
    }

    fn disarm(&self) {
        if !self.armed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.timer.disarm() {
            tracing::error!(%err, "failed to disarm countdown timer");
        }
        // cleared even on failure, so the next rearm is never skipped
        self.armed.store(false, Ordering::Release);
    }

    /// Doorbell readable: run everything queued for the reactor thread.
    fn on_ready(&self) {
        if let Err(err) = self.queue.clear() {
            tracing::error!(%err, "failed to read from doorbell");
            return;
        }

        let mut ran = 0usize;
        while let Some(ready) = self.queue.pop() {
            if ready.run() {
                ran += 1;
            }
        }
        tracing::trace!(ran, "drained immediate work");
    }

    /// Countdown readable: run everything that is due, then rearm.
    fn on_timer(&self) {
        match self.timer.read_expirations() {
            Ok(expirations) => tracing::trace!(expirations, "countdown fired"),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!("spurious countdown wakeup");
                return;
            }
            Err(err) => {
                tracing::error!(%err, "failed to read from countdown timer");
                return;
            }
        }

        self.in_expiry.store(true, Ordering::Release);
        let fired = self.timers.expire_due(|_, ready| {
            ready.run();
        });

        let timers = self.timers.lock();
        self.in_expiry.store(false, Ordering::Release);
        // the countdown is one-shot, so it is no longer armed
        self.armed.store(false, Ordering::Release);
        if let Err(err) = self.rearm(&timers) {
            tracing::error!(%err, "failed to rearm countdown timer");
        }
        drop(timers);
        tracing::trace!(fired, "expired delayed work");
    }
}

/// Submits work to a [`WorkScheduler`] from any thread.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Run `f` on the reactor thread during its next turn.
    ///
    /// Fails with [`Error::AlreadyPending`] if `work` is still waiting from an
    /// earlier submission. If notifying the reactor fails the work stays
    /// pending, but there is no guarantee it will run.
    pub fn submit_immediate<F>(&self, work: &Work, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit_immediate(work, Box::new(f))
    }

    /// Withdraw `work` if the reactor thread has not claimed it yet.
    ///
    /// Returns [`Error::NotPending`] if it already ran, was already cancelled
    /// or was never submitted.
    pub fn cancel_immediate(&self, work: &Work) -> Result<(), Error> {
        work.0.cancel()
    }

    /// Run `f` on the reactor thread once `delay_ms` milliseconds have passed.
    ///
    /// A zero delay still waits for the next timer tick; `f` never runs inside
    /// this call. If reprogramming the kernel timer fails the work remains
    /// scheduled and [`Error::Rearm`] is returned.
    pub fn submit_delayed<F>(&self, work: &DelayedWork, delay_ms: u64, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit_delayed(work, delay_ms, Box::new(f))
    }

    /// Withdraw delayed `work`. Cancelling before its deadline guarantees it
    /// never runs; cancelling after it fired returns [`Error::NotPending`].
    ///
    /// Work last submitted through a different scheduler is left untouched and
    /// [`Error::ForeignScheduler`] is returned.
    pub fn cancel_delayed(&self, work: &DelayedWork) -> Result<(), Error> {
        self.shared.cancel_delayed(work)
    }

    /// Whether the kernel countdown is currently programmed.
    pub fn timer_armed(&self) -> bool {
        self.shared.armed.load(Ordering::Acquire)
    }

    /// Number of delayed submissions waiting for their deadline.
    pub fn pending_timers(&self) -> usize {
        self.shared.timers.lock().len()
    }
}

/// Runs immediate and delayed work on a [`Reactor`]'s thread.
///
/// Owns a kernel countdown timer and a notification pipe, both registered
/// with the reactor for as long as the scheduler lives. All submission
/// methods come from [`SchedulerHandle`] through `Deref`; clone a handle with
/// [`WorkScheduler::handle`] to submit from other threads.
pub struct WorkScheduler {
    handle: SchedulerHandle,
    registrations: Option<(Registration, Registration)>,
}

impl WorkScheduler {
    pub fn new(reactor: &Arc<Reactor>) -> Result<Self, Error> {
        Self::attach(reactor, Arc::new(Shared::new()?))
    }

    fn attach(reactor: &Arc<Reactor>, shared: Arc<Shared>) -> Result<Self, Error> {
        let timer_fd = shared.timer.as_raw_fd();
        let bell_fd = shared.queue.bell_fd();

        let on_timer = {
            let shared = shared.clone();
            Arc::new(move |_: Event| shared.on_timer())
        };
        let timer_registration =
            Registration::new(reactor, timer_fd, mio::Interest::READABLE, on_timer).map_err(
                |source| Error::Register {
                    what: "countdown timer",
                    source,
                },
            )?;

        let on_ready = {
            let shared = shared.clone();
            Arc::new(move |_: Event| shared.on_ready())
        };
        // on failure the timer registration above is dropped, which deregisters it
        let ready_registration =
            Registration::new(reactor, bell_fd, mio::Interest::READABLE, on_ready).map_err(
                |source| Error::Register {
                    what: "notification channel",
                    source,
                },
            )?;

        tracing::debug!(timer_fd, bell_fd, "work scheduler created");
        Ok(Self {
            handle: SchedulerHandle { shared },
            registrations: Some((timer_registration, ready_registration)),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Tear the scheduler down, reporting whether deregistration succeeded.
    ///
    /// Resources are released either way. Work still pending is cancelled and
    /// submissions through surviving handles fail with [`Error::Closed`].
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), Error> {
        let Some((timer_registration, ready_registration)) = self.registrations.take() else {
            return Ok(());
        };
        let shared = &self.handle.shared;

        shared.queue.close();
        shared.disarm();

        let timer = timer_registration.deregister().map_err(|err| {
            tracing::error!(%err, "failed to deregister countdown timer");
            err
        });
        let ready = ready_registration.deregister().map_err(|err| {
            tracing::error!(%err, "failed to deregister notification channel");
            err
        });

        let mut abandoned = 0usize;
        for entry in shared.timers.close() {
            abandoned += entry.work.cancel().is_ok() as usize;
        }
        while let Some(entry) = shared.queue.pop() {
            abandoned += entry.work.cancel().is_ok() as usize;
        }

        tracing::debug!(abandoned, "work scheduler shut down");
        timer.and(ready).map_err(Error::Deregister)
    }
}

impl Deref for WorkScheduler {
    type Target = SchedulerHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for WorkScheduler {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            tracing::warn!(%err, "work scheduler teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn scheduler() -> WorkScheduler {
        let reactor = Arc::new(Reactor::new().unwrap());
        WorkScheduler::new(&reactor).unwrap()
    }

    #[test]
    fn disarm_twice_is_safe() {
        let scheduler = scheduler();
        let work = DelayedWork::new();
        scheduler.submit_delayed(&work, 10_000, || {}).unwrap();
        assert!(scheduler.timer_armed());

        scheduler.handle.shared.disarm();
        assert!(!scheduler.timer_armed());
        scheduler.handle.shared.disarm();
        assert!(!scheduler.timer_armed());
    }

    #[test]
    fn rearm_without_timers_stays_disarmed() {
        let scheduler = scheduler();
        let shared = &scheduler.handle.shared;
        shared.rearm(&shared.timers.lock()).unwrap();
        assert!(!scheduler.timer_armed());
    }

    #[test]
    fn rearm_is_deferred_during_expiry() {
        let scheduler = scheduler();
        let shared = &scheduler.handle.shared;

        shared.in_expiry.store(true, Ordering::Release);
        scheduler
            .submit_delayed(&DelayedWork::new(), 10_000, || {})
            .unwrap();
        assert!(!scheduler.timer_armed());
        assert_eq!(scheduler.pending_timers(), 1);

        shared.in_expiry.store(false, Ordering::Release);
        shared.rearm(&shared.timers.lock()).unwrap();
        assert!(scheduler.timer_armed());
    }

    #[test]
    fn cancel_removes_entry_and_disarms() {
        let scheduler = scheduler();
        let work = DelayedWork::new();
        scheduler.submit_delayed(&work, 10_000, || {}).unwrap();

        scheduler.cancel_delayed(&work).unwrap();
        assert_eq!(scheduler.pending_timers(), 0);
        assert!(!scheduler.timer_armed());
        assert!(matches!(
            scheduler.cancel_delayed(&work),
            Err(Error::NotPending)
        ));
    }

    #[test]
    fn cancel_keeps_countdown_for_remaining_work() {
        let scheduler = scheduler();
        let first = DelayedWork::new();
        let second = DelayedWork::new();
        scheduler.submit_delayed(&first, 10_000, || {}).unwrap();
        scheduler.submit_delayed(&second, 20_000, || {}).unwrap();

        scheduler.cancel_delayed(&first).unwrap();
        assert_eq!(scheduler.pending_timers(), 1);
        assert!(scheduler.timer_armed());
    }

    #[test]
    fn zero_delay_never_runs_inline() {
        let scheduler = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let work = DelayedWork::new();
        scheduler
            .submit_delayed(&work, 0, move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(work.is_pending());
        assert!(scheduler.timer_armed());
    }

    #[test]
    fn expiry_runs_due_work_and_clears_armed() {
        let scheduler = scheduler();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let work = DelayedWork::new();
        scheduler
            .submit_delayed(&work, 0, move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        scheduler.handle.shared.on_timer();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!scheduler.timer_armed());
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn failed_rearm_keeps_entry_and_armed_flag() {
        let scheduler = scheduler();
        let shared = &scheduler.handle.shared;

        shared.timer.fail_set.store(true, Ordering::Release);
        let first = DelayedWork::new();
        assert!(matches!(
            scheduler.submit_delayed(&first, 10_000, || {}),
            Err(Error::Rearm(_))
        ));
        assert!(first.is_pending());
        assert_eq!(scheduler.pending_timers(), 1);
        assert!(!scheduler.timer_armed());

        shared.timer.fail_set.store(false, Ordering::Release);
        let second = DelayedWork::new();
        scheduler.submit_delayed(&second, 20_000, || {}).unwrap();
        assert!(scheduler.timer_armed());

        shared.timer.fail_set.store(true, Ordering::Release);
        let third = DelayedWork::new();
        assert!(matches!(
            scheduler.submit_delayed(&third, 5_000, || {}),
            Err(Error::Rearm(_))
        ));
        assert!(third.is_pending());
        assert_eq!(scheduler.pending_timers(), 3);
        assert!(scheduler.timer_armed());
    }

    #[test]
    fn failed_disarm_still_clears_armed_flag() {
        let scheduler = scheduler();
        let shared = &scheduler.handle.shared;
        scheduler
            .submit_delayed(&DelayedWork::new(), 10_000, || {})
            .unwrap();
        assert!(scheduler.timer_armed());

        shared.timer.fail_set.store(true, Ordering::Release);
        shared.disarm();
        assert!(!scheduler.timer_armed());
    }

    #[test]
    fn unreadable_countdown_skips_the_expiry_pass() {
        let scheduler = scheduler();
        let shared = &scheduler.handle.shared;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let work = DelayedWork::new();
        scheduler
            .submit_delayed(&work, 0, move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        shared.timer.fail_read.store(true, Ordering::Release);
        shared.on_timer();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(work.is_pending());
        assert!(scheduler.timer_armed());

        shared.timer.fail_read.store(false, Ordering::Release);
        shared.on_timer();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn doorbell_read_error_ends_the_drain() {
        let scheduler = scheduler();
        let shared = &scheduler.handle.shared;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let work = Work::new();
        scheduler
            .submit_immediate(&work, move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        shared.queue.fail_clear.store(true, Ordering::Release);
        shared.on_ready();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(work.is_pending());

        shared.queue.fail_clear.store(false, Ordering::Release);
        shared.on_ready();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(work.state(), crate::WorkState::Done);
    }

    #[test]
    fn failed_second_registration_unwinds_the_first() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let shared = Arc::new(Shared::new().unwrap());

        // epoll refuses a descriptor that is already registered
        let squatter = Registration::new(
            &reactor,
            shared.queue.bell_fd(),
            mio::Interest::READABLE,
            Arc::new(|_: Event| {}),
        )
        .unwrap();

        match WorkScheduler::attach(&reactor, shared.clone()) {
            Err(Error::Register { what, .. }) => assert_eq!(what, "notification channel"),
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("attach succeeded with the doorbell already registered"),
        }
        // no handler closure kept a reference
        assert_eq!(Arc::strong_count(&shared), 1);

        // the countdown timer was deregistered, so it can be registered again
        let timer = Registration::new(
            &reactor,
            shared.timer.as_raw_fd(),
            mio::Interest::READABLE,
            Arc::new(|_: Event| {}),
        )
        .unwrap();
        timer.deregister().unwrap();
        squatter.deregister().unwrap();
    }

    #[test]
    fn resubmit_then_cancel_leaves_no_entries() {
        let scheduler = scheduler();
        let work = DelayedWork::new();

        scheduler.submit_delayed(&work, 60_000, || {}).unwrap();
        scheduler.cancel_delayed(&work).unwrap();
        scheduler.submit_delayed(&work, 60_000, || {}).unwrap();
        scheduler.cancel_delayed(&work).unwrap();

        assert_eq!(work.state(), crate::WorkState::Cancelled);
        assert_eq!(scheduler.pending_timers(), 0);
        assert!(!scheduler.timer_armed());
    }

    #[test]
    fn shutdown_cancels_pending_work() {
        let scheduler = scheduler();
        let handle = scheduler.handle();
        let delayed = DelayedWork::new();
        let immediate = Work::new();
        scheduler.submit_delayed(&delayed, 10_000, || {}).unwrap();
        scheduler.submit_immediate(&immediate, || {}).unwrap();

        scheduler.shutdown().unwrap();
        assert_eq!(delayed.state(), crate::WorkState::Cancelled);
        assert_eq!(immediate.state(), crate::WorkState::Cancelled);

        assert!(matches!(
            handle.submit_immediate(&Work::new(), || {}),
            Err(Error::Closed)
        ));
        assert!(matches!(
            handle.submit_delayed(&DelayedWork::new(), 1, || {}),
            Err(Error::Closed)
        ));
    }
}
