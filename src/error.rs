use std::io;

use thiserror::Error;

use crate::timers::TimerHandle;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create countdown timer")]
    Timer(#[source] io::Error),

    #[error("failed to create notification channel")]
    Channel(#[source] io::Error),

    #[error("failed to register {what} with the reactor")]
    Register {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to deregister from the reactor")]
    Deregister(#[source] io::Error),

    #[error("work is already pending")]
    AlreadyPending,

    #[error("work is not pending")]
    NotPending,

    #[error("delayed work was submitted through another scheduler")]
    ForeignScheduler,

    #[error("scheduler has been shut down")]
    Closed,

    #[error("failed to notify the reactor")]
    Notify(#[source] io::Error),

    #[error("failed to reprogram the countdown timer")]
    Rearm(#[source] io::Error),

    #[error(transparent)]
    Timers(#[from] TimerListError),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimerListError {
    #[error("timer list is closed")]
    Closed,

    #[error("deadline is too far in the future")]
    DeadlineOverflow,

    #[error("timer {0:?} is not scheduled")]
    NotFound(TimerHandle),
}
