//! Hand work to a single reactor thread from anywhere.
//!
//! A [`WorkScheduler`] sits on a [`Reactor`] and lets any thread queue
//! callbacks to run on the reactor's thread, either on its next turn
//! ([`SchedulerHandle::submit_immediate`]) or after a delay
//! ([`SchedulerHandle::submit_delayed`]). Delayed work is driven by one
//! kernel countdown timer that is only reprogrammed when the earliest
//! deadline changes.
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use tl_workqueue::{DelayedWork, Reactor, WorkScheduler};
//!
//! let reactor = Arc::new(Reactor::new()?);
//! let scheduler = WorkScheduler::new(&reactor)?;
//!
//! let work = DelayedWork::new();
//! scheduler.submit_delayed(&work, 10, || println!("ten milliseconds later"))?;
//! while work.is_pending() {
//!     reactor.turn(Some(Duration::from_millis(100)))?;
//! }
//! scheduler.shutdown()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
#![deny(unsafe_code)]

mod error;
mod ready;
mod scheduler;
mod timers;
mod work;

/// The readiness loop work is delivered on
pub mod reactor;

pub use error::{Error, TimerListError};
pub use reactor::{io::Event, Reactor, ReactorConfig};
pub use scheduler::{SchedulerHandle, WorkScheduler};
pub use timers::{TimerHandle, TimerList, TimerListGuard};
pub use work::{DelayedWork, Work, WorkState};
