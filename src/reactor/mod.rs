pub mod io;
pub(crate) mod timerfd;

use std::{
    io::ErrorKind,
    os::fd::RawFd,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use chashmap::CHashMap;
use mio::unix::SourceFd;
use parking_lot::Mutex;

use self::io::{Event, Handler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorConfig {
    /// How many readiness events a single turn can collect.
    pub event_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            event_capacity: 128,
        }
    }
}

/// Single-threaded readiness loop.
///
/// Descriptors may be registered and deregistered from any thread, but
/// [`Reactor::turn`] must only ever be driven by one thread: every handler
/// runs on it.
pub struct Reactor {
    poll: Mutex<mio::Poll>,
    events: Mutex<mio::Events>,
    registry: mio::Registry,
    handlers: CHashMap<mio::Token, Handler>,
    next_token: AtomicUsize,
}

impl Reactor {
    pub fn new() -> std::io::Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    pub fn with_config(config: ReactorConfig) -> std::io::Result<Self> {
        let poll = mio::Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            poll: Mutex::new(poll),
            events: Mutex::new(mio::Events::with_capacity(config.event_capacity)),
            registry,
            handlers: CHashMap::new(),
            next_token: AtomicUsize::new(0),
        })
    }

    /// Watch `fd` for `interest` and call `handler` whenever it is ready.
    pub fn register(
        &self,
        fd: RawFd,
        interest: mio::Interest,
        handler: Handler,
    ) -> std::io::Result<mio::Token> {
        let token = mio::Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.handlers.insert(token, handler);
        if let Err(err) = self.registry.register(&mut SourceFd(&fd), token, interest) {
            self.handlers.remove(&token);
            return Err(err);
        }
        tracing::trace!(fd, token = token.0, "registered");
        Ok(token)
    }

    pub fn deregister(&self, fd: RawFd, token: mio::Token) -> std::io::Result<()> {
        self.handlers.remove(&token);
        self.registry.deregister(&mut SourceFd(&fd))?;
        tracing::trace!(fd, token = token.0, "deregistered");
        Ok(())
    }

    /// Polls the OS for readiness once and runs the handler of every ready
    /// descriptor. Returns how many handlers ran.
    pub fn turn(&self, timeout: Option<Duration>) -> std::io::Result<usize> {
        let ready: Vec<(mio::Token, Event)> = {
            let mut poll = self.poll.lock();
            let mut events = self.events.lock();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(0),
                Err(err) => return Err(err),
            }
            events.iter().map(|e| (e.token(), e.into())).collect()
        };

        let mut n = 0;
        for (token, event) in ready {
            // clone out of the map so handlers may (de)register without deadlocking
            let handler = match self.handlers.get(&token) {
                Some(handler) => handler.clone(),
                None => continue,
            };
            handler(event);
            n += 1;
        }
        Ok(n)
    }
}
