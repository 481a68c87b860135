use std::{io, os::fd::RawFd, sync::Arc};

use super::Reactor;

/// Readiness reported for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event(u8);
impl Event {
    const READABLE: u8 = 1;
    const READ_CLOSED: u8 = 2;

    pub fn is_readable(&self) -> bool {
        self.0 & Self::READABLE != 0 || self.is_read_closed()
    }
    pub fn is_read_closed(&self) -> bool {
        self.0 & Self::READ_CLOSED != 0
    }
}

impl From<&mio::event::Event> for Event {
    fn from(e: &mio::event::Event) -> Self {
        let mut event = 0;
        event |= (e.is_readable() as u8) * Event::READABLE;
        event |= (e.is_read_closed() as u8) * Event::READ_CLOSED;
        Event(event)
    }
}

/// Called on the reactor thread each time its descriptor reports readiness.
pub type Handler = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// Keeps a descriptor registered with a [`Reactor`] until dropped.
///
/// The descriptor itself is not owned; it must stay open for as long as the
/// registration lives.
pub struct Registration {
    reactor: Arc<Reactor>,
    token: mio::Token,
    fd: RawFd,
    active: bool,
}

impl Registration {
    pub fn new(
        reactor: &Arc<Reactor>,
        fd: RawFd,
        interest: mio::Interest,
        handler: Handler,
    ) -> io::Result<Self> {
        let token = reactor.register(fd, interest, handler)?;
        Ok(Self {
            reactor: reactor.clone(),
            token,
            fd,
            active: true,
        })
    }

    /// Deregister now, reporting failure instead of only logging it.
    pub fn deregister(mut self) -> io::Result<()> {
        self.active = false;
        self.reactor.deregister(self.fd, self.token)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.reactor.deregister(self.fd, self.token) {
            tracing::warn!(fd = self.fd, token = self.token.0, %err, "failed to deregister");
        }
    }
}
