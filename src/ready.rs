use std::{
    io::{self, Read, Write},
    os::fd::{AsRawFd, RawFd},
    sync::Arc,
};

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use mio::unix::pipe;
use parking_lot::Mutex;

use crate::{error::Error, work::WorkCell};

/// One submission waiting to run on the reactor thread.
pub(crate) struct Ready {
    pub work: Arc<WorkCell>,
    pub ticket: u64,
}

impl Ready {
    pub fn run(self) -> bool {
        self.work.run(self.ticket)
    }
}

/// Work queued for the reactor thread, in push order.
///
/// Every push also rings a non-blocking pipe whose read end the reactor
/// watches; the bytes carry no data, they only make the pipe readable.
pub(crate) struct Queue {
    sender: UnboundedSender<Ready>,
    receiver: Mutex<UnboundedReceiver<Ready>>,
    doorbell: pipe::Sender,
    bell: pipe::Receiver,
    /// Make `clear` fail as if reading the doorbell errored.
    #[cfg(test)]
    pub fail_clear: std::sync::atomic::AtomicBool,
}

impl Queue {
    pub fn new() -> io::Result<Self> {
        let (doorbell, bell) = pipe::new()?;
        let (sender, receiver) = unbounded();
        Ok(Self {
            sender,
            receiver: Mutex::new(receiver),
            doorbell,
            bell,
            #[cfg(test)]
            fail_clear: Default::default(),
        })
    }

    /// The descriptor that turns readable when work is pushed.
    pub fn bell_fd(&self) -> RawFd {
        self.bell.as_raw_fd()
    }

    pub fn push(&self, ready: Ready) -> Result<(), Error> {
        self.sender
            .unbounded_send(ready)
            .map_err(|_| Error::Closed)?;
        loop {
            match (&self.doorbell).write(&[1]) {
                Ok(1) => return Ok(()),
                Ok(n) => {
                    return Err(Error::Notify(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("wrote {n} bytes to doorbell"),
                    )))
                }
                // a full pipe already guarantees a wakeup
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Notify(err)),
            }
        }
    }

    /// Consume every pending doorbell byte.
    pub fn clear(&self) -> io::Result<()> {
        #[cfg(test)]
        injected(&self.fail_clear)?;

        let mut buf = [0u8; 64];
        loop {
            match (&self.bell).read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "doorbell closed",
                    ))
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    pub fn pop(&self) -> Option<Ready> {
        match self.receiver.lock().try_next() {
            Ok(ready) => ready,
            Err(_) => None,
        }
    }

    /// Stop accepting pushes. Work already queued can still be popped.
    pub fn close(&self) {
        self.sender.close_channel();
    }
}

#[cfg(test)]
fn injected(fault: &std::sync::atomic::AtomicBool) -> io::Result<()> {
    if fault.load(std::sync::atomic::Ordering::Acquire) {
        return Err(io::Error::from_raw_os_error(libc::EIO));
    }
    Ok(())
}
