#![allow(unsafe_code)]

#[cfg(test)]
use std::sync::atomic::AtomicBool;
use std::{
    io,
    mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

/// A one-shot kernel countdown on the monotonic clock.
///
/// The descriptor becomes readable once the programmed duration elapses.
/// It is created non-blocking, so reading it before then fails with
/// `WouldBlock`.
#[derive(Debug)]
pub(crate) struct CountdownTimer {
    fd: OwnedFd,
    /// Make `set` and `disarm` fail as if the kernel rejected them.
    #[cfg(test)]
    pub fail_set: AtomicBool,
    /// Make `read_expirations` fail as if the read errored.
    #[cfg(test)]
    pub fail_read: AtomicBool,
}

#[cfg(test)]
fn injected(fault: &AtomicBool) -> io::Result<()> {
    if fault.load(std::sync::atomic::Ordering::Acquire) {
        return Err(io::Error::from_raw_os_error(libc::EIO));
    }
    Ok(())
}

impl CountdownTimer {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall with constant arguments; the result is checked below
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: timerfd_create just returned this descriptor and nothing else owns it
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            fd,
            #[cfg(test)]
            fail_set: AtomicBool::new(false),
            #[cfg(test)]
            fail_read: AtomicBool::new(false),
        })
    }

    /// Fire once after `duration`. A zero duration disarms the timer.
    pub fn set(&self, duration: Duration) -> io::Result<()> {
        #[cfg(test)]
        injected(&self.fail_set)?;

        let spec = libc::itimerspec {
            it_interval: timespec(Duration::ZERO),
            it_value: timespec(duration),
        };
        // SAFETY: `fd` is an open timerfd, `spec` outlives the call and the
        // old-value pointer may be null
        let ret = unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn disarm(&self) -> io::Result<()> {
        self.set(Duration::ZERO)
    }

    /// Consume the number of expirations since the last read.
    pub fn read_expirations(&self) -> io::Result<u64> {
        #[cfg(test)]
        injected(&self.fail_read)?;

        let mut expirations: u64 = 0;
        // SAFETY: the buffer is a live, exclusively borrowed u64 and the length
        // passed is exactly its size
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != mem::size_of::<u64>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("short read of {n} bytes from timerfd"),
            ));
        }
        Ok(expirations)
    }
}

impl AsRawFd for CountdownTimer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

// Duration is already normalized: whole seconds plus nanoseconds below one second.
fn timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: duration.subsec_nanos() as _,
    }
}
