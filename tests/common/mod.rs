#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use tl_workqueue::Reactor;

/// Turn `reactor` on the current thread until `done` holds or `timeout` passes.
pub fn turn_until(reactor: &Reactor, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        reactor.turn(Some(Duration::from_millis(5))).unwrap();
    }
    true
}

/// Wait on the current thread, without turning anything, until `done` holds.
pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

/// A reactor driven by its own thread until dropped.
pub struct EventLoop {
    pub reactor: Arc<Reactor>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn spawn() -> Self {
        let reactor = Arc::new(Reactor::new().unwrap());
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let reactor = reactor.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    reactor.turn(Some(Duration::from_millis(5))).unwrap();
                }
            })
        };
        Self {
            reactor,
            stop,
            thread: Some(thread),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread.as_ref().unwrap().thread().id()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
