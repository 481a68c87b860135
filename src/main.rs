use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use rand::Rng;
use tl_workqueue::{DelayedWork, Reactor, Work, WorkScheduler};

const PRODUCERS: usize = 10;
const MAX_DELAY_MS: u64 = 2000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let reactor = Arc::new(Reactor::new()?);
    let scheduler = WorkScheduler::new(&reactor)?;

    let stop = Arc::new(AtomicBool::new(false));
    let event_loop = {
        let reactor = reactor.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                if let Err(err) = reactor.turn(Some(Duration::from_millis(10))) {
                    tracing::error!(%err, "reactor turn failed");
                    break;
                }
            }
        })
    };

    let start = Instant::now();
    let done = Arc::new(AtomicUsize::new(0));
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|i| {
            let handle = scheduler.handle();
            let done = done.clone();
            thread::spawn(move || {
                let ms = rand::thread_rng().gen_range(0..MAX_DELAY_MS);
                let work = DelayedWork::new();
                handle
                    .submit_delayed(&work, ms, move || {
                        print_from_thread(i, ms, start);
                        done.fetch_add(1, Ordering::Release);
                    })
                    .map(|()| work)
            })
        })
        .collect();

    let mut scheduled = 0;
    for producer in producers {
        match producer.join() {
            Ok(Ok(_)) => scheduled += 1,
            Ok(Err(err)) => tracing::error!(%err, "failed to schedule work"),
            Err(_) => tracing::error!("producer panicked"),
        }
    }

    while done.load(Ordering::Acquire) < scheduled {
        thread::sleep(Duration::from_millis(10));
    }

    let last = Work::new();
    let finished = Arc::new(AtomicBool::new(false));
    let f = finished.clone();
    scheduler.submit_immediate(&last, move || {
        println!("all {scheduled} delayed callbacks ran");
        f.store(true, Ordering::Release);
    })?;
    while !finished.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(1));
    }

    stop.store(true, Ordering::Release);
    let _ = event_loop.join();
    scheduler.shutdown()?;
    Ok(())
}

fn print_from_thread(i: usize, ms: u64, start: Instant) {
    println!(
        "Hi from work {} (asked for {}ms, ran at {:?})! {:?}",
        i,
        ms,
        start.elapsed(),
        thread::current().id()
    );
}
