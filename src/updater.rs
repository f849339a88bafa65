//! Global flush scheduler.
//!
//! One background thread wakes each live session at the cadence its last
//! flush requested. Sessions are held weakly; a closed or dropped session
//! simply falls out of the schedule.

use std::collections::BinaryHeap;
use std::sync::{Arc, Once, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::session::SessionInner;

struct Entry {
    when: Instant,
    sess: Weak<SessionInner>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Earliest deadline on top of the max-heap.
        other.when.cmp(&self.when)
    }
}

struct Updater {
    queue: Mutex<BinaryHeap<Entry>>,
    wakeup: Condvar,
}

fn updater() -> &'static Updater {
    static INSTANCE: OnceLock<Updater> = OnceLock::new();
    static THREAD: Once = Once::new();
    let u = INSTANCE.get_or_init(|| Updater {
        queue: Mutex::new(BinaryHeap::new()),
        wakeup: Condvar::new(),
    });
    THREAD.call_once(|| {
        std::thread::Builder::new()
            .name("arq256-updater".into())
            .spawn(move || run(u))
            .expect("failed to spawn the flush scheduler thread");
    });
    u
}

/// Put a session on the schedule for an immediate first flush.
pub(crate) fn register(sess: &Arc<SessionInner>) {
    let u = updater();
    u.queue.lock().push(Entry {
        when: Instant::now(),
        sess: Arc::downgrade(sess),
    });
    u.wakeup.notify_one();
}

enum Next {
    Due,
    WaitUntil(Instant),
    Idle,
}

fn run(u: &'static Updater) {
    let mut q = u.queue.lock();
    loop {
        let now = Instant::now();
        let next = match q.peek() {
            None => Next::Idle,
            Some(e) if e.when <= now => Next::Due,
            Some(e) => Next::WaitUntil(e.when),
        };
        match next {
            Next::Due => {
                if let Some(entry) = q.pop() {
                    let mut requeue = None;
                    MutexGuard::unlocked(&mut q, || {
                        if let Some(sess) = entry.sess.upgrade() {
                            if !sess.is_closed() {
                                let interval = sess.update().max(1);
                                requeue = Some(Entry {
                                    when: Instant::now()
                                        + Duration::from_millis(interval as u64),
                                    sess: entry.sess,
                                });
                            }
                        }
                    });
                    if let Some(entry) = requeue {
                        q.push(entry);
                    }
                }
            }
            Next::WaitUntil(when) => {
                let _ = u.wakeup.wait_until(&mut q, when);
            }
            Next::Idle => {
                u.wakeup.wait(&mut q);
            }
        }
    }
}
