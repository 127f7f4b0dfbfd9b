//! Shared timer service: one time-sorted event set, one worker thread.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

struct TimeEvent {
    notifier: Arc<dyn Fn() + Send + Sync>,
    period: Option<Duration>,
}

struct TimerWheel {
    // keyed by (deadline, event id): time-sorted, collision-free
    events: Mutex<BTreeMap<(Instant, u64), TimeEvent>>,
    cond: Condvar,
    next_id: AtomicU64,
}

static WHEEL: Lazy<Arc<TimerWheel>> = Lazy::new(|| {
    let wheel = Arc::new(TimerWheel {
        events: Mutex::new(BTreeMap::new()),
        cond: Condvar::new(),
        next_id: AtomicU64::new(1),
    });
    let worker = Arc::clone(&wheel);
    thread::Builder::new()
        .name("infer-timer".into())
        .spawn(move || worker.run())
        .expect("spawn timer thread");
    wheel
});

impl TimerWheel {
    fn run(&self) {
        loop {
            let mut events = self.events.lock();
            let Some((&key, _)) = events.iter().next() else {
                self.cond.wait(&mut events);
                continue;
            };
            let (deadline, _) = key;
            if Instant::now() < deadline {
                self.cond.wait_until(&mut events, deadline);
                continue;
            }
            let event = events.remove(&key).expect("event vanished under lock");
            let notifier = Arc::clone(&event.notifier);
            if let Some(period) = event.period {
                events.insert((deadline + period, key.1), event);
            }
            // never hold the wheel lock through a notifier: notifiers
            // take user locks that may themselves arm or cancel timers
            drop(events);
            notifier();
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn add(&self, id: u64, delay: Duration, period: Option<Duration>, notifier: Arc<dyn Fn() + Send + Sync>) {
        let mut events = self.events.lock();
        events.insert((Instant::now() + delay, id), TimeEvent { notifier, period });
        drop(events);
        self.cond.notify_one();
    }

    fn remove(&self, id: u64) {
        let mut events = self.events.lock();
        events.retain(|&(_, eid), _| eid != id);
        drop(events);
        self.cond.notify_one();
    }
}

/// Handle for scheduling callbacks on the shared timer thread.
///
/// A timer drives at most one pending event at a time; arming a busy
/// timer fails. Cancellation is best-effort: an event already being
/// delivered may still run, so notifier closures must tolerate one
/// stale invocation.
#[derive(Default)]
pub struct Timer {
    active: Arc<AtomicU64>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no event is pending.
    pub fn idle(&self) -> bool {
        self.active.load(Ordering::Acquire) == 0
    }

    /// Fire `notifier` once after `delay`. Fails when already armed.
    pub fn notify_after<F>(&self, delay: Duration, notifier: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = WHEEL.alloc_id();
        if self
            .active
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let active = Arc::clone(&self.active);
        WHEEL.add(
            id,
            delay,
            None,
            Arc::new(move || {
                notifier();
                let _ = active.compare_exchange(id, 0, Ordering::AcqRel, Ordering::Acquire);
            }),
        );
        true
    }

    /// Fire `notifier` every `period` until cancelled. Fails when
    /// already armed.
    pub fn notify_every<F>(&self, period: Duration, notifier: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = WHEEL.alloc_id();
        if self
            .active
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        WHEEL.add(id, period, Some(period), Arc::new(notifier));
        true
    }

    /// Drop the pending event, if any.
    pub fn cancel(&self) {
        let id = self.active.swap(0, Ordering::AcqRel);
        if id != 0 {
            WHEEL.remove(id);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn one_shot_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = Timer::new();
        assert!(timer.notify_after(Duration::from_millis(20), move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!timer.idle());
        thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(timer.idle());
    }

    #[test]
    fn busy_timer_rejects_rearm() {
        let timer = Timer::new();
        assert!(timer.notify_after(Duration::from_secs(60), || {}));
        assert!(!timer.notify_after(Duration::from_millis(1), || {}));
        timer.cancel();
        assert!(timer.idle());
    }

    #[test]
    fn cancel_prevents_delivery() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = Timer::new();
        timer.notify_after(Duration::from_millis(50), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn periodic_repeats_until_cancel() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = Timer::new();
        assert!(timer.notify_every(Duration::from_millis(15), move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        thread::sleep(Duration::from_millis(120));
        timer.cancel();
        let seen = hits.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected repeated delivery, saw {seen}");
        thread::sleep(Duration::from_millis(60));
        assert!(hits.load(Ordering::SeqCst) <= seen + 1);
    }
}
