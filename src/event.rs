//! Timer reactor the server attaches to.
//!
//! An [`Event`] is a shared, cheaply clonable handle to a set of one-shot
//! timers ordered by deadline, then priority, then registration order.
//! Registering a timer returns a [`TimerSource`]; dropping the source
//! cancels the timer. Timers fire from [`Event::dispatch`], which the async
//! driver [`Event::run`] calls whenever the earliest deadline passes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use tokio::sync::Notify;
use tracing::trace;

type Callback = Box<dyn FnOnce(Instant) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: Instant,
    priority: i64,
    sequence: u64,
}

struct EventInner {
    timers: Mutex<BTreeMap<TimerKey, Callback>>,
    sequence: AtomicU64,
    wakeup: Notify,
}

impl EventInner {
    fn timers(&self) -> MutexGuard<'_, BTreeMap<TimerKey, Callback>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

thread_local! {
    static DEFAULT_EVENT: Event = Event::new();
}

/// Handle to a timer reactor.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                timers: Mutex::new(BTreeMap::new()),
                sequence: AtomicU64::new(0),
                wakeup: Notify::new(),
            }),
        }
    }

    /// The calling thread's default reactor.
    ///
    /// Every call on the same thread returns a handle to the same reactor.
    pub fn default_loop() -> Self {
        DEFAULT_EVENT.with(Clone::clone)
    }

    /// Returns true if both handles refer to the same reactor.
    pub fn ptr_eq(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers a one-shot timer.
    ///
    /// Timers with equal deadlines fire lowest `priority` first, then in
    /// registration order. The callback receives the dispatch time.
    #[must_use = "dropping the TimerSource cancels the timer"]
    pub fn add_timer<F>(&self, deadline: Instant, priority: i64, callback: F) -> TimerSource
    where
        F: FnOnce(Instant) + Send + 'static,
    {
        let key = TimerKey {
            deadline,
            priority,
            sequence: self.inner.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.inner.timers().insert(key, Box::new(callback));
        self.inner.wakeup.notify_one();

        TimerSource {
            key,
            event: Arc::downgrade(&self.inner),
        }
    }

    /// Number of timers waiting to fire.
    pub fn pending(&self) -> usize {
        self.inner.timers().len()
    }

    /// Earliest deadline among pending timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.timers().keys().next().map(|key| key.deadline)
    }

    /// Fires every timer whose deadline is at or before `now`.
    ///
    /// Only timers pending when the call starts are considered, so a
    /// callback that registers an already-due timer does not make this
    /// loop forever. Returns the number of callbacks run.
    pub fn dispatch(&self, now: Instant) -> usize {
        let due: Vec<TimerKey> = self
            .inner
            .timers()
            .keys()
            .take_while(|key| key.deadline <= now)
            .copied()
            .collect();

        let mut fired = 0;
        for key in due {
            // A callback fired earlier in this pass may have cancelled it.
            let Some(callback) = self.inner.timers().remove(&key) else {
                continue;
            };
            trace!("Firing timer (priority {}, #{})", key.priority, key.sequence);
            callback(now);
            fired += 1;
        }
        fired
    }

    /// Drives the reactor forever, sleeping until the next deadline.
    pub async fn run(&self) {
        loop {
            let wakeup = self.inner.wakeup.notified();
            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline.into()) => {
                            self.dispatch(Instant::now());
                        }
                        _ = wakeup => {}
                    }
                }
                None => wakeup.await,
            }
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Registration of one timer. Dropping it cancels the timer.
#[derive(Debug)]
pub struct TimerSource {
    key: TimerKey,
    event: Weak<EventInner>,
}

impl TimerSource {
    pub fn deadline(&self) -> Instant {
        self.key.deadline
    }

    /// Returns true until the timer fired or was cancelled.
    pub fn is_pending(&self) -> bool {
        self.event
            .upgrade()
            .is_some_and(|inner| inner.timers().contains_key(&self.key))
    }
}

impl Drop for TimerSource {
    fn drop(&mut self) {
        if let Some(inner) = self.event.upgrade() {
            // Dropped outside the lock; a callback may own other sources.
            let callback = inner.timers().remove(&self.key);
            drop(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |name: &'static str| -> Callback {
                let log = Arc::clone(&log);
                Box::new(move |_| log.lock().unwrap().push(name))
            }
        };
        (log, make)
    }

    #[test]
    fn test_dispatch_order() {
        let event = Event::new();
        let (log, make) = recorder();
        let now = Instant::now();

        let _late = event.add_timer(now + Duration::from_secs(2), 0, make("late"));
        let _low = event.add_timer(now + Duration::from_secs(1), 5, make("low"));
        let _high = event.add_timer(now + Duration::from_secs(1), -5, make("high"));
        let _tie = event.add_timer(now + Duration::from_secs(1), -5, make("high-second"));

        assert_eq!(event.pending(), 4);
        assert_eq!(event.next_deadline(), Some(now + Duration::from_secs(1)));

        assert_eq!(event.dispatch(now), 0);
        assert_eq!(event.dispatch(now + Duration::from_secs(1)), 3);
        assert_eq!(*log.lock().unwrap(), vec!["high", "high-second", "low"]);

        assert_eq!(event.dispatch(now + Duration::from_secs(5)), 1);
        assert_eq!(event.pending(), 0);
    }

    #[test]
    fn test_drop_cancels() {
        let event = Event::new();
        let (log, make) = recorder();
        let now = Instant::now();

        let source = event.add_timer(now, 0, make("cancelled"));
        assert!(source.is_pending());
        drop(source);

        assert_eq!(event.pending(), 0);
        assert_eq!(event.dispatch(now), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fired_source_is_not_pending() {
        let event = Event::new();
        let now = Instant::now();

        let source = event.add_timer(now, 0, |_| {});
        event.dispatch(now);
        assert!(!source.is_pending());
        assert_eq!(source.deadline(), now);
    }

    #[test]
    fn test_callback_rearms_without_looping() {
        let event = Event::new();
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<TimerSource>>> = Arc::new(Mutex::new(None));
        let now = Instant::now();

        fn arm(event: &Event, count: Arc<AtomicUsize>, slot: Arc<Mutex<Option<TimerSource>>>, at: Instant) {
            let next_event = event.clone();
            let next_slot = Arc::clone(&slot);
            let source = event.add_timer(at, 0, move |fired_at| {
                count.fetch_add(1, Ordering::SeqCst);
                arm(&next_event, count, next_slot, fired_at);
            });
            *slot.lock().unwrap() = Some(source);
        }

        arm(&event, Arc::clone(&count), Arc::clone(&slot), now);
        assert_eq!(event.dispatch(now), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(event.pending(), 1);
    }

    #[test]
    fn test_default_loop_is_per_thread() {
        let first = Event::default_loop();
        let second = Event::default_loop();
        assert!(first.ptr_eq(&second));
        assert!(!first.ptr_eq(&Event::new()));

        let other = std::thread::spawn(|| {
            let event = Event::default_loop();
            event.pending()
        })
        .join()
        .unwrap();
        assert_eq!(other, 0);
    }

    #[tokio::test]
    async fn test_run_fires_timers() {
        let event = Event::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let _source = event.add_timer(Instant::now() + Duration::from_millis(20), 0, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let driver = event.clone();
        let result = tokio::time::timeout(Duration::from_millis(500), async {
            tokio::select! {
                _ = driver.run() => {}
                _ = async {
                    while fired.load(Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                } => {}
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(event.pending(), 0);
    }
}
