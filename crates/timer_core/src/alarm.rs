//! Single-shot alarms and the dispatcher thread that fires them.
//!
//! An [`AlarmClock`] owns one background thread and a deadline-ordered queue.
//! Every arm produces a fresh [`Alarm`]; alarms are never re-armed. When an
//! alarm comes due the clock hands it to its [`AlarmClient`], which resolves
//! the owning entry through [`Alarm::entry_id`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace};

/// Callback target of an [`AlarmClock`].
pub trait AlarmClient: Send + Sync {
    fn fired(&self, alarm: &Alarm);
}

/// When an alarm should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmSchedule {
    /// Absolute instant, used by fixed-rate entries.
    At(DateTime<Utc>),
    /// Relative delay from the moment of arming, used by fixed-delay entries.
    After(Duration),
}

impl AlarmSchedule {
    /// Relative schedule from a signed millisecond delay; negative delays
    /// fire immediately.
    pub fn after_millis(delay_ms: i64) -> Self {
        AlarmSchedule::After(Duration::from_millis(delay_ms.max(0) as u64))
    }

    /// Monotonic deadline, given `now` and `wall` sampled together.
    fn deadline(&self, now: Instant, wall: DateTime<Utc>) -> Instant {
        match self {
            AlarmSchedule::At(at) => {
                let ahead = (*at - wall).to_std().unwrap_or(Duration::ZERO);
                now + ahead
            }
            AlarmSchedule::After(delay) => now + *delay,
        }
    }
}

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

// Cancelled alarms tolerated in the queue before it is compacted.
const COMPACT_MIN: usize = 32;

struct AlarmInner {
    id: u64,
    entry_id: u64,
    due: Instant,
    state: AtomicU8,
    clock: Weak<ClockShared>,
}

/// Handle to one pending occurrence of one timer entry.
#[derive(Clone)]
pub struct Alarm {
    inner: Arc<AlarmInner>,
}

impl Alarm {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn entry_id(&self) -> u64 {
        self.inner.entry_id
    }

    pub fn due(&self) -> Instant {
        self.inner.due
    }

    /// Cancels the alarm if it has not fired yet. Returns whether this call
    /// performed the cancellation.
    ///
    /// Must not be called while holding the clock's queue lock.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .inner
            .state
            .compare_exchange(PENDING, CANCELLED, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok();
        if cancelled {
            if let Some(shared) = self.inner.clock.upgrade() {
                shared.queue.lock().note_cancelled();
            }
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(AtomicOrdering::Acquire) == CANCELLED
    }

    pub fn has_fired(&self) -> bool {
        self.inner.state.load(AtomicOrdering::Acquire) == FIRED
    }

    /// Whether both handles refer to the same armed occurrence.
    pub fn same_as(&self, other: &Alarm) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn mark_fired(&self) -> bool {
        self.inner
            .state
            .compare_exchange(PENDING, FIRED, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alarm")
            .field("id", &self.inner.id)
            .field("entry_id", &self.inner.entry_id)
            .field("state", &self.inner.state.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

struct Pending {
    due: Instant,
    seq: u64,
    alarm: Alarm,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior: earliest deadline, then arm order.
        match other.due.cmp(&self.due) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

#[derive(Default)]
struct ClockQueue {
    heap: BinaryHeap<Pending>,
    next_seq: u64,
    // Approximate count of cancelled alarms still sitting in `heap`.
    cancelled: usize,
    shutdown: bool,
}

impl ClockQueue {
    fn note_cancelled(&mut self) {
        self.cancelled += 1;
        if self.cancelled > COMPACT_MIN && self.cancelled * 2 > self.heap.len() {
            let before = self.heap.len();
            self.heap.retain(|pending| !pending.alarm.is_cancelled());
            self.cancelled = 0;
            trace!(dropped = before - self.heap.len(), "alarm queue compacted");
        }
    }
}

struct ClockShared {
    queue: Mutex<ClockQueue>,
    wakeup: Condvar,
    next_id: AtomicU64,
}

/// Shared dispatcher: one thread, alarms fired one at a time in due order.
pub struct AlarmClock {
    shared: Arc<ClockShared>,
    thread: Option<JoinHandle<()>>,
}

impl AlarmClock {
    pub fn spawn(name: &str, client: Weak<dyn AlarmClient>) -> std::io::Result<Self> {
        let shared = Arc::new(ClockShared {
            queue: Mutex::new(ClockQueue::default()),
            wakeup: Condvar::new(),
            next_id: AtomicU64::new(0),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("{name}-alarm"))
            .spawn(move || dispatch_loop(worker, client))?;
        debug!(clock = name, "alarm dispatcher started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Arms a fresh alarm for `entry_id`.
    pub fn schedule(&self, entry_id: u64, schedule: AlarmSchedule) -> Alarm {
        let due = schedule.deadline(Instant::now(), Utc::now());
        let alarm = Alarm {
            inner: Arc::new(AlarmInner {
                id: self.shared.next_id.fetch_add(1, AtomicOrdering::Relaxed) + 1,
                entry_id,
                due,
                state: AtomicU8::new(PENDING),
                clock: Arc::downgrade(&self.shared),
            }),
        };
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            drop(queue);
            alarm.cancel();
            return alarm;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Pending {
            due,
            seq,
            alarm: alarm.clone(),
        });
        drop(queue);
        self.shared.wakeup.notify_one();
        trace!(entry_id, alarm_id = alarm.id(), ?schedule, "alarm armed");
        alarm
    }

    /// Number of queued alarms that are still pending.
    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .heap
            .iter()
            .filter(|pending| !pending.alarm.is_cancelled() && !pending.alarm.has_fired())
            .count()
    }

    /// Number of queued alarms, including cancelled ones not yet discarded.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    /// Cancels everything still queued and lets the dispatcher thread exit.
    /// Safe to call from inside an alarm callback.
    pub fn shutdown(&mut self) {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return;
        }
        queue.shutdown = true;
        let drained: Vec<Pending> = queue.heap.drain().collect();
        queue.cancelled = 0;
        drop(queue);
        for pending in drained {
            pending.alarm.cancel();
        }
        self.shared.wakeup.notify_all();
        // Detached: the caller may hold the client's lock, which the
        // dispatcher could be waiting on.
        self.thread.take();
        debug!("alarm dispatcher shut down");
    }
}

impl Drop for AlarmClock {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch_loop(shared: Arc<ClockShared>, client: Weak<dyn AlarmClient>) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            break;
        }
        let Some(due) = queue.heap.peek().map(|pending| pending.due) else {
            shared.wakeup.wait(&mut queue);
            continue;
        };
        if due > Instant::now() {
            shared.wakeup.wait_until(&mut queue, due);
            continue;
        }
        let Some(pending) = queue.heap.pop() else {
            continue;
        };
        if !pending.alarm.mark_fired() {
            queue.cancelled = queue.cancelled.saturating_sub(1);
            continue;
        }
        let keep_running = MutexGuard::unlocked(&mut queue, || fire(&client, &pending.alarm));
        if !keep_running {
            break;
        }
    }
    trace!("alarm dispatcher exiting");
}

fn fire(client: &Weak<dyn AlarmClient>, alarm: &Alarm) -> bool {
    let Some(client) = client.upgrade() else {
        return false;
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| client.fired(alarm)));
    if outcome.is_err() {
        error!(
            alarm_id = alarm.id(),
            entry_id = alarm.entry_id(),
            "alarm callback panicked; dispatcher continues"
        );
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Recorder {
        tx: Mutex<mpsc::Sender<u64>>,
        panic_on: Option<u64>,
    }

    impl AlarmClient for Recorder {
        fn fired(&self, alarm: &Alarm) {
            if self.panic_on == Some(alarm.entry_id()) {
                panic!("entry {} exploded", alarm.entry_id());
            }
            let _ = self.tx.lock().send(alarm.entry_id());
        }
    }

    fn recorder(panic_on: Option<u64>) -> (Arc<dyn AlarmClient>, mpsc::Receiver<u64>) {
        let (tx, rx) = mpsc::channel();
        let client: Arc<dyn AlarmClient> = Arc::new(Recorder {
            tx: Mutex::new(tx),
            panic_on,
        });
        (client, rx)
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn fires_in_deadline_order() {
        let (client, rx) = recorder(None);
        let clock = AlarmClock::spawn("order", Arc::downgrade(&client)).expect("spawn clock");

        clock.schedule(3, AlarmSchedule::After(Duration::from_millis(200)));
        clock.schedule(1, AlarmSchedule::After(Duration::from_millis(10)));
        clock.schedule(
            2,
            AlarmSchedule::At(Utc::now() + chrono::Duration::milliseconds(100)),
        );

        let fired: Vec<u64> = (0..3).map(|_| rx.recv_timeout(WAIT).expect("alarm")).collect();
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn past_instants_and_negative_delays_fire_immediately() {
        let (client, rx) = recorder(None);
        let clock = AlarmClock::spawn("past", Arc::downgrade(&client)).expect("spawn clock");

        clock.schedule(1, AlarmSchedule::At(Utc::now() - chrono::Duration::seconds(30)));
        clock.schedule(2, AlarmSchedule::after_millis(-500));

        let mut fired = vec![
            rx.recv_timeout(WAIT).expect("first"),
            rx.recv_timeout(WAIT).expect("second"),
        ];
        fired.sort();
        assert_eq!(fired, vec![1, 2]);
    }

    #[test]
    fn cancelled_alarm_never_fires() {
        let (client, rx) = recorder(None);
        let clock = AlarmClock::spawn("cancel", Arc::downgrade(&client)).expect("spawn clock");

        let doomed = clock.schedule(1, AlarmSchedule::After(Duration::from_millis(40)));
        clock.schedule(2, AlarmSchedule::After(Duration::from_millis(80)));
        assert!(doomed.cancel());
        assert!(!doomed.cancel(), "second cancel is a no-op");
        assert_eq!(clock.pending(), 1);

        assert_eq!(rx.recv_timeout(WAIT).expect("alarm"), 2);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn cancel_after_firing_is_noop() {
        let (client, rx) = recorder(None);
        let clock = AlarmClock::spawn("late", Arc::downgrade(&client)).expect("spawn clock");

        let alarm = clock.schedule(5, AlarmSchedule::After(Duration::ZERO));
        assert_eq!(rx.recv_timeout(WAIT).expect("alarm"), 5);
        assert!(alarm.has_fired());
        assert!(!alarm.cancel());
        assert!(!alarm.is_cancelled());
    }

    #[test]
    fn panicking_callback_does_not_stop_dispatch() {
        let (client, rx) = recorder(Some(1));
        let clock = AlarmClock::spawn("panic", Arc::downgrade(&client)).expect("spawn clock");

        clock.schedule(1, AlarmSchedule::After(Duration::from_millis(5)));
        clock.schedule(2, AlarmSchedule::After(Duration::from_millis(30)));

        assert_eq!(rx.recv_timeout(WAIT).expect("survivor"), 2);
    }

    #[test]
    fn cancelled_alarms_do_not_pile_up_in_the_queue() {
        let (client, rx) = recorder(None);
        let clock = AlarmClock::spawn("churn", Arc::downgrade(&client)).expect("spawn clock");

        let keeper = clock.schedule(0, AlarmSchedule::After(Duration::from_millis(300)));
        for entry_id in 1..=5_000 {
            let alarm = clock.schedule(entry_id, AlarmSchedule::After(Duration::from_secs(3_600)));
            assert!(alarm.cancel());
        }

        assert_eq!(clock.pending(), 1);
        assert!(clock.queued() <= 2 * COMPACT_MIN + 2, "queue holds {}", clock.queued());
        assert_eq!(rx.recv_timeout(WAIT).expect("keeper"), 0);
        assert!(keeper.has_fired());
    }

    #[test]
    fn at_schedule_uses_one_clock_sample() {
        let now = Instant::now();
        let wall = Utc::now();
        let ahead = AlarmSchedule::At(wall + chrono::Duration::milliseconds(250));
        let behind = AlarmSchedule::At(wall - chrono::Duration::milliseconds(250));

        assert_eq!(ahead.deadline(now, wall), now + Duration::from_millis(250));
        assert_eq!(behind.deadline(now, wall), now);
    }

    #[test]
    fn shutdown_cancels_queued_alarms() {
        let (client, rx) = recorder(None);
        let mut clock = AlarmClock::spawn("shutdown", Arc::downgrade(&client)).expect("spawn clock");

        let queued = clock.schedule(1, AlarmSchedule::After(Duration::from_millis(50)));
        clock.shutdown();
        assert!(queued.is_cancelled());

        let late = clock.schedule(2, AlarmSchedule::After(Duration::ZERO));
        assert!(late.is_cancelled());
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }
}
