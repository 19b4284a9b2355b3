use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::ReentrantMutex;
use serde_json::Value;
use tracing::{debug, info, instrument, trace};

use crate::{
    alarm::{Alarm, AlarmClient, AlarmClock},
    entry::{NotificationRequest, Step, TimerEntry},
    error::{Result, TimerError},
    notification::{
        ListenerRegistry, NotificationInfo, NotificationListener, TimerNotification, TypeFilter,
        TIMER_NOTIFICATION_KIND,
    },
};

/// Schedules notifications and delivers them to registered listeners.
///
/// A timer starts stopped. While running it owns one alarm dispatcher thread
/// and keeps exactly one pending alarm per entry. Every public operation is
/// serialized by a single re-entrant lock, so listeners may call back into
/// the timer while a notification is being delivered.
pub struct Timer {
    inner: Arc<TimerInner>,
}

pub struct TimerBuilder {
    name: String,
    send_past_notifications: bool,
}

struct TimerInner {
    name: String,
    state: ReentrantMutex<RefCell<TimerState>>,
    listeners: ListenerRegistry,
    sequence_number: AtomicU64,
    this: Weak<TimerInner>,
}

#[derive(Default)]
struct TimerState {
    // Ordered by id; callers must not rely on cross-entry delivery order.
    entries: BTreeMap<u64, TimerEntry>,
    counter_id: u64,
    active: bool,
    send_past_notifications: bool,
    clock: Option<AlarmClock>,
}

impl TimerBuilder {
    pub fn new() -> Self {
        Self {
            name: "timer".to_string(),
            send_past_notifications: false,
        }
    }

    /// Name used as the source of emitted notifications and for the
    /// dispatcher thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn send_past_notifications(mut self, enabled: bool) -> Self {
        self.send_past_notifications = enabled;
        self
    }

    pub fn build(self) -> Timer {
        let state = TimerState {
            send_past_notifications: self.send_past_notifications,
            ..TimerState::default()
        };
        let inner = Arc::new_cyclic(|this| TimerInner {
            name: self.name,
            state: ReentrantMutex::new(RefCell::new(state)),
            listeners: ListenerRegistry::default(),
            sequence_number: AtomicU64::new(0),
            this: this.clone(),
        });
        Timer { inner }
    }
}

impl Default for TimerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn builder() -> TimerBuilder {
        TimerBuilder::new()
    }

    pub fn new() -> Self {
        TimerBuilder::new().build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Starts the timer. Overdue entries are first walked forward to the
    /// present, emitting each missed occurrence when past notifications are
    /// enabled, then every remaining entry is armed.
    #[instrument(skip(self), fields(timer = %self.inner.name))]
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Stops the timer. Entries keep their due dates for the next start.
    #[instrument(skip(self), fields(timer = %self.inner.name))]
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_active(&self) -> bool {
        self.inner.with_state(|state| state.active)
    }

    #[instrument(skip(self, request), fields(timer = %self.inner.name, notif_type = %request.notif_type))]
    pub fn add_notification(&self, request: NotificationRequest) -> Result<u64> {
        self.inner.add_notification(request)
    }

    /// Registers a notification that fires once at `date`.
    pub fn add_one_shot(
        &self,
        notif_type: impl Into<String>,
        message: impl Into<String>,
        user_data: Value,
        date: DateTime<Utc>,
    ) -> Result<u64> {
        self.add_notification(NotificationRequest::new(notif_type, message, date).user_data(user_data))
    }

    #[instrument(skip(self), fields(timer = %self.inner.name))]
    pub fn remove_notification(&self, id: u64) -> Result<()> {
        self.inner.remove_notification(id)
    }

    /// Removes every entry of `notif_type`. The matching ids are collected
    /// up front; entries added while removing are left alone.
    #[instrument(skip(self), fields(timer = %self.inner.name))]
    pub fn remove_notifications(&self, notif_type: &str) -> Result<()> {
        let _guard = self.inner.state.lock();
        let ids = self.notification_ids(notif_type);
        if ids.is_empty() {
            return Err(TimerError::TypeNotFound(notif_type.to_string()));
        }
        for id in ids {
            self.inner.remove_notification(id)?;
        }
        Ok(())
    }

    /// Removes every entry and resets the id counter.
    #[instrument(skip(self), fields(timer = %self.inner.name))]
    pub fn remove_all_notifications(&self) {
        self.inner.with_state(|state| {
            for entry in state.entries.values_mut() {
                entry.cancel_alarm();
            }
            state.entries.clear();
            state.counter_id = 0;
        });
    }

    pub fn nb_notifications(&self) -> usize {
        self.inner.with_state(|state| state.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.nb_notifications() == 0
    }

    pub fn all_notification_ids(&self) -> Vec<u64> {
        self.inner
            .with_state(|state| state.entries.keys().copied().collect())
    }

    pub fn notification_ids(&self, notif_type: &str) -> Vec<u64> {
        self.inner.with_state(|state| {
            state
                .entries
                .iter()
                .filter(|(_, entry)| entry.notif_type() == notif_type)
                .map(|(id, _)| *id)
                .collect()
        })
    }

    pub fn notification_type(&self, id: u64) -> Option<String> {
        self.entry_field(id, |entry| entry.notif_type().to_string())
    }

    pub fn notification_message(&self, id: u64) -> Option<String> {
        self.entry_field(id, |entry| entry.template.message().to_string())
    }

    pub fn notification_user_data(&self, id: u64) -> Option<Value> {
        self.entry_field(id, |entry| entry.template.user_data().clone())
    }

    /// Next due date of the entry.
    pub fn notification_date(&self, id: u64) -> Option<DateTime<Utc>> {
        self.entry_field(id, |entry| entry.date)
    }

    pub fn period(&self, id: u64) -> Option<u64> {
        self.entry_field(id, |entry| entry.period_ms)
    }

    /// Remaining occurrences, 0 meaning unbounded.
    pub fn nb_occurrences(&self, id: u64) -> Option<u64> {
        self.entry_field(id, |entry| entry.remaining)
    }

    pub fn fixed_rate(&self, id: u64) -> Option<bool> {
        self.entry_field(id, |entry| entry.fixed_rate)
    }

    pub fn send_past_notifications(&self) -> bool {
        self.inner.with_state(|state| state.send_past_notifications)
    }

    pub fn set_send_past_notifications(&self, enabled: bool) {
        self.inner
            .with_state(|state| state.send_past_notifications = enabled);
    }

    pub fn notification_info(&self) -> NotificationInfo {
        let types: BTreeSet<String> = self.inner.with_state(|state| {
            state
                .entries
                .values()
                .map(|entry| entry.notif_type().to_string())
                .collect()
        });
        NotificationInfo {
            name: TIMER_NOTIFICATION_KIND.to_string(),
            description: format!("Notifications emitted by timer `{}`", self.inner.name),
            types: types.into_iter().collect(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn NotificationListener>) -> u64 {
        self.inner.listeners.add(listener, None)
    }

    pub fn add_listener_with_filter(
        &self,
        listener: Arc<dyn NotificationListener>,
        filter: TypeFilter,
    ) -> u64 {
        self.inner.listeners.add(listener, Some(filter))
    }

    pub fn remove_listener(&self, listener_id: u64) -> Result<()> {
        self.inner.listeners.remove(listener_id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    fn entry_field<T>(&self, id: u64, read: impl FnOnce(&TimerEntry) -> T) -> Option<T> {
        self.inner
            .with_state(|state| state.entries.get(&id).map(read))
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if self.is_active() {
            self.inner.stop();
        }
    }
}

impl TimerInner {
    /// Runs `f` with the state borrowed. Never call listeners from `f`.
    fn with_state<R>(&self, f: impl FnOnce(&mut TimerState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut *state)
    }

    fn start(&self) -> Result<()> {
        let guard = self.state.lock();
        if guard.borrow().active {
            info!(timer = %self.name, "timer already started");
            return Ok(());
        }

        let now = Utc::now();
        self.flush_past_notifications(&guard, now);

        // A listener may have started the timer during catch-up.
        if guard.borrow().active {
            return Ok(());
        }
        let client: Weak<dyn AlarmClient> = self.this.clone();
        let clock = AlarmClock::spawn(&self.name, client)?;

        let mut state = guard.borrow_mut();
        for (id, entry) in state.entries.iter_mut() {
            entry.alarm = Some(clock.schedule(*id, entry.initial_schedule(now)));
        }
        let armed = state.entries.len();
        state.clock = Some(clock);
        state.active = true;
        debug!(timer = %self.name, armed, "timer started");
        Ok(())
    }

    fn stop(&self) {
        self.with_state(|state| {
            if !state.active {
                info!(timer = %self.name, "timer already stopped");
                return;
            }
            for entry in state.entries.values_mut() {
                entry.cancel_alarm();
            }
            if let Some(mut clock) = state.clock.take() {
                clock.shutdown();
            }
            state.active = false;
            debug!(timer = %self.name, entries = state.entries.len(), "timer stopped");
        });
    }

    /// Walks every entry due strictly before `now`, compared at millisecond
    /// resolution, forward until it is no longer overdue or retired. An entry
    /// due within the current millisecond is left for its alarm.
    fn flush_past_notifications(&self, cell: &RefCell<TimerState>, now: DateTime<Utc>) {
        let (ids, send): (Vec<u64>, bool) = {
            let state = cell.borrow();
            (
                state.entries.keys().copied().collect(),
                state.send_past_notifications,
            )
        };

        let now_ms = now.timestamp_millis();
        for id in ids {
            loop {
                let due = {
                    let state = cell.borrow();
                    match state.entries.get(&id) {
                        Some(entry) if entry.date.timestamp_millis() < now_ms => {
                            Some((entry.date, entry.template.clone()))
                        }
                        _ => None,
                    }
                };
                let Some((date, template)) = due else {
                    break;
                };
                if send {
                    self.send_notification(date, &template);
                } else {
                    trace!(timer = %self.name, id, %date, "skipping past notification");
                }
                self.update_timer_table(cell, id);
            }
        }
    }

    fn add_notification(&self, request: NotificationRequest) -> Result<u64> {
        request.validate()?;
        self.with_state(|state| {
            let now = Utc::now();
            let date = if request.date <= now {
                trace!(timer = %self.name, requested = %request.date, "date moved forward to now");
                now
            } else {
                request.date
            };

            state.counter_id += 1;
            let id = state.counter_id;
            let template = TimerNotification::template(
                request.notif_type,
                self.name.clone(),
                request.message,
                request.user_data,
                id,
            );
            let mut entry = TimerEntry::new(
                template,
                date,
                request.period_ms as u64,
                request.occurrences as u64,
                request.fixed_rate,
            );
            if state.active {
                if let Some(clock) = &state.clock {
                    entry.alarm = Some(clock.schedule(id, entry.initial_schedule(now)));
                }
            }
            debug!(
                timer = %self.name,
                id,
                %date,
                period_ms = entry.period_ms,
                occurrences = entry.remaining,
                fixed_rate = entry.fixed_rate,
                "timer notification added"
            );
            state.entries.insert(id, entry);
            Ok(id)
        })
    }

    fn remove_notification(&self, id: u64) -> Result<()> {
        self.with_state(|state| {
            let mut entry = state
                .entries
                .remove(&id)
                .ok_or(TimerError::NotificationNotFound(id))?;
            entry.cancel_alarm();
            debug!(timer = %self.name, id, "timer notification removed");
            Ok(())
        })
    }

    /// Reschedule step run after every handled occurrence.
    fn update_timer_table(&self, cell: &RefCell<TimerState>, id: u64) {
        let mut state = cell.borrow_mut();
        let TimerState {
            entries,
            active,
            clock,
            ..
        } = &mut *state;
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        match entry.advance() {
            Step::Repeat => {
                entry.alarm = None;
                if *active {
                    if let Some(clock) = clock {
                        entry.alarm = Some(clock.schedule(id, entry.next_schedule()));
                    }
                }
                trace!(
                    timer = %self.name,
                    id,
                    next = %entry.date,
                    remaining = entry.remaining,
                    "timer notification rescheduled"
                );
            }
            Step::Retire => {
                entry.cancel_alarm();
                entries.remove(&id);
                debug!(timer = %self.name, id, "timer notification retired");
            }
        }
    }

    fn send_notification(&self, date: DateTime<Utc>, template: &TimerNotification) {
        let sequence_number = self.sequence_number.fetch_add(1, Ordering::SeqCst) + 1;
        let notification = template.emitted(sequence_number, date);
        trace!(
            timer = %self.name,
            id = notification.notification_id(),
            sequence_number,
            "sending timer notification"
        );
        self.listeners.deliver(&notification);
    }

    fn owns_alarm(state: &TimerState, alarm: &Alarm) -> bool {
        state
            .entries
            .get(&alarm.entry_id())
            .and_then(|entry| entry.alarm.as_ref())
            .map(|current| current.same_as(alarm))
            .unwrap_or(false)
    }
}

impl AlarmClient for TimerInner {
    fn fired(&self, alarm: &Alarm) {
        let guard = self.state.lock();
        let id = alarm.entry_id();
        let due = {
            let state = guard.borrow();
            if state.active && Self::owns_alarm(&state, alarm) {
                state
                    .entries
                    .get(&id)
                    .map(|entry| (entry.date, entry.template.clone()))
            } else {
                None
            }
        };
        let Some((date, template)) = due else {
            trace!(timer = %self.name, id, alarm_id = alarm.id(), "ignoring stale alarm");
            return;
        };

        self.send_notification(date, &template);

        // Listeners run under the lock and may have removed, stopped or
        // restarted; only advance an entry that still belongs to this alarm.
        let reschedule = {
            let state = guard.borrow();
            match state.entries.get(&id) {
                Some(entry) => entry
                    .alarm
                    .as_ref()
                    .map(|current| current.same_as(alarm))
                    .unwrap_or(true),
                None => false,
            }
        };
        if reschedule {
            self.update_timer_table(&guard, id);
        }
    }
}
