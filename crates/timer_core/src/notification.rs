use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TimerError};

/// Name reported by [`NotificationInfo`] for every record a timer emits.
pub const TIMER_NOTIFICATION_KIND: &str = "TimerNotification";

/// A single delivered occurrence of a timer entry.
///
/// The scheduler keeps one template per entry with a zero sequence number and
/// an epoch timestamp; both are filled in on a fresh clone at emission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerNotification {
    #[serde(rename = "type")]
    notif_type: String,
    source: String,
    sequence_number: u64,
    time_stamp: DateTime<Utc>,
    message: String,
    user_data: Value,
    notification_id: u64,
}

impl TimerNotification {
    pub(crate) fn template(
        notif_type: String,
        source: String,
        message: String,
        user_data: Value,
        notification_id: u64,
    ) -> Self {
        Self {
            notif_type,
            source,
            sequence_number: 0,
            time_stamp: DateTime::<Utc>::UNIX_EPOCH,
            message,
            user_data,
            notification_id,
        }
    }

    pub(crate) fn emitted(&self, sequence_number: u64, time_stamp: DateTime<Utc>) -> Self {
        Self {
            sequence_number,
            time_stamp,
            ..self.clone()
        }
    }

    pub fn notif_type(&self) -> &str {
        &self.notif_type
    }

    /// Name of the timer that emitted this record.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Due date of the occurrence, not the wall-clock delivery time.
    pub fn time_stamp(&self) -> DateTime<Utc> {
        self.time_stamp
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn user_data(&self) -> &Value {
        &self.user_data
    }

    pub fn notification_id(&self) -> u64 {
        self.notification_id
    }
}

/// Describes the notifications a timer can currently emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationInfo {
    pub name: String,
    pub description: String,
    pub types: Vec<String>,
}

/// Receives every notification a timer emits.
///
/// Listeners run on the emitting thread and should return quickly; an error
/// is logged and otherwise ignored.
pub trait NotificationListener: Send + Sync {
    fn handle_notification(&self, notification: &TimerNotification) -> anyhow::Result<()>;
}

impl<F> NotificationListener for F
where
    F: Fn(&TimerNotification) -> anyhow::Result<()> + Send + Sync,
{
    fn handle_notification(&self, notification: &TimerNotification) -> anyhow::Result<()> {
        self(notification)
    }
}

/// Passes notifications whose type starts with one of the enabled prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeFilter {
    enabled: Vec<String>,
}

impl TypeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_type(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if !self.enabled.contains(&prefix) {
            self.enabled.push(prefix);
        }
        self
    }

    pub fn disable_type(&mut self, prefix: &str) {
        self.enabled.retain(|existing| existing != prefix);
    }

    pub fn disable_all_types(&mut self) {
        self.enabled.clear();
    }

    pub fn enabled_types(&self) -> &[String] {
        &self.enabled
    }

    pub fn is_enabled(&self, notification: &TimerNotification) -> bool {
        self.enabled
            .iter()
            .any(|prefix| notification.notif_type().starts_with(prefix.as_str()))
    }
}

struct ListenerSlot {
    id: u64,
    listener: Arc<dyn NotificationListener>,
    filter: Option<TypeFilter>,
}

/// Listener set owned by one timer.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    slots: RwLock<Vec<ListenerSlot>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub(crate) fn add(
        &self,
        listener: Arc<dyn NotificationListener>,
        filter: Option<TypeFilter>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.slots.write().push(ListenerSlot {
            id,
            listener,
            filter,
        });
        id
    }

    pub(crate) fn remove(&self, id: u64) -> Result<()> {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        if slots.len() == before {
            return Err(TimerError::ListenerNotFound(id));
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Hands `notification` to every interested listener. The slot list is
    /// snapshotted first so listeners may add or remove listeners.
    pub(crate) fn deliver(&self, notification: &TimerNotification) {
        let targets: Vec<(u64, Arc<dyn NotificationListener>)> = self
            .slots
            .read()
            .iter()
            .filter(|slot| {
                slot.filter
                    .as_ref()
                    .map(|filter| filter.is_enabled(notification))
                    .unwrap_or(true)
            })
            .map(|slot| (slot.id, Arc::clone(&slot.listener)))
            .collect();

        for (listener_id, listener) in targets {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| listener.handle_notification(notification)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(
                    listener_id,
                    notification_id = notification.notification_id(),
                    sequence_number = notification.sequence_number(),
                    %err,
                    "listener failed to handle timer notification"
                ),
                Err(_) => tracing::error!(
                    listener_id,
                    notification_id = notification.notification_id(),
                    "listener panicked while handling timer notification"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn sample(notif_type: &str) -> TimerNotification {
        TimerNotification::template(
            notif_type.to_string(),
            "timer".into(),
            "hello".into(),
            Value::Null,
            7,
        )
    }

    #[test]
    fn emitted_clone_leaves_template_untouched() {
        let template = sample("app.tick");
        let stamp = Utc::now();
        let emitted = template.emitted(42, stamp);

        assert_eq!(template.sequence_number(), 0);
        assert_eq!(template.time_stamp(), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(emitted.sequence_number(), 42);
        assert_eq!(emitted.time_stamp(), stamp);
        assert_eq!(emitted.notification_id(), 7);
        assert_eq!(emitted.message(), "hello");
    }

    #[test]
    fn type_filter_matches_prefixes() {
        let mut filter = TypeFilter::new().enable_type("app.").enable_type("sys.boot");
        assert!(filter.is_enabled(&sample("app.tick")));
        assert!(filter.is_enabled(&sample("sys.boot.done")));
        assert!(!filter.is_enabled(&sample("sys.halt")));

        filter.disable_type("app.");
        assert!(!filter.is_enabled(&sample("app.tick")));
        filter.disable_all_types();
        assert!(filter.enabled_types().is_empty());
    }

    #[test]
    fn registry_survives_failing_and_panicking_listeners() {
        let registry = ListenerRegistry::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        registry.add(
            Arc::new(|_: &TimerNotification| -> anyhow::Result<()> {
                anyhow::bail!("listener refused")
            }),
            None,
        );
        registry.add(
            Arc::new(|_: &TimerNotification| -> anyhow::Result<()> { panic!("boom") }),
            None,
        );
        let sink = Arc::clone(&seen);
        let last = registry.add(
            Arc::new(move |n: &TimerNotification| -> anyhow::Result<()> {
                sink.lock().push(n.notification_id());
                Ok(())
            }),
            Some(TypeFilter::new().enable_type("app.")),
        );

        registry.deliver(&sample("app.tick"));
        registry.deliver(&sample("other"));
        assert_eq!(*seen.lock(), vec![7]);

        registry.remove(last).expect("remove listener");
        assert_eq!(registry.len(), 2);
        assert!(matches!(
            registry.remove(last),
            Err(TimerError::ListenerNotFound(id)) if id == last
        ));
    }
}
