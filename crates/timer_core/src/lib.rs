//! Notification timer: schedules one-shot and repeating notifications and
//! delivers them, in sequence-number order, to registered listeners.

pub mod alarm;
pub mod entry;
pub mod error;
pub mod lifecycle;
pub mod notification;
pub mod timer;

pub use crate::entry::NotificationRequest;
pub use crate::error::{Result, TimerError};
pub use crate::lifecycle::Registration;
pub use crate::notification::{NotificationInfo, NotificationListener, TimerNotification, TypeFilter};
pub use crate::timer::{Timer, TimerBuilder};

pub const ONE_SECOND: u64 = 1_000;
pub const ONE_MINUTE: u64 = 60 * ONE_SECOND;
pub const ONE_HOUR: u64 = 60 * ONE_MINUTE;
pub const ONE_DAY: u64 = 24 * ONE_HOUR;
pub const ONE_WEEK: u64 = 7 * ONE_DAY;
