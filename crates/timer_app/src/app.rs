use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use timer_core::{NotificationRequest, Registration, Timer, TimerNotification};
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub(crate) timer_name: String,
    pub(crate) send_past_notifications: bool,
    pub(crate) demo_period_ms: i64,
    pub(crate) demo_occurrences: i64,
    pub(crate) demo_fixed_rate: bool,
    pub(crate) run_for: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_lookup(|key| std::env::var(key).ok()))
    }

    /// Builds a config from `lookup`, keeping defaults for missing or
    /// unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(name) = lookup("TIMER_NAME") {
            let name = name.trim();
            if !name.is_empty() {
                config.timer_name = name.to_string();
            }
        }
        if let Some(flag) = lookup("TIMER_SEND_PAST_NOTIFICATIONS").and_then(|v| parse_flag(&v)) {
            config.send_past_notifications = flag;
        }
        if let Some(period) = lookup("TIMER_DEMO_PERIOD_MS") {
            if let Ok(value) = period.trim().parse::<i64>() {
                if value >= 0 {
                    config.demo_period_ms = value;
                }
            }
        }
        if let Some(occurrences) = lookup("TIMER_DEMO_OCCURRENCES") {
            if let Ok(value) = occurrences.trim().parse::<i64>() {
                config.demo_occurrences = value.max(0);
            }
        }
        if let Some(flag) = lookup("TIMER_DEMO_FIXED_RATE").and_then(|v| parse_flag(&v)) {
            config.demo_fixed_rate = flag;
        }
        if let Some(secs) = lookup("TIMER_RUN_SECS") {
            if let Ok(value) = secs.trim().parse::<u64>() {
                config.run_for = Duration::from_secs(value);
            }
        }
        config
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            timer_name: "timerd".to_string(),
            send_past_notifications: true,
            demo_period_ms: timer_core::ONE_SECOND as i64,
            demo_occurrences: 5,
            demo_fixed_rate: false,
            run_for: Duration::from_secs(6),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Registers the demo entries: a greeting due now, a periodic tick, and a
/// reminder that is already overdue so the catch-up path is visible.
pub fn install_demo_schedule(timer: &Timer, config: &AppConfig) -> Result<Vec<u64>> {
    let now = Utc::now();
    let hello = timer
        .add_one_shot("timerd.hello", "timer online", json!({"pid": std::process::id()}), now)
        .context("failed to add greeting")?;
    let tick = timer
        .add_notification(
            NotificationRequest::new("timerd.tick", "periodic tick", now)
                .period(config.demo_period_ms)
                .occurrences(config.demo_occurrences)
                .fixed_rate(config.demo_fixed_rate),
        )
        .context("failed to add periodic tick")?;
    let missed = timer
        .add_one_shot(
            "timerd.missed",
            "overdue reminder",
            json!(null),
            now - chrono::Duration::minutes(5),
        )
        .context("failed to add overdue reminder")?;
    debug!(hello, tick, missed, "demo schedule installed");
    Ok(vec![hello, tick, missed])
}

pub fn run(config: AppConfig) -> Result<()> {
    let timer = Timer::builder()
        .name(config.timer_name.clone())
        .send_past_notifications(config.send_past_notifications)
        .build();
    let registered_as = timer.pre_register(None)?;
    timer.post_register(true);
    info!(name = %registered_as, "timer registered");

    timer.add_listener(Arc::new(|n: &TimerNotification| -> anyhow::Result<()> {
        info!(
            notif_type = n.notif_type(),
            id = n.notification_id(),
            seq = n.sequence_number(),
            due = %n.time_stamp(),
            text = n.message(),
            "notification delivered"
        );
        Ok(())
    }));

    install_demo_schedule(&timer, &config)?;
    timer.start().context("failed to start timer")?;
    info!(
        types = ?timer.notification_info().types,
        run_secs = config.run_for.as_secs(),
        "timer running"
    );

    thread::sleep(config.run_for);

    info!(remaining = timer.nb_notifications(), "shutting down");
    timer.pre_deregister()?;
    timer.post_deregister();
    Ok(())
}
