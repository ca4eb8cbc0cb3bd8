//! Timer / reminder scheduler
//!
//! Reminders fire at fixed offsets ahead of each deadline or court
//! date. The in-memory index is only an acceleration structure — the
//! durable record is the instance state itself (`reminders_fired[]`),
//! so recovery re-evaluates pending offsets against wall-clock time:
//! an offset whose fire time has passed and is not recorded fires
//! immediately; an item whose target date has fully elapsed fires a
//! single overdue event instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::WorkflowError;
use crate::gateway::SignalGateway;
use crate::instance::{FiredReminder, OffsetLabel, ReminderKind, WorkflowInstance};

/// Offsets ahead of the target date at which reminders fire.
pub fn offsets_for(kind: ReminderKind) -> Vec<(OffsetLabel, Duration)> {
    match kind {
        ReminderKind::Deadline => vec![
            (OffsetLabel::SevenDaysBefore, Duration::days(7)),
            (OffsetLabel::ThreeDaysBefore, Duration::days(3)),
            (OffsetLabel::OneDayBefore, Duration::days(1)),
        ],
        ReminderKind::CourtDate => vec![
            (OffsetLabel::FortyEightHoursBefore, Duration::hours(48)),
            (OffsetLabel::TwentyFourHoursBefore, Duration::hours(24)),
        ],
    }
}

/// A reminder not yet delivered, keyed durably by
/// `(instance_id, item_id, label)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReminder {
    pub instance_id: Uuid,
    pub item_id: Uuid,
    pub kind: ReminderKind,
    pub label: OffsetLabel,
    pub fire_at: DateTime<Utc>,
    pub target_at: DateTime<Utc>,
    pub title: String,
}

/// Compute the reminders still owed for one calendar item, given what
/// has already fired. Offsets whose fire time has passed are returned
/// with their original `fire_at` and become due immediately; a target
/// date fully in the past collapses to a single overdue event.
pub fn pending_reminders(
    instance_id: Uuid,
    item_id: Uuid,
    kind: ReminderKind,
    target_at: DateTime<Utc>,
    title: &str,
    fired: &[FiredReminder],
    now: DateTime<Utc>,
) -> Vec<PendingReminder> {
    let already = |label: OffsetLabel| fired.iter().any(|f| f.label == label);

    if target_at <= now {
        if already(OffsetLabel::Overdue) {
            return Vec::new();
        }
        return vec![PendingReminder {
            instance_id,
            item_id,
            kind,
            label: OffsetLabel::Overdue,
            fire_at: target_at,
            target_at,
            title: title.to_string(),
        }];
    }

    let mut pending: Vec<PendingReminder> = offsets_for(kind)
        .into_iter()
        .filter(|(label, _)| !already(*label))
        .map(|(label, offset)| PendingReminder {
            instance_id,
            item_id,
            kind,
            label,
            fire_at: target_at - offset,
            target_at,
            title: title.to_string(),
        })
        .collect();
    pending.sort_by_key(|r| r.fire_at);
    pending
}

/// In-memory index of pending reminders plus the poll loop that routes
/// due firings through the gateway.
pub struct ReminderScheduler {
    index: Mutex<HashMap<Uuid, Vec<PendingReminder>>>,
    poll_interval: std::time::Duration,
    running: AtomicBool,
    stopped: Notify,
}

impl ReminderScheduler {
    pub fn new(poll_interval: std::time::Duration) -> Self {
        Self {
            index: Mutex::new(HashMap::new()),
            poll_interval,
            running: AtomicBool::new(false),
            stopped: Notify::new(),
        }
    }

    /// Insert reminders into the index, replacing any entry with the
    /// same `(item_id, label)` key.
    pub async fn schedule(&self, reminders: Vec<PendingReminder>) {
        if reminders.is_empty() {
            return;
        }
        let mut index = self.index.lock().await;
        for reminder in reminders {
            let slot = index.entry(reminder.instance_id).or_default();
            slot.retain(|r| !(r.item_id == reminder.item_id && r.label == reminder.label));
            debug!(
                instance_id = %reminder.instance_id,
                item_id = %reminder.item_id,
                label = %reminder.label,
                fire_at = %reminder.fire_at,
                "Scheduled reminder"
            );
            slot.push(reminder);
        }
    }

    /// Drop not-yet-fired reminders for one item. Already-fired entries
    /// live in instance state and the audit ledger, untouched here.
    pub async fn cancel_item(&self, instance_id: Uuid, item_id: Uuid) {
        let mut index = self.index.lock().await;
        if let Some(slot) = index.get_mut(&instance_id) {
            let before = slot.len();
            slot.retain(|r| r.item_id != item_id);
            if before != slot.len() {
                debug!(
                    instance_id = %instance_id,
                    item_id = %item_id,
                    cancelled = %(before - slot.len()),
                    "Cancelled pending reminders for item"
                );
            }
        }
    }

    /// Drop every pending reminder for an instance (cancellation or
    /// completion).
    pub async fn cancel_instance(&self, instance_id: Uuid) {
        let mut index = self.index.lock().await;
        if let Some(removed) = index.remove(&instance_id) {
            if !removed.is_empty() {
                info!(
                    instance_id = %instance_id,
                    cancelled = %removed.len(),
                    "Cancelled all pending reminders for instance"
                );
            }
        }
    }

    /// Remove and return every reminder due at `now`, in chronological
    /// order.
    pub async fn due(&self, now: DateTime<Utc>) -> Vec<PendingReminder> {
        let mut index = self.index.lock().await;
        let mut due = Vec::new();
        for slot in index.values_mut() {
            let mut i = 0;
            while i < slot.len() {
                if slot[i].fire_at <= now {
                    due.push(slot.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        index.retain(|_, slot| !slot.is_empty());
        due.sort_by_key(|r| r.fire_at);
        due
    }

    /// Put a reminder back after a transient delivery failure so the
    /// next poll retries it.
    pub async fn restore(&self, reminder: PendingReminder) {
        self.schedule(vec![reminder]).await;
    }

    pub async fn pending_count(&self, instance_id: Uuid) -> usize {
        let index = self.index.lock().await;
        index.get(&instance_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Rebuild the index entry for one instance from its persisted
    /// state. Terminal instances schedule nothing.
    pub async fn rebuild_for_instance(&self, instance: &WorkflowInstance, now: DateTime<Utc>) -> usize {
        if instance.run_state.is_terminal() {
            return 0;
        }
        let mut reminders = Vec::new();
        for deadline in &instance.deadlines {
            reminders.extend(pending_reminders(
                instance.instance_id,
                deadline.deadline_id,
                ReminderKind::Deadline,
                deadline.due_at,
                &deadline.title,
                &deadline.reminders_fired,
                now,
            ));
        }
        for court_date in &instance.court_dates {
            reminders.extend(pending_reminders(
                instance.instance_id,
                court_date.event_id,
                ReminderKind::CourtDate,
                court_date.at,
                &court_date.title,
                &court_date.reminders_fired,
                now,
            ));
        }
        let count = reminders.len();
        self.schedule(reminders).await;
        count
    }

    /// Deliver everything due right now through the gateway. One poll
    /// iteration, also used directly by recovery and tests.
    pub async fn fire_due(&self, gateway: &SignalGateway, now: DateTime<Utc>) -> usize {
        let due = self.due(now).await;
        let mut fired = 0;
        for reminder in due {
            match gateway.deliver_reminder(reminder.clone()).await {
                Ok(_) => fired += 1,
                Err(WorkflowError::TransientInfra { reason }) => {
                    warn!(
                        instance_id = %reminder.instance_id,
                        label = %reminder.label,
                        reason = %reason,
                        "Reminder delivery failed, will retry on next poll"
                    );
                    self.restore(reminder).await;
                }
                Err(e) => {
                    // Rejected by the engine (cancelled, removed,
                    // already fired) — filtered at delivery.
                    debug!(
                        instance_id = %reminder.instance_id,
                        label = %reminder.label,
                        error = %e,
                        "Reminder dropped at delivery"
                    );
                }
            }
        }
        fired
    }

    /// Spawn the poll loop. Stops when `stop()` is called; a delivery
    /// already in flight finishes before the loop exits.
    pub fn spawn(self: Arc<Self>, gateway: Arc<SignalGateway>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let scheduler = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !scheduler.running.load(Ordering::SeqCst) {
                            break;
                        }
                        scheduler.fire_due(&gateway, Utc::now()).await;
                    }
                    _ = scheduler.stopped.notified() => break,
                }
            }
            info!("Reminder scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so a stop raced against an
        // in-flight fire_due still wins on the next select.
        self.stopped.notify_one();
    }
}
