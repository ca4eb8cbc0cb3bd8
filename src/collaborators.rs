//! Collaborator interfaces consumed by the engine's effects: the
//! subject record store and the notification sender. Both are
//! best-effort from the workflow's point of view — failures degrade
//! the transition, never roll it back.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Jitter, Quota, RateLimiter};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::executor::ActivityError;

/// The host application's record for the workflow subject (case file,
/// employee profile). Stage changes and override notes are mirrored
/// onto it.
#[async_trait]
pub trait SubjectRecordStore: Send + Sync {
    async fn update_stage(
        &self,
        subject_id: &str,
        stage_name: &str,
        entered_at: DateTime<Utc>,
    ) -> Result<(), ActivityError>;

    async fn append_note(&self, subject_id: &str, text: &str) -> Result<(), ActivityError>;
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), ActivityError>;
}

/// Rate-limited wrapper for a real delivery channel. Reminder fan-out
/// after recovery can burst, so sends queue behind a direct rate
/// limiter with jitter instead of hammering the provider.
pub struct RateLimitedNotifier {
    inner: Arc<dyn NotificationSender>,
    rate_limiter: DefaultDirectRateLimiter,
}

impl RateLimitedNotifier {
    pub fn new(inner: Arc<dyn NotificationSender>, per_second: u32, burst: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(per_second.max(1)).unwrap())
            .allow_burst(NonZeroU32::new(burst.max(1)).unwrap());
        Self {
            inner,
            rate_limiter: RateLimiter::direct(quota),
        }
    }
}

#[async_trait]
impl NotificationSender for RateLimitedNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), ActivityError> {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(100)))
            .await;
        debug!(recipient = %recipient, "Sending notification");
        self.inner.send(recipient, subject, body).await
    }
}

/// Log-only sender for embedded use and demos.
#[derive(Default)]
pub struct LoggingNotifier;

#[async_trait]
impl NotificationSender for LoggingNotifier {
    async fn send(&self, recipient: &str, subject: &str, _body: &str) -> Result<(), ActivityError> {
        info!(recipient = %recipient, subject = %subject, "Notification");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Recording sender for tests: captures every delivery and can be told
/// to fail the next N sends with a transient error.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    fail_next: Mutex<u32>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }

    pub async fn fail_next(&self, count: u32) {
        *self.fail_next.lock().await = count;
    }
}

#[async_trait]
impl NotificationSender for RecordingNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), ActivityError> {
        {
            let mut fail_next = self.fail_next.lock().await;
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(ActivityError::Transient("notification channel down".to_string()));
            }
        }
        self.sent.lock().await.push(SentNotification {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubjectUpdate {
    Stage {
        subject_id: String,
        stage_name: String,
        entered_at: DateTime<Utc>,
    },
    Note {
        subject_id: String,
        text: String,
    },
}

/// Recording subject store for tests.
#[derive(Default)]
pub struct RecordingSubjectStore {
    updates: Mutex<Vec<SubjectUpdate>>,
}

impl RecordingSubjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn updates(&self) -> Vec<SubjectUpdate> {
        self.updates.lock().await.clone()
    }
}

#[async_trait]
impl SubjectRecordStore for RecordingSubjectStore {
    async fn update_stage(
        &self,
        subject_id: &str,
        stage_name: &str,
        entered_at: DateTime<Utc>,
    ) -> Result<(), ActivityError> {
        self.updates.lock().await.push(SubjectUpdate::Stage {
            subject_id: subject_id.to_string(),
            stage_name: stage_name.to_string(),
            entered_at,
        });
        Ok(())
    }

    async fn append_note(&self, subject_id: &str, text: &str) -> Result<(), ActivityError> {
        self.updates.lock().await.push(SubjectUpdate::Note {
            subject_id: subject_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}
