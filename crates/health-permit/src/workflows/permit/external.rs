//! Seams to collaborators outside the review core: time, blob storage, push delivery.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use super::domain::{FileRef, Notification};

/// Source of commit timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Blob storage holding uploaded files and receipts.
pub trait BlobStore: Send + Sync {
    fn delete(&self, file_ref: &FileRef) -> Result<(), BlobError>;
    fn signed_url(&self, file_ref: &FileRef) -> Result<String, BlobError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob {0} not found")]
    Missing(String),
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

/// Outbound push transport for dispatched notifications.
pub trait NotificationPublisher: Send + Sync {
    fn publish(&self, notification: &Notification) -> Result<(), PublishError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}

/// Publisher that drops everything; used when no push transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardPublisher;

impl NotificationPublisher for DiscardPublisher {
    fn publish(&self, _notification: &Notification) -> Result<(), PublishError> {
        Ok(())
    }
}
