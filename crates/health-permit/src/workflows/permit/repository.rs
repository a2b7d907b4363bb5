use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::audit::{
    deserialize_document_trail, deserialize_payment_trail, DocumentRejectionRecord,
    PaymentRejectionRecord,
};
use super::domain::{
    Application, ApplicationId, DocumentTypeId, DocumentUpload, HealthCard, Notification,
    NotificationId, OrientationSlot, OrientationSlotId, Payment, PaymentId, PaymentStatus,
    UploadId, User, UserId,
};

/// Every durable record owned by the review core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewTables {
    #[serde(default)]
    pub users: BTreeMap<UserId, User>,
    #[serde(default)]
    pub applications: BTreeMap<ApplicationId, Application>,
    #[serde(default)]
    pub uploads: BTreeMap<UploadId, DocumentUpload>,
    #[serde(default, deserialize_with = "deserialize_document_trail")]
    pub document_rejections: Vec<DocumentRejectionRecord>,
    #[serde(default)]
    pub payments: BTreeMap<PaymentId, Payment>,
    #[serde(default, deserialize_with = "deserialize_payment_trail")]
    pub payment_rejections: Vec<PaymentRejectionRecord>,
    #[serde(default)]
    pub notifications: BTreeMap<NotificationId, Notification>,
    #[serde(default)]
    pub orientation_slots: BTreeMap<OrientationSlotId, OrientationSlot>,
    #[serde(default)]
    pub health_cards: BTreeMap<ApplicationId, HealthCard>,
}

impl ReviewTables {
    pub fn upload_for(
        &self,
        application_id: &ApplicationId,
        document_type_id: &DocumentTypeId,
    ) -> Option<&DocumentUpload> {
        self.uploads.values().find(|upload| {
            &upload.application_id == application_id
                && &upload.document_type_id == document_type_id
        })
    }

    pub fn uploads_for(
        &self,
        application_id: &ApplicationId,
    ) -> impl Iterator<Item = &DocumentUpload> + '_ {
        let application_id = *application_id;
        self.uploads
            .values()
            .filter(move |upload| upload.application_id == application_id)
    }

    pub fn payments_for(
        &self,
        application_id: &ApplicationId,
    ) -> impl Iterator<Item = &Payment> + '_ {
        let application_id = *application_id;
        self.payments
            .values()
            .filter(move |payment| payment.application_id == application_id)
    }

    /// The pending or complete payment, if any.
    pub fn active_payment(&self, application_id: &ApplicationId) -> Option<&Payment> {
        self.payments_for(application_id)
            .find(|payment| payment.status.is_active())
    }

    /// Latest payment by creation time, whatever its status.
    pub fn latest_payment(&self, application_id: &ApplicationId) -> Option<&Payment> {
        self.payments_for(application_id)
            .max_by_key(|payment| payment.created_at)
    }

    pub fn has_complete_payment(&self, application_id: &ApplicationId) -> bool {
        self.payments_for(application_id)
            .any(|payment| payment.status == PaymentStatus::Complete)
    }

    pub fn application(&self, id: &ApplicationId) -> Option<&Application> {
        self.applications.get(id)
    }
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("audit export failed: {0}")]
    Export(#[from] csv::Error),
}

/// Storage abstraction so the service can run against any transactional backend.
///
/// `transaction` must apply all of `work`'s mutations or none of them, and must serialize
/// concurrent transactions that touch the same application. `read` hands out a consistent
/// snapshot and never blocks writers for longer than the copy.
pub trait ReviewStore: Send + Sync {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut ReviewTables) -> Result<T, E>,
        E: From<RepositoryError>;

    fn read<T, F>(&self, view: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&ReviewTables) -> T;
}

/// Mutex-backed store with copy-on-write commits.
///
/// Every transaction clones the full table set before running `work`, so cost grows with the
/// whole ledger rather than with the rows touched. Suitable for tests, demos and small
/// deployments; larger datasets need a `ReviewStore` over a real database.
#[derive(Debug, Default)]
pub struct InMemoryReviewStore {
    tables: Mutex<ReviewTables>,
}

impl InMemoryReviewStore {
    pub fn new(tables: ReviewTables) -> Self {
        Self {
            tables: Mutex::new(tables),
        }
    }

    /// Load a snapshot written by [`InMemoryReviewStore::save_snapshot`]; legacy audit rows
    /// are normalized while decoding.
    pub fn load_snapshot(path: &Path) -> Result<Self, RepositoryError> {
        let bytes = std::fs::read(path)?;
        let tables: ReviewTables = serde_json::from_slice(&bytes)?;
        Ok(Self::new(tables))
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), RepositoryError> {
        let bytes = {
            let guard = self.lock()?;
            serde_json::to_vec_pretty(&*guard)?
        };
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, bytes)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ReviewTables>, RepositoryError> {
        self.tables
            .lock()
            .map_err(|_| RepositoryError::Unavailable("review store mutex poisoned".to_string()))
    }
}

impl ReviewStore for InMemoryReviewStore {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut ReviewTables) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut guard = self.lock()?;
        let mut staged = guard.clone();
        let outcome = work(&mut staged)?;
        *guard = staged;
        Ok(outcome)
    }

    fn read<T, F>(&self, view: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&ReviewTables) -> T,
    {
        let guard = self.lock()?;
        Ok(view(&guard))
    }
}
