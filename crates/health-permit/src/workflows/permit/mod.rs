//! Health-card application review lifecycle.
//!
//! Every mutating operation on [`PermitReviewService`] runs as one [`ReviewStore`]
//! transaction: the gate check, ledger and audit writes, status re-evaluation, and inbox
//! records commit together or not at all. Notifications reach the [`NotificationPublisher`]
//! only after commit.

pub mod audit;
pub mod authorization;
pub mod catalog;
pub mod documents;
pub mod domain;
pub mod errors;
pub mod external;
pub mod health_card;
pub mod notifications;
pub mod orientation;
pub mod payments;
pub mod repository;
pub mod router;
pub mod service;
pub mod state_machine;
pub mod sweep;

#[cfg(test)]
mod tests;

pub use audit::{
    AuditRef, DocumentRejectionRecord, PaymentRejectionRecord, RejectionCategory,
    RejectionDetail, AUDIT_SCHEMA_VERSION,
};
pub use authorization::{AccessDenied, Action, Principal};
pub use catalog::{Requirement, RequirementCatalog};
pub use documents::{DocumentReviewOutcome, ResubmissionOutcome, ReviewDecision};
pub use domain::{
    Application, ApplicationForm, ApplicationId, ApplicationStatus, ClassificationHint,
    DocumentType, DocumentTypeId, DocumentUpload, FileRef, HealthCard, JobCategory,
    JobCategoryDocument, JobCategoryId, ManagedCategories, Notification, NotificationId,
    NotificationKind, OrientationSlot, OrientationSlotId, Payment, PaymentId, PaymentMethod,
    PaymentStatus, ReviewStatus, Role, Sex, UploadId, User, UserId,
};
pub use errors::{ErrorKind, ReviewError};
pub use external::{
    BlobError, BlobStore, Clock, DiscardPublisher, ManualClock, NotificationPublisher,
    PublishError, SystemClock,
};
pub use health_card::{CardStanding, CardVerification};
pub use notifications::NotificationView;
pub use orientation::{SlotAvailability, SlotRequest};
pub use payments::{
    GatewayConfirmation, GatewayOutcome, PaymentHistory, PaymentRequest, PaymentResubmission,
    PaymentReviewOutcome,
};
pub use repository::{InMemoryReviewStore, RepositoryError, ReviewStore, ReviewTables};
pub use router::permit_router;
pub use service::{ApplicationDetail, ChecklistItem, PermitReviewService, QueueEntry, ReviewPolicy};
pub use state_machine::{ApprovalBlocker, StatusChange};
pub use sweep::SweepReport;
