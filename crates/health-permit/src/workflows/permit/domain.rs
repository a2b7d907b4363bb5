use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

record_id!(
    /// Identifier for a health-card application.
    ApplicationId
);
record_id!(UserId);
record_id!(JobCategoryId);
record_id!(DocumentTypeId);
record_id!(
    /// Identifier for the single ledger row of an (application, document type) pair.
    UploadId
);
record_id!(PaymentId);
record_id!(RejectionId);
record_id!(NotificationId);
record_id!(OrientationSlotId);

/// Opaque reference to a file held by the blob store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRef(pub String);

impl FileRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authoritative status of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Draft,
    PendingPayment,
    Submitted,
    UnderReview,
    ForOrientation,
    DocumentsNeedRevision,
    PaymentNeedsRevision,
    Approved,
    Rejected,
    Archived,
}

impl ApplicationStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ApplicationStatus::Draft => "Draft",
            ApplicationStatus::PendingPayment => "Pending Payment",
            ApplicationStatus::Submitted => "Submitted",
            ApplicationStatus::UnderReview => "Under Review",
            ApplicationStatus::ForOrientation => "For Orientation",
            ApplicationStatus::DocumentsNeedRevision => "Documents Need Revision",
            ApplicationStatus::PaymentNeedsRevision => "Payment Needs Revision",
            ApplicationStatus::Approved => "Approved",
            ApplicationStatus::Rejected => "Rejected",
            ApplicationStatus::Archived => "Archived",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            ApplicationStatus::Approved | ApplicationStatus::Rejected | ApplicationStatus::Archived
        )
    }

    /// States in which reviewers may act on documents, payments, or the application itself.
    pub const fn is_in_review(self) -> bool {
        matches!(
            self,
            ApplicationStatus::Submitted
                | ApplicationStatus::UnderReview
                | ApplicationStatus::ForOrientation
                | ApplicationStatus::DocumentsNeedRevision
                | ApplicationStatus::PaymentNeedsRevision
        )
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Demographic fields captured on the application form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationForm {
    pub first_name: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub sex: Sex,
    pub address: String,
    pub contact_number: String,
    #[serde(default)]
    pub nationality: Option<String>,
    #[serde(default)]
    pub establishment: Option<String>,
}

impl ApplicationForm {
    pub fn full_name(&self) -> String {
        match self.middle_name.as_deref().map(str::trim) {
            Some(middle) if !middle.is_empty() => {
                format!("{} {} {}", self.first_name.trim(), middle, self.last_name.trim())
            }
            _ => format!("{} {}", self.first_name.trim(), self.last_name.trim()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Female,
    Male,
    Unspecified,
}

/// Progress of the in-person orientation for categories that require one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrientationAttendance {
    pub slot_id: OrientationSlotId,
    pub booked_at: DateTime<Utc>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub checked_in_by: Option<UserId>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<UserId>,
}

impl OrientationAttendance {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// One applicant's health-card request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub owner_id: UserId,
    pub job_category_id: JobCategoryId,
    pub form: ApplicationForm,
    pub status: ApplicationStatus,
    pub payment_deadline: Option<DateTime<Utc>>,
    pub admin_remarks: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub orientation: Option<OrientationAttendance>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    pub fn orientation_completed(&self) -> bool {
        self.orientation
            .as_ref()
            .is_some_and(OrientationAttendance::is_completed)
    }
}

/// Static reference data describing a kind of supporting document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentType {
    pub id: DocumentTypeId,
    pub name: String,
    pub field_name: String,
    pub required_by_default: bool,
}

/// Occupational grouping that decides the document checklist and orientation requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCategory {
    pub id: JobCategoryId,
    pub name: String,
    pub require_orientation: bool,
}

/// Checklist row joining a job category to a document type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCategoryDocument {
    pub job_category_id: JobCategoryId,
    pub document_type_id: DocumentTypeId,
    pub is_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }
}

/// Untrusted OCR/classification output attached to an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationHint {
    pub suggested_field: Option<String>,
    pub confidence: f32,
    #[serde(default)]
    pub extracted_fields: Vec<(String, String)>,
    pub recorded_at: DateTime<Utc>,
}

/// Current-state ledger row for one (application, document type) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpload {
    pub id: UploadId,
    pub application_id: ApplicationId,
    pub document_type_id: DocumentTypeId,
    pub file_ref: FileRef,
    pub review_status: ReviewStatus,
    pub reviewed_by: Option<UserId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub admin_remarks: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub classification: Option<ClassificationHint>,
}

impl DocumentUpload {
    /// Swap in a new file and clear every trace of the previous review.
    pub(crate) fn replace_file(&mut self, file_ref: FileRef, now: DateTime<Utc>) {
        self.file_ref = file_ref;
        self.review_status = ReviewStatus::Pending;
        self.reviewed_by = None;
        self.reviewed_at = None;
        self.admin_remarks = None;
        self.classification = None;
        self.uploaded_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Hosted checkout; completion arrives through the gateway callback.
    OnlineGateway,
    OverTheCounter,
    BankDeposit,
}

impl PaymentMethod {
    pub const fn requires_reference(self) -> bool {
        !matches!(self, PaymentMethod::OnlineGateway)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Complete,
    Failed,
    Refunded,
    Cancelled,
}

impl PaymentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Complete => "complete",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    /// Pending and Complete payments block a new payment from being recorded.
    pub const fn is_active(self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Complete)
    }

    /// Terminal states a resubmission may supersede.
    pub const fn is_supersedable(self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Cancelled)
    }
}

/// Payment ledger row. Amounts are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub application_id: ApplicationId,
    pub amount: u64,
    pub service_fee: u64,
    pub net_amount: u64,
    pub method: PaymentMethod,
    pub reference_number: Option<String>,
    pub status: PaymentStatus,
    pub receipt_ref: Option<FileRef>,
    pub checkout_session_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    /// Set once a resubmission links a newer payment to this failed or cancelled one.
    #[serde(default)]
    pub superseded_by: Option<PaymentId>,
    pub reviewed_by: Option<UserId>,
    pub admin_remarks: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Applicant,
    Inspector,
    Admin,
    SystemAdmin,
}

impl Role {
    pub const fn label(self) -> &'static str {
        match self {
            Role::Applicant => "applicant",
            Role::Inspector => "inspector",
            Role::Admin => "admin",
            Role::SystemAdmin => "system_admin",
        }
    }

    pub const fn is_reviewer(self) -> bool {
        matches!(self, Role::Admin | Role::SystemAdmin)
    }
}

/// Job categories an admin may review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedCategories {
    All,
    Only(BTreeSet<JobCategoryId>),
}

impl ManagedCategories {
    pub fn covers(&self, category: &JobCategoryId) -> bool {
        match self {
            ManagedCategories::All => true,
            ManagedCategories::Only(categories) => categories.contains(category),
        }
    }

    /// True only for an explicit listing, not for the super-admin sentinel.
    pub fn lists(&self, category: &JobCategoryId) -> bool {
        matches!(self, ManagedCategories::Only(categories) if categories.contains(category))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub role: Role,
    #[serde(default)]
    pub managed_categories: Option<ManagedCategories>,
}

impl User {
    /// Scope used by the gate: system admins and admins without a listing default differently.
    pub fn scope(&self) -> ManagedCategories {
        match (self.role, &self.managed_categories) {
            (Role::SystemAdmin, _) => ManagedCategories::All,
            (_, Some(scope)) => scope.clone(),
            (_, None) => ManagedCategories::Only(BTreeSet::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DocumentRejected,
    DocumentResubmitted,
    PaymentRejected,
    PaymentResubmitted,
    PaymentConfirmed,
    OrientationRequired,
    ApplicationApproved,
    ApplicationRejected,
    ApplicationArchived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient_id: UserId,
    pub application_id: Option<ApplicationId>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub is_read: bool,
    pub action_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Scheduled in-person orientation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrientationSlot {
    pub id: OrientationSlotId,
    pub starts_at: DateTime<Utc>,
    pub venue: String,
    pub inspector_id: Option<UserId>,
    pub capacity: u32,
}

/// Card issued once an application is approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCard {
    pub card_number: String,
    pub application_id: ApplicationId,
    pub holder_name: String,
    pub job_category_id: JobCategoryId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub verification_code: String,
}
