//! Application status transitions and the approval guard.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::catalog::RequirementCatalog;
use super::domain::{
    Application, ApplicationId, ApplicationStatus, DocumentTypeId, PaymentStatus, ReviewStatus,
};
use super::errors::ReviewError;
use super::repository::ReviewTables;

/// Edges of the application lifecycle.
pub fn is_allowed(from: ApplicationStatus, to: ApplicationStatus) -> bool {
    use ApplicationStatus::*;

    match from {
        Draft => matches!(to, PendingPayment),
        PendingPayment => matches!(to, Submitted | Archived),
        Submitted => matches!(to, UnderReview | Rejected),
        UnderReview => matches!(
            to,
            ForOrientation | Approved | DocumentsNeedRevision | PaymentNeedsRevision | Rejected
        ),
        ForOrientation => matches!(
            to,
            Approved | UnderReview | DocumentsNeedRevision | PaymentNeedsRevision | Rejected
        ),
        DocumentsNeedRevision => matches!(
            to,
            UnderReview | PaymentNeedsRevision | ForOrientation | Approved | Rejected
        ),
        PaymentNeedsRevision => matches!(
            to,
            UnderReview | DocumentsNeedRevision | ForOrientation | Approved | Rejected
        ),
        Approved | Rejected | Archived => false,
    }
}

/// Committed status change, used for logging and notification dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub application_id: ApplicationId,
    pub from: ApplicationStatus,
    pub to: ApplicationStatus,
    pub at: DateTime<Utc>,
}

/// Move an application to `to`, refusing edges the lifecycle does not define.
/// Returns `None` when the application already has that status.
pub fn transition(
    application: &mut Application,
    to: ApplicationStatus,
    now: DateTime<Utc>,
) -> Result<Option<StatusChange>, ReviewError> {
    let from = application.status;
    if from == to {
        return Ok(None);
    }
    if !is_allowed(from, to) {
        return Err(ReviewError::conflict(format!(
            "application cannot move from {from} to {to}"
        )));
    }

    application.status = to;
    application.updated_at = now;
    match to {
        ApplicationStatus::Submitted => application.payment_deadline = None,
        ApplicationStatus::Approved => application.approved_at = Some(now),
        _ => {}
    }

    info!(
        application_id = %application.id,
        from = from.label(),
        to = to.label(),
        "application status changed"
    );

    Ok(Some(StatusChange {
        application_id: application.id,
        from,
        to,
        at: now,
    }))
}

/// Payment situation as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStanding {
    Missing,
    Pending,
    Complete,
    Rejected,
}

/// Facts about an application's documents and payment, gathered inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewFacts {
    pub missing_required: Vec<DocumentTypeId>,
    pub unapproved_required: Vec<DocumentTypeId>,
    pub rejected_documents: Vec<DocumentTypeId>,
    pub payment: PaymentStanding,
    pub orientation_required: bool,
    pub orientation_completed: bool,
}

pub fn gather_facts(
    tables: &ReviewTables,
    catalog: &RequirementCatalog,
    application: &Application,
) -> ReviewFacts {
    let mut missing_required = Vec::new();
    let mut unapproved_required = Vec::new();
    for document_type in catalog.required_types_for(&application.job_category_id) {
        match tables.upload_for(&application.id, &document_type) {
            None => missing_required.push(document_type),
            Some(upload) if upload.review_status != ReviewStatus::Approved => {
                unapproved_required.push(document_type)
            }
            Some(_) => {}
        }
    }

    let rejected_documents = tables
        .uploads_for(&application.id)
        .filter(|upload| upload.review_status == ReviewStatus::Rejected)
        .map(|upload| upload.document_type_id)
        .collect();

    let payment = if tables.has_complete_payment(&application.id) {
        PaymentStanding::Complete
    } else if tables.active_payment(&application.id).is_some() {
        PaymentStanding::Pending
    } else {
        match tables.latest_payment(&application.id).map(|payment| payment.status) {
            Some(PaymentStatus::Failed | PaymentStatus::Cancelled) => PaymentStanding::Rejected,
            _ => PaymentStanding::Missing,
        }
    };

    ReviewFacts {
        missing_required,
        unapproved_required,
        rejected_documents,
        payment,
        orientation_required: catalog.requires_orientation(&application.job_category_id),
        orientation_completed: application.orientation_completed(),
    }
}

/// Reasons an application may not be approved yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "blocker", rename_all = "snake_case")]
pub enum ApprovalBlocker {
    MissingDocument { document_type_id: DocumentTypeId },
    DocumentNotApproved { document_type_id: DocumentTypeId },
    PaymentNotComplete,
    OrientationIncomplete,
}

impl ReviewFacts {
    /// Everything except orientation that must hold before approval.
    pub fn review_blockers(&self) -> Vec<ApprovalBlocker> {
        let mut blockers: Vec<ApprovalBlocker> = self
            .missing_required
            .iter()
            .map(|document_type_id| ApprovalBlocker::MissingDocument {
                document_type_id: *document_type_id,
            })
            .chain(self.unapproved_required.iter().map(|document_type_id| {
                ApprovalBlocker::DocumentNotApproved {
                    document_type_id: *document_type_id,
                }
            }))
            .collect();
        if self.payment != PaymentStanding::Complete {
            blockers.push(ApprovalBlocker::PaymentNotComplete);
        }
        blockers
    }

    pub fn approval_blockers(&self) -> Vec<ApprovalBlocker> {
        let mut blockers = self.review_blockers();
        if self.orientation_required && !self.orientation_completed {
            blockers.push(ApprovalBlocker::OrientationIncomplete);
        }
        blockers
    }
}

/// Status the application should hold given current facts. States outside active review
/// are only moved by explicit events and are returned unchanged.
pub fn evaluate(current: ApplicationStatus, facts: &ReviewFacts) -> ApplicationStatus {
    use ApplicationStatus::*;

    if !matches!(
        current,
        UnderReview | ForOrientation | DocumentsNeedRevision | PaymentNeedsRevision
    ) {
        return current;
    }

    if !facts.rejected_documents.is_empty() {
        return DocumentsNeedRevision;
    }
    if facts.payment == PaymentStanding::Rejected {
        return PaymentNeedsRevision;
    }
    if facts.review_blockers().is_empty() {
        if facts.orientation_required && !facts.orientation_completed {
            return ForOrientation;
        }
        return Approved;
    }
    UnderReview
}

/// Re-derive and commit the application's status inside the caller's transaction. The
/// approval guard is re-checked against the same tables the status write lands in.
pub fn reevaluate(
    tables: &mut ReviewTables,
    catalog: &RequirementCatalog,
    application_id: &ApplicationId,
    now: DateTime<Utc>,
) -> Result<Option<StatusChange>, ReviewError> {
    let application = tables
        .applications
        .get(application_id)
        .ok_or_else(|| ReviewError::not_found("application", application_id))?;
    let facts = gather_facts(tables, catalog, application);
    let target = evaluate(application.status, &facts);

    if target == ApplicationStatus::Approved && !facts.approval_blockers().is_empty() {
        return Err(ReviewError::conflict("approval guard failed"));
    }

    let application = tables
        .applications
        .get_mut(application_id)
        .ok_or_else(|| ReviewError::not_found("application", application_id))?;
    transition(application, target, now)
}

/// First reviewer touch moves a submitted application into review.
pub fn start_review(
    application: &mut Application,
    now: DateTime<Utc>,
) -> Result<Option<StatusChange>, ReviewError> {
    if application.status == ApplicationStatus::Submitted {
        transition(application, ApplicationStatus::UnderReview, now)
    } else {
        Ok(None)
    }
}
