//! Notification fan-out for review events.
//!
//! [`dispatch`] is a pure function of an event. Applicant notifications are persisted as
//! inbox records; the admin feed is re-derived from the audit trails on every read
//! ([`admin_feed`]) so read state lives in one place, the records' `admin_read_by` sets.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::audit::AuditRef;
use super::catalog::RequirementCatalog;
use super::domain::{
    ApplicationId, ApplicationStatus, DocumentTypeId, JobCategoryId, Notification,
    NotificationId, NotificationKind, Role, User, UserId,
};
use super::repository::ReviewTables;
use super::state_machine::StatusChange;

/// State-changing event the dispatcher reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewEvent {
    DocumentRejected {
        application_id: ApplicationId,
        applicant_id: UserId,
        document_name: String,
        reason: String,
        attempt_number: u32,
    },
    DocumentResubmitted {
        application_id: ApplicationId,
        job_category_id: JobCategoryId,
        applicant_name: String,
        document_name: String,
        attempt_number: u32,
    },
    PaymentRejected {
        application_id: ApplicationId,
        applicant_id: UserId,
        reason: String,
        attempt_number: u32,
    },
    PaymentResubmitted {
        application_id: ApplicationId,
        job_category_id: JobCategoryId,
        applicant_name: String,
        attempt_number: u32,
    },
    PaymentConfirmed {
        application_id: ApplicationId,
        applicant_id: UserId,
        net_amount: u64,
    },
    StatusChanged {
        change: StatusChange,
        applicant_id: UserId,
        remarks: Option<String>,
    },
}

pub fn application_url(application_id: &ApplicationId) -> String {
    format!("/applications/{application_id}")
}

fn notification(
    recipient_id: UserId,
    application_id: ApplicationId,
    kind: NotificationKind,
    title: &str,
    message: String,
    now: DateTime<Utc>,
) -> Notification {
    Notification {
        id: NotificationId::new(),
        recipient_id,
        application_id: Some(application_id),
        kind,
        title: title.to_string(),
        message,
        is_read: false,
        action_url: Some(application_url(&application_id)),
        created_at: now,
    }
}

/// Reviewers who should hear about activity in `category`: admins listing it explicitly plus
/// super-admins, or every reviewer when nobody lists it.
pub fn admin_recipients<'a>(
    users: impl IntoIterator<Item = &'a User>,
    category: &JobCategoryId,
) -> Vec<UserId> {
    let reviewers: Vec<&User> = users
        .into_iter()
        .filter(|user| user.role.is_reviewer())
        .collect();

    let listed = reviewers
        .iter()
        .any(|user| user.scope().lists(category));
    if !listed {
        return reviewers.iter().map(|user| user.id).collect();
    }

    reviewers
        .iter()
        .filter(|user| user.scope().covers(category))
        .map(|user| user.id)
        .collect()
}

/// Notifications produced by `event`. `users` is only consulted for admin fan-out.
pub fn dispatch<'a>(
    event: &ReviewEvent,
    users: impl IntoIterator<Item = &'a User>,
    now: DateTime<Utc>,
) -> Vec<Notification> {
    match event {
        ReviewEvent::DocumentRejected {
            application_id,
            applicant_id,
            document_name,
            reason,
            attempt_number,
        } => vec![notification(
            *applicant_id,
            *application_id,
            NotificationKind::DocumentRejected,
            "Document needs resubmission",
            format!(
                "Your {document_name} was rejected (attempt {attempt_number}): {reason}. \
                 Please upload a corrected file."
            ),
            now,
        )],
        ReviewEvent::DocumentResubmitted {
            application_id,
            job_category_id,
            applicant_name,
            document_name,
            attempt_number,
        } => admin_recipients(users, job_category_id)
            .into_iter()
            .map(|admin| {
                notification(
                    admin,
                    *application_id,
                    NotificationKind::DocumentResubmitted,
                    "Document resubmitted",
                    format!(
                        "{applicant_name} resubmitted {document_name} after rejection \
                         #{attempt_number}."
                    ),
                    now,
                )
            })
            .collect(),
        ReviewEvent::PaymentRejected {
            application_id,
            applicant_id,
            reason,
            attempt_number,
        } => vec![notification(
            *applicant_id,
            *application_id,
            NotificationKind::PaymentRejected,
            "Payment needs resubmission",
            format!("Your payment was rejected (attempt {attempt_number}): {reason}."),
            now,
        )],
        ReviewEvent::PaymentResubmitted {
            application_id,
            job_category_id,
            applicant_name,
            attempt_number,
        } => admin_recipients(users, job_category_id)
            .into_iter()
            .map(|admin| {
                notification(
                    admin,
                    *application_id,
                    NotificationKind::PaymentResubmitted,
                    "Payment resubmitted",
                    format!(
                        "{applicant_name} submitted a new payment after rejection \
                         #{attempt_number}."
                    ),
                    now,
                )
            })
            .collect(),
        ReviewEvent::PaymentConfirmed {
            application_id,
            applicant_id,
            net_amount,
        } => vec![notification(
            *applicant_id,
            *application_id,
            NotificationKind::PaymentConfirmed,
            "Payment received",
            format!(
                "We received your payment of {}.{:02}.",
                net_amount / 100,
                net_amount % 100
            ),
            now,
        )],
        ReviewEvent::StatusChanged {
            change,
            applicant_id,
            remarks,
        } => {
            let remarks = remarks
                .as_deref()
                .map(|text| format!(" Remarks: {text}"))
                .unwrap_or_default();
            let (kind, title, message) = match change.to {
                ApplicationStatus::Approved => (
                    NotificationKind::ApplicationApproved,
                    "Application approved",
                    format!("Your health card application was approved.{remarks}"),
                ),
                ApplicationStatus::Rejected => (
                    NotificationKind::ApplicationRejected,
                    "Application rejected",
                    format!("Your health card application was rejected.{remarks}"),
                ),
                ApplicationStatus::Archived => (
                    NotificationKind::ApplicationArchived,
                    "Application archived",
                    "The payment deadline passed. Please start a new application.".to_string(),
                ),
                ApplicationStatus::ForOrientation => (
                    NotificationKind::OrientationRequired,
                    "Orientation required",
                    "All requirements are approved. Book an orientation slot to finish."
                        .to_string(),
                ),
                _ => return Vec::new(),
            };
            vec![notification(
                *applicant_id,
                change.application_id,
                kind,
                title,
                message,
                now,
            )]
        }
    }
}

/// Inbox entry as returned to a caller; feed items carry the audit record they derive from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationView {
    #[serde(flatten)]
    pub notification: Notification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<AuditRef>,
}

fn visible_to(
    tables: &ReviewTables,
    admin: &User,
    application_id: &ApplicationId,
) -> Option<JobCategoryId> {
    let category = tables.application(application_id)?.job_category_id;
    admin_recipients(tables.users.values(), &category)
        .contains(&admin.id)
        .then_some(category)
}

fn document_name(catalog: &RequirementCatalog, id: &DocumentTypeId) -> String {
    catalog
        .document_type(id)
        .map(|document_type| document_type.name.clone())
        .unwrap_or_else(|| "document".to_string())
}

/// Unread rejection and resubmission records scoped to `admin`, newest first.
pub fn admin_feed(
    tables: &ReviewTables,
    catalog: &RequirementCatalog,
    admin: &User,
) -> Vec<NotificationView> {
    let mut items = Vec::new();

    for record in &tables.document_rejections {
        if record.admin_read_by.contains(&admin.id)
            || (!record.was_replaced && record.rejected_by == admin.id)
            || visible_to(tables, admin, &record.application_id).is_none()
        {
            continue;
        }
        let name = document_name(catalog, &record.document_type_id);
        let (kind, title, message, at) = match (record.was_replaced, record.replaced_at) {
            (true, Some(replaced_at)) => (
                NotificationKind::DocumentResubmitted,
                "Document resubmitted",
                format!("{name} was resubmitted after rejection #{}.", record.attempt_number),
                replaced_at,
            ),
            _ => (
                NotificationKind::DocumentRejected,
                "Document rejected",
                format!(
                    "{name} was rejected (attempt {}): {}",
                    record.attempt_number, record.reason
                ),
                record.rejected_at,
            ),
        };
        items.push(NotificationView {
            notification: Notification {
                id: NotificationId(record.id.0),
                recipient_id: admin.id,
                application_id: Some(record.application_id),
                kind,
                title: title.to_string(),
                message,
                is_read: false,
                action_url: Some(application_url(&record.application_id)),
                created_at: at,
            },
            source: Some(AuditRef::Document(record.id)),
        });
    }

    for record in &tables.payment_rejections {
        if record.admin_read_by.contains(&admin.id)
            || (!record.was_replaced && record.rejected_by == admin.id)
            || visible_to(tables, admin, &record.application_id).is_none()
        {
            continue;
        }
        let (kind, title, message, at) = match (record.was_replaced, record.replaced_at) {
            (true, Some(replaced_at)) => (
                NotificationKind::PaymentResubmitted,
                "Payment resubmitted",
                format!(
                    "A new payment was submitted after rejection #{}.",
                    record.attempt_number
                ),
                replaced_at,
            ),
            _ => (
                NotificationKind::PaymentRejected,
                "Payment rejected",
                format!(
                    "Payment was rejected (attempt {}): {}",
                    record.attempt_number, record.reason
                ),
                record.rejected_at,
            ),
        };
        items.push(NotificationView {
            notification: Notification {
                id: NotificationId(record.id.0),
                recipient_id: admin.id,
                application_id: Some(record.application_id),
                kind,
                title: title.to_string(),
                message,
                is_read: false,
                action_url: Some(application_url(&record.application_id)),
                created_at: at,
            },
            source: Some(AuditRef::Payment(record.id)),
        });
    }

    items.sort_by(|a, b| b.notification.created_at.cmp(&a.notification.created_at));
    items
}

/// Stored inbox records for `recipient`, newest first.
pub fn inbox(tables: &ReviewTables, recipient: &UserId) -> Vec<NotificationView> {
    let mut items: Vec<NotificationView> = tables
        .notifications
        .values()
        .filter(|notification| &notification.recipient_id == recipient)
        .cloned()
        .map(|notification| NotificationView {
            notification,
            source: None,
        })
        .collect();
    items.sort_by(|a, b| b.notification.created_at.cmp(&a.notification.created_at));
    items
}

/// Which dispatched notifications are persisted as inbox records.
pub fn is_persisted_for(role: Role) -> bool {
    !role.is_reviewer()
}

/// Record ids an admin has acknowledged, for tests and diagnostics.
pub fn acknowledged_by(tables: &ReviewTables, admin: &UserId) -> BTreeSet<AuditRef> {
    let documents = tables
        .document_rejections
        .iter()
        .filter(|record| record.admin_read_by.contains(admin))
        .map(|record| AuditRef::Document(record.id));
    let payments = tables
        .payment_rejections
        .iter()
        .filter(|record| record.admin_read_by.contains(admin))
        .map(|record| AuditRef::Payment(record.id));
    documents.chain(payments).collect()
}
