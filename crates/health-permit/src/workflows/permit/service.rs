use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::audit::{AuditRef, DocumentRejectionRecord};
use super::authorization::{self, Action, Principal, Resource};
use super::catalog::RequirementCatalog;
use super::domain::{
    Application, ApplicationForm, ApplicationId, ApplicationStatus, DocumentType,
    DocumentUpload, HealthCard, JobCategory, JobCategoryId, ManagedCategories, Notification,
    NotificationId, Payment, PaymentId, PaymentMethod, PaymentStatus, ReviewStatus, Role, User,
    UserId,
};
use super::errors::ReviewError;
use super::external::{BlobStore, Clock, NotificationPublisher, SystemClock};
use super::health_card;
use super::notifications::{self, NotificationView, ReviewEvent};
use super::repository::{ReviewStore, ReviewTables};
use super::state_machine::{self, ApprovalBlocker, StatusChange};

/// Time-based dials for the review lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPolicy {
    pub payment_deadline_days: i64,
    pub card_validity_days: i64,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self {
            payment_deadline_days: 7,
            card_validity_days: 365,
        }
    }
}

/// Notifications collected inside a transaction, published only after it commits.
pub(crate) type Outbox = Vec<Notification>;

/// Service composing the ledgers, audit trails, state machine, gate, and dispatcher.
pub struct PermitReviewService<S> {
    pub(crate) store: Arc<S>,
    pub(crate) catalog: Arc<RequirementCatalog>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    publisher: Arc<dyn NotificationPublisher>,
    clock: Arc<dyn Clock>,
    pub(crate) policy: ReviewPolicy,
}

impl<S> PermitReviewService<S>
where
    S: ReviewStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        catalog: Arc<RequirementCatalog>,
        blobs: Arc<dyn BlobStore>,
        publisher: Arc<dyn NotificationPublisher>,
    ) -> Self {
        Self {
            store,
            catalog,
            blobs,
            publisher,
            clock: Arc::new(SystemClock),
            policy: ReviewPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: ReviewPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn catalog(&self) -> &RequirementCatalog {
        &self.catalog
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `work` as one atomic unit; notifications it queued go out only after commit.
    pub(crate) fn atomically<T, F>(&self, work: F) -> Result<T, ReviewError>
    where
        F: FnOnce(&mut ReviewTables, &mut Outbox) -> Result<T, ReviewError>,
    {
        let mut outbox = Outbox::new();
        let value = self
            .store
            .transaction(|tables| work(tables, &mut outbox))?;
        self.publish(outbox);
        Ok(value)
    }

    pub(crate) fn snapshot<T, F>(&self, view: F) -> Result<T, ReviewError>
    where
        F: FnOnce(&ReviewTables) -> Result<T, ReviewError>,
    {
        self.store.read(view)?
    }

    fn publish(&self, outbox: Outbox) {
        for notification in &outbox {
            if let Err(err) = self.publisher.publish(notification) {
                warn!(
                    notification_id = %notification.id,
                    recipient_id = %notification.recipient_id,
                    error = %err,
                    "notification delivery failed"
                );
            }
        }
    }

    /// Dispatch `event`, persisting inbox records for non-reviewer recipients.
    pub(crate) fn emit(
        &self,
        tables: &mut ReviewTables,
        outbox: &mut Outbox,
        event: &ReviewEvent,
        now: DateTime<Utc>,
    ) {
        let dispatched = notifications::dispatch(event, tables.users.values(), now);
        for notification in dispatched {
            let persist = tables
                .users
                .get(&notification.recipient_id)
                .map_or(true, |user| notifications::is_persisted_for(user.role));
            if persist {
                tables
                    .notifications
                    .insert(notification.id, notification.clone());
            }
            outbox.push(notification);
        }
    }

    /// Re-derive the application's status and run the side effects of any change.
    pub(crate) fn settle(
        &self,
        tables: &mut ReviewTables,
        outbox: &mut Outbox,
        application_id: &ApplicationId,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusChange>, ReviewError> {
        let change = state_machine::reevaluate(tables, &self.catalog, application_id, now)?;
        if let Some(change) = change {
            self.after_transition(tables, outbox, change, None)?;
        }
        Ok(change)
    }

    pub(crate) fn after_transition(
        &self,
        tables: &mut ReviewTables,
        outbox: &mut Outbox,
        change: StatusChange,
        remarks: Option<String>,
    ) -> Result<(), ReviewError> {
        let application = load_application(tables, &change.application_id)?.clone();
        if change.to == ApplicationStatus::Approved {
            let card = health_card::issue(&application, change.at, self.policy.card_validity_days);
            info!(
                application_id = %application.id,
                card_number = %card.card_number,
                "health card issued"
            );
            tables.health_cards.insert(application.id, card);
        }
        self.emit(
            tables,
            outbox,
            &ReviewEvent::StatusChanged {
                change,
                applicant_id: application.owner_id,
                remarks,
            },
            change.at,
        );
        Ok(())
    }

    /// Self-registration hook for the identity provider: first sight of a principal creates
    /// an applicant record. Existing users are returned unchanged.
    pub fn register_applicant(
        &self,
        principal: &Principal,
        display_name: &str,
    ) -> Result<User, ReviewError> {
        if display_name.trim().is_empty() {
            return Err(ReviewError::validation("display name is required"));
        }
        self.atomically(|tables, _| {
            let user = tables
                .users
                .entry(principal.user_id)
                .or_insert_with(|| User {
                    id: principal.user_id,
                    display_name: display_name.trim().to_string(),
                    role: Role::Applicant,
                    managed_categories: None,
                });
            Ok(user.clone())
        })
    }

    /// Role and category management, restricted to system admins.
    pub fn assign_role(
        &self,
        principal: &Principal,
        target: &UserId,
        role: Role,
        managed_categories: Option<ManagedCategories>,
    ) -> Result<User, ReviewError> {
        if role != Role::Admin && managed_categories.is_some() {
            return Err(ReviewError::validation(
                "managed categories only apply to admins",
            ));
        }
        if let Some(ManagedCategories::Only(categories)) = &managed_categories {
            if let Some(unknown) = categories
                .iter()
                .find(|category| self.catalog.job_category(category).is_none())
            {
                return Err(ReviewError::validation(format!(
                    "unknown job category {unknown}"
                )));
            }
        }

        self.atomically(|tables, _| {
            let caller = authorization::resolve(tables, principal)?;
            authorization::authorize(&caller, Action::ManageRoles, Resource::System)?;

            let user = tables
                .users
                .get_mut(target)
                .ok_or_else(|| ReviewError::not_found("user", target))?;
            user.role = role;
            user.managed_categories = managed_categories;
            info!(user_id = %user.id, role = role.label(), actor = %caller.id, "role assigned");
            Ok(user.clone())
        })
    }

    /// Create a draft application for the calling applicant.
    pub fn create_application(
        &self,
        principal: &Principal,
        job_category_id: JobCategoryId,
        form: ApplicationForm,
    ) -> Result<Application, ReviewError> {
        let now = self.now();
        validate_form(&form, now)?;
        if self.catalog.job_category(&job_category_id).is_none() {
            return Err(ReviewError::validation(format!(
                "unknown job category {job_category_id}"
            )));
        }

        self.atomically(|tables, _| {
            let user = authorization::resolve(tables, principal)?;
            authorization::authorize(&user, Action::ManageOwnApplication, Resource::System)?;

            let application = Application {
                id: ApplicationId::new(),
                owner_id: user.id,
                job_category_id,
                form,
                status: ApplicationStatus::Draft,
                payment_deadline: None,
                admin_remarks: None,
                approved_at: None,
                orientation: None,
                created_at: now,
                updated_at: now,
            };
            tables.applications.insert(application.id, application.clone());
            info!(application_id = %application.id, owner_id = %user.id, "application created");
            Ok(application)
        })
    }

    /// Edit pre-submission fields.
    pub fn update_application_form(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
        form: ApplicationForm,
    ) -> Result<Application, ReviewError> {
        let now = self.now();
        validate_form(&form, now)?;

        self.atomically(|tables, _| {
            let user = authorization::resolve(tables, principal)?;
            let application = load_application(tables, application_id)?;
            authorization::authorize(
                &user,
                Action::ManageOwnApplication,
                Resource::Application(application),
            )?;
            if !matches!(
                application.status,
                ApplicationStatus::Draft | ApplicationStatus::PendingPayment
            ) {
                return Err(ReviewError::conflict(
                    "application already submitted; form is locked",
                ));
            }

            let application = load_application_mut(tables, application_id)?;
            application.form = form;
            application.updated_at = now;
            Ok(application.clone())
        })
    }

    /// `Draft -> Pending Payment`; starts the payment deadline clock from creation time.
    pub fn complete_application_form(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
    ) -> Result<Application, ReviewError> {
        let now = self.now();
        self.atomically(|tables, _| {
            let user = authorization::resolve(tables, principal)?;
            let application = load_application(tables, application_id)?;
            authorization::authorize(
                &user,
                Action::ManageOwnApplication,
                Resource::Application(application),
            )?;
            validate_form(&application.form, now)?;

            let deadline_days = self.policy.payment_deadline_days;
            let application = load_application_mut(tables, application_id)?;
            state_machine::transition(application, ApplicationStatus::PendingPayment, now)?;
            application.payment_deadline =
                Some(application.created_at + Duration::days(deadline_days));
            Ok(application.clone())
        })
    }

    /// `Pending Payment -> Submitted` with the payment the applicant selected.
    pub fn submit_application(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
        payment_id: &PaymentId,
    ) -> Result<ApplicationStatus, ReviewError> {
        let now = self.now();
        self.atomically(|tables, _| {
            let user = authorization::resolve(tables, principal)?;
            let application = load_application(tables, application_id)?;
            authorization::authorize(
                &user,
                Action::ManageOwnApplication,
                Resource::Application(application),
            )?;
            if application.status != ApplicationStatus::PendingPayment {
                return Err(ReviewError::conflict(format!(
                    "application is {}, not {}",
                    application.status,
                    ApplicationStatus::PendingPayment
                )));
            }

            let payment = tables
                .payments
                .get(payment_id)
                .ok_or_else(|| ReviewError::not_found("payment", payment_id))?;
            if &payment.application_id != application_id {
                return Err(ReviewError::conflict(
                    "payment belongs to a different application",
                ));
            }
            ensure_submittable(payment)?;

            let application = load_application_mut(tables, application_id)?;
            state_machine::transition(application, ApplicationStatus::Submitted, now)?;
            Ok(application.status)
        })
    }

    /// Explicit approval. The guard is re-checked inside the same transaction as the write.
    pub fn approve_application(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
        remarks: Option<String>,
    ) -> Result<Application, ReviewError> {
        let now = self.now();
        self.atomically(|tables, outbox| {
            let user = authorization::resolve(tables, principal)?;
            let application = load_application(tables, application_id)?;
            authorization::authorize(&user, Action::Review, Resource::Application(application))?;
            if !matches!(
                application.status,
                ApplicationStatus::UnderReview | ApplicationStatus::ForOrientation
            ) {
                return Err(ReviewError::conflict(format!(
                    "application is {}; only applications under review or awaiting orientation can be approved",
                    application.status
                )));
            }

            let blockers = state_machine::gather_facts(tables, &self.catalog, application)
                .approval_blockers();
            if !blockers.is_empty() {
                warn!(
                    application_id = %application_id,
                    blockers = blockers.len(),
                    actor = %user.id,
                    "approval refused by guard"
                );
                return Err(ReviewError::conflict(describe_blockers(&blockers)));
            }

            let application = load_application_mut(tables, application_id)?;
            if remarks.is_some() {
                application.admin_remarks = remarks.clone();
            }
            let change = state_machine::transition(application, ApplicationStatus::Approved, now)?;
            if let Some(change) = change {
                self.after_transition(tables, outbox, change, remarks)?;
            }
            Ok(load_application(tables, application_id)?.clone())
        })
    }

    /// Administrative override ending the application regardless of item outcomes.
    pub fn reject_application(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
        remarks: &str,
    ) -> Result<Application, ReviewError> {
        if remarks.trim().is_empty() {
            return Err(ReviewError::validation("a final rejection requires remarks"));
        }
        let now = self.now();
        self.atomically(|tables, outbox| {
            let user = authorization::resolve(tables, principal)?;
            let application = load_application(tables, application_id)?;
            authorization::authorize(&user, Action::Review, Resource::Application(application))?;

            let application = load_application_mut(tables, application_id)?;
            application.admin_remarks = Some(remarks.trim().to_string());
            let change = state_machine::transition(application, ApplicationStatus::Rejected, now)?;
            if let Some(change) = change {
                info!(application_id = %application_id, actor = %user.id, "application rejected");
                self.after_transition(tables, outbox, change, Some(remarks.trim().to_string()))?;
            }
            Ok(load_application(tables, application_id)?.clone())
        })
    }

    /// Read-only join of application, checklist, uploads, and payment.
    pub fn get_application_with_documents(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
    ) -> Result<ApplicationDetail, ReviewError> {
        self.snapshot(|tables| {
            let user = authorization::resolve(tables, principal)?;
            let application = load_application(tables, application_id)?;
            authorization::authorize(
                &user,
                Action::View,
                authorization::viewed(tables, application),
            )?;

            let checklist = self
                .catalog
                .requirements_for(&application.job_category_id)
                .into_iter()
                .map(|requirement| {
                    let type_id = requirement.document_type.id;
                    let history: Vec<&DocumentRejectionRecord> = tables
                        .document_rejections
                        .iter()
                        .filter(|record| {
                            record.application_id == application.id
                                && record.document_type_id == type_id
                        })
                        .collect();
                    ChecklistItem {
                        upload: tables.upload_for(&application.id, &type_id).cloned(),
                        rejection_count: history.len() as u32,
                        latest_rejection: history
                            .into_iter()
                            .max_by_key(|record| record.attempt_number)
                            .cloned(),
                        document_type: requirement.document_type,
                        is_required: requirement.is_required,
                    }
                })
                .collect();

            let facts = state_machine::gather_facts(tables, &self.catalog, application);
            Ok(ApplicationDetail {
                application: application.clone(),
                job_category: self
                    .catalog
                    .job_category(&application.job_category_id)
                    .cloned(),
                checklist,
                payment: tables
                    .active_payment(&application.id)
                    .or_else(|| tables.latest_payment(&application.id))
                    .cloned(),
                approval_blockers: facts.approval_blockers(),
                health_card: tables.health_cards.get(&application.id).cloned(),
            })
        })
    }

    /// Applications owned by the caller, or visible to the calling reviewer.
    pub fn list_applications(&self, principal: &Principal) -> Result<Vec<Application>, ReviewError> {
        self.snapshot(|tables| {
            let user = authorization::resolve(tables, principal)?;
            let mut visible: Vec<Application> = tables
                .applications
                .values()
                .filter(|application| {
                    authorization::authorize(
                        &user,
                        Action::View,
                        authorization::viewed(tables, application),
                    )
                    .is_ok()
                })
                .cloned()
                .collect();
            visible.sort_by_key(|application| application.created_at);
            Ok(visible)
        })
    }

    /// Pending uploads across every application the reviewer may act on.
    pub fn pending_document_queue(
        &self,
        principal: &Principal,
    ) -> Result<Vec<QueueEntry>, ReviewError> {
        self.snapshot(|tables| {
            let user = authorization::resolve(tables, principal)?;
            authorization::authorize(&user, Action::Review, Resource::System)?;

            let mut queue: Vec<QueueEntry> = tables
                .uploads
                .values()
                .filter(|upload| upload.review_status == ReviewStatus::Pending)
                .filter_map(|upload| {
                    let application = tables.application(&upload.application_id)?;
                    if !application.status.is_in_review() {
                        return None;
                    }
                    authorization::authorize(
                        &user,
                        Action::Review,
                        Resource::Application(application),
                    )
                    .ok()?;
                    Some(QueueEntry {
                        application_id: application.id,
                        applicant_name: application.form.full_name(),
                        application_status: application.status,
                        document_type: self.catalog.document_type(&upload.document_type_id).cloned(),
                        upload: upload.clone(),
                    })
                })
                .collect();
            queue.sort_by_key(|entry| entry.upload.uploaded_at);
            Ok(queue)
        })
    }

    /// Applicants get their inbox; reviewers get the feed derived from the audit trails.
    pub fn get_notifications(
        &self,
        principal: &Principal,
    ) -> Result<Vec<NotificationView>, ReviewError> {
        self.snapshot(|tables| {
            let user = authorization::resolve(tables, principal)?;
            let mut items = notifications::inbox(tables, &user.id);
            if user.role.is_reviewer() {
                items.extend(notifications::admin_feed(tables, &self.catalog, &user));
                items.sort_by(|a, b| b.notification.created_at.cmp(&a.notification.created_at));
            }
            Ok(items)
        })
    }

    pub fn mark_notification_read(
        &self,
        principal: &Principal,
        notification_id: &NotificationId,
    ) -> Result<Notification, ReviewError> {
        self.atomically(|tables, _| {
            let user = authorization::resolve(tables, principal)?;
            let notification = tables
                .notifications
                .get_mut(notification_id)
                .filter(|notification| notification.recipient_id == user.id)
                .ok_or_else(|| ReviewError::not_found("notification", notification_id))?;
            notification.is_read = true;
            Ok(notification.clone())
        })
    }

    /// Remove the caller's read notifications; returns how many were cleared.
    pub fn clear_read_notifications(&self, principal: &Principal) -> Result<usize, ReviewError> {
        self.atomically(|tables, _| {
            let user = authorization::resolve(tables, principal)?;
            let before = tables.notifications.len();
            tables
                .notifications
                .retain(|_, notification| {
                    !(notification.recipient_id == user.id && notification.is_read)
                });
            Ok(before - tables.notifications.len())
        })
    }

    /// Mark an admin feed item as seen by the caller.
    pub fn acknowledge_feed_item(
        &self,
        principal: &Principal,
        reference: AuditRef,
    ) -> Result<(), ReviewError> {
        self.atomically(|tables, _| {
            let user = authorization::resolve(tables, principal)?;
            authorization::authorize(&user, Action::Review, Resource::System)?;

            let application_id = match reference {
                AuditRef::Document(id) => tables
                    .document_rejections
                    .iter()
                    .find(|record| record.id == id)
                    .map(|record| record.application_id),
                AuditRef::Payment(id) => tables
                    .payment_rejections
                    .iter()
                    .find(|record| record.id == id)
                    .map(|record| record.application_id),
            }
            .ok_or_else(|| ReviewError::not_found("audit record", format!("{reference:?}")))?;
            let application = load_application(tables, &application_id)?;
            authorization::authorize(&user, Action::Review, Resource::Application(application))?;

            match reference {
                AuditRef::Document(id) => {
                    if let Some(record) = tables
                        .document_rejections
                        .iter_mut()
                        .find(|record| record.id == id)
                    {
                        record.admin_read_by.insert(user.id);
                    }
                }
                AuditRef::Payment(id) => {
                    if let Some(record) = tables
                        .payment_rejections
                        .iter_mut()
                        .find(|record| record.id == id)
                    {
                        record.admin_read_by.insert(user.id);
                    }
                }
            }
            Ok(())
        })
    }
}

/// One checklist line joined with the ledger and audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChecklistItem {
    pub document_type: DocumentType,
    pub is_required: bool,
    pub upload: Option<DocumentUpload>,
    pub rejection_count: u32,
    pub latest_rejection: Option<DocumentRejectionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationDetail {
    pub application: Application,
    pub job_category: Option<JobCategory>,
    pub checklist: Vec<ChecklistItem>,
    pub payment: Option<Payment>,
    pub approval_blockers: Vec<ApprovalBlocker>,
    pub health_card: Option<HealthCard>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub application_id: ApplicationId,
    pub applicant_name: String,
    pub application_status: ApplicationStatus,
    pub document_type: Option<DocumentType>,
    pub upload: DocumentUpload,
}

pub(crate) fn load_application<'t>(
    tables: &'t ReviewTables,
    id: &ApplicationId,
) -> Result<&'t Application, ReviewError> {
    tables
        .applications
        .get(id)
        .ok_or_else(|| ReviewError::not_found("application", id))
}

pub(crate) fn load_application_mut<'t>(
    tables: &'t mut ReviewTables,
    id: &ApplicationId,
) -> Result<&'t mut Application, ReviewError> {
    tables
        .applications
        .get_mut(id)
        .ok_or_else(|| ReviewError::not_found("application", id))
}

/// Terminal applications accept reads only.
pub(crate) fn ensure_mutable(application: &Application) -> Result<(), ReviewError> {
    if application.status.is_terminal() {
        Err(ReviewError::conflict(format!(
            "application is {} and can no longer change",
            application.status
        )))
    } else {
        Ok(())
    }
}

fn ensure_submittable(payment: &Payment) -> Result<(), ReviewError> {
    match payment.status {
        PaymentStatus::Complete => Ok(()),
        PaymentStatus::Pending if payment.method == PaymentMethod::OnlineGateway => Err(
            ReviewError::conflict("payment is awaiting gateway confirmation"),
        ),
        PaymentStatus::Pending => Ok(()),
        other => Err(ReviewError::conflict(format!(
            "payment is {} and cannot be submitted",
            other.label()
        ))),
    }
}

fn describe_blockers(blockers: &[ApprovalBlocker]) -> String {
    let reasons: Vec<String> = blockers
        .iter()
        .map(|blocker| match blocker {
            ApprovalBlocker::MissingDocument { document_type_id } => {
                format!("missing document {document_type_id}")
            }
            ApprovalBlocker::DocumentNotApproved { document_type_id } => {
                format!("document {document_type_id} not approved")
            }
            ApprovalBlocker::PaymentNotComplete => "payment not complete".to_string(),
            ApprovalBlocker::OrientationIncomplete => "orientation not completed".to_string(),
        })
        .collect();
    format!("approval blocked: {}", reasons.join(", "))
}

/// Required demographic fields and basic sanity checks.
pub fn validate_form(form: &ApplicationForm, now: DateTime<Utc>) -> Result<(), ReviewError> {
    let required = [
        ("first_name", form.first_name.as_str()),
        ("last_name", form.last_name.as_str()),
        ("address", form.address.as_str()),
        ("contact_number", form.contact_number.as_str()),
    ];
    let missing: Vec<&str> = required
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| *field)
        .collect();
    if !missing.is_empty() {
        return Err(ReviewError::validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    let contact = form.contact_number.trim();
    let digits = contact.strip_prefix('+').unwrap_or(contact);
    if !(7..=15).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ReviewError::validation(
            "contact_number must be 7 to 15 digits",
        ));
    }

    if form.birth_date >= now.date_naive() {
        return Err(ReviewError::validation("birth_date must be in the past"));
    }

    Ok(())
}
