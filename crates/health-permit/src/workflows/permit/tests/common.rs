use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::response::Response;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use crate::workflows::permit::audit::{RejectionCategory, RejectionDetail};
use crate::workflows::permit::documents::ReviewDecision;
use crate::workflows::permit::domain::{
    ApplicationForm, ApplicationId, ApplicationStatus, DocumentType, DocumentTypeId, FileRef,
    JobCategory, JobCategoryDocument, JobCategoryId, ManagedCategories, Notification,
    NotificationKind, PaymentId, PaymentMethod, Role, Sex, UploadId, User, UserId,
};
use crate::workflows::permit::external::{
    BlobError, BlobStore, ManualClock, NotificationPublisher, PublishError,
};
use crate::workflows::permit::payments::PaymentRequest;
use crate::workflows::permit::repository::{
    InMemoryReviewStore, RepositoryError, ReviewStore, ReviewTables,
};
use crate::workflows::permit::{Principal, PermitReviewService, RequirementCatalog};

pub(super) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0)
        .single()
        .expect("valid start")
}

/// Stable ids for the reference data used across the suite.
#[derive(Debug, Clone, Copy)]
pub(super) struct Ids {
    /// Food handlers: ID and chest X-ray required, orientation required.
    pub(super) food: JobCategoryId,
    /// Office staff: same documents, no orientation.
    pub(super) office: JobCategoryId,
    /// Category no admin lists explicitly.
    pub(super) unlisted: JobCategoryId,
    pub(super) id_card: DocumentTypeId,
    pub(super) xray: DocumentTypeId,
    pub(super) cedula: DocumentTypeId,
    pub(super) stool_exam: DocumentTypeId,
}

impl Ids {
    fn new() -> Self {
        Self {
            food: JobCategoryId::new(),
            office: JobCategoryId::new(),
            unlisted: JobCategoryId::new(),
            id_card: DocumentTypeId::new(),
            xray: DocumentTypeId::new(),
            cedula: DocumentTypeId::new(),
            stool_exam: DocumentTypeId::new(),
        }
    }
}

pub(super) fn document_type(id: DocumentTypeId, name: &str, field: &str) -> DocumentType {
    DocumentType {
        id,
        name: name.to_string(),
        field_name: field.to_string(),
        required_by_default: true,
    }
}

pub(super) fn row(category: JobCategoryId, document: DocumentTypeId, required: bool) -> JobCategoryDocument {
    JobCategoryDocument {
        job_category_id: category,
        document_type_id: document,
        is_required: required,
    }
}

pub(super) fn standard_catalog(ids: &Ids) -> RequirementCatalog {
    RequirementCatalog::new(
        [
            document_type(ids.id_card, "Valid ID", "valid_id"),
            document_type(ids.xray, "Chest X-Ray", "chest_xray"),
            document_type(ids.cedula, "Community Tax Certificate", "cedula"),
            document_type(ids.stool_exam, "Stool Examination", "stool_exam"),
        ],
        [
            JobCategory {
                id: ids.food,
                name: "Food Handler".to_string(),
                require_orientation: true,
            },
            JobCategory {
                id: ids.office,
                name: "Non-Food".to_string(),
                require_orientation: false,
            },
            JobCategory {
                id: ids.unlisted,
                name: "Skin Contact".to_string(),
                require_orientation: false,
            },
        ],
        [
            row(ids.food, ids.id_card, true),
            row(ids.food, ids.xray, true),
            row(ids.food, ids.cedula, false),
            row(ids.office, ids.id_card, true),
            row(ids.office, ids.xray, true),
            row(ids.unlisted, ids.id_card, true),
        ],
    )
}

pub(super) fn form() -> ApplicationForm {
    ApplicationForm {
        first_name: "Maria".to_string(),
        middle_name: Some("Luna".to_string()),
        last_name: "Dela Cruz".to_string(),
        birth_date: NaiveDate::from_ymd_opt(1994, 6, 15).expect("valid"),
        sex: Sex::Female,
        address: "88 Bonifacio St, Barangay 4".to_string(),
        contact_number: "09171234567".to_string(),
        nationality: Some("Filipino".to_string()),
        establishment: Some("Kusina ni Maria".to_string()),
    }
}

pub(super) fn counter_payment() -> PaymentRequest {
    PaymentRequest {
        method: PaymentMethod::OverTheCounter,
        amount: 30_000,
        service_fee: 2_000,
        net_amount: 32_000,
        reference_number: Some("OR-1001".to_string()),
        receipt_ref: Some(FileRef::new("receipts/or-1001.jpg")),
        checkout_session_id: None,
    }
}

pub(super) fn gateway_payment(session: &str) -> PaymentRequest {
    PaymentRequest {
        method: PaymentMethod::OnlineGateway,
        amount: 30_000,
        service_fee: 1_500,
        net_amount: 31_500,
        reference_number: None,
        receipt_ref: None,
        checkout_session_id: Some(session.to_string()),
    }
}

pub(super) fn reject(reason: &str) -> ReviewDecision {
    ReviewDecision::Reject(RejectionDetail::new(RejectionCategory::Illegible, reason))
}

#[derive(Default)]
pub(super) struct MemoryPublisher {
    published: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub(super) fn published(&self) -> Vec<Notification> {
        self.published.lock().expect("publisher mutex poisoned").clone()
    }

    pub(super) fn count(&self, kind: NotificationKind) -> usize {
        self.published()
            .iter()
            .filter(|notification| notification.kind == kind)
            .count()
    }

    pub(super) fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl NotificationPublisher for MemoryPublisher {
    fn publish(&self, notification: &Notification) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Transport("push gateway offline".to_string()));
        }
        self.published
            .lock()
            .expect("publisher mutex poisoned")
            .push(notification.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(super) struct MemoryBlobs {
    deleted: Mutex<Vec<FileRef>>,
    failing: AtomicBool,
}

impl MemoryBlobs {
    pub(super) fn deleted(&self) -> Vec<FileRef> {
        self.deleted.lock().expect("blob mutex poisoned").clone()
    }

    pub(super) fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl BlobStore for MemoryBlobs {
    fn delete(&self, file_ref: &FileRef) -> Result<(), BlobError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("bucket offline".to_string()));
        }
        self.deleted
            .lock()
            .expect("blob mutex poisoned")
            .push(file_ref.clone());
        Ok(())
    }

    fn signed_url(&self, file_ref: &FileRef) -> Result<String, BlobError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("bucket offline".to_string()));
        }
        Ok(format!("https://blobs.test/{file_ref}?sig=abc"))
    }
}

/// Store that refuses every operation.
pub(super) struct UnavailableStore;

impl ReviewStore for UnavailableStore {
    fn transaction<T, E, F>(&self, _work: F) -> Result<T, E>
    where
        F: FnOnce(&mut ReviewTables) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        Err(E::from(RepositoryError::Unavailable("database offline".to_string())))
    }

    fn read<T, F>(&self, _view: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&ReviewTables) -> T,
    {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

fn user(role: Role, name: &str, scope: Option<ManagedCategories>) -> User {
    User {
        id: UserId::new(),
        display_name: name.to_string(),
        role,
        managed_categories: scope,
    }
}

pub(super) struct Fixture {
    pub(super) service: Arc<PermitReviewService<InMemoryReviewStore>>,
    pub(super) store: Arc<InMemoryReviewStore>,
    pub(super) clock: Arc<ManualClock>,
    pub(super) publisher: Arc<MemoryPublisher>,
    pub(super) blobs: Arc<MemoryBlobs>,
    pub(super) ids: Ids,
    pub(super) applicant: Principal,
    pub(super) other_applicant: Principal,
    pub(super) food_admin: Principal,
    pub(super) office_admin: Principal,
    pub(super) super_admin: Principal,
    pub(super) system_admin: Principal,
    pub(super) inspector: Principal,
    pub(super) other_inspector: Principal,
}

impl Fixture {
    pub(super) fn new() -> Self {
        let ids = Ids::new();
        let catalog = standard_catalog(&ids);
        Self::build(ids, catalog)
    }

    pub(super) fn with_catalog(catalog: RequirementCatalog) -> Self {
        Self::build(Ids::new(), catalog)
    }

    fn build(ids: Ids, catalog: RequirementCatalog) -> Self {
        let users = [
            user(Role::Applicant, "Maria Dela Cruz", None),
            user(Role::Applicant, "Jose Rizal", None),
            user(
                Role::Admin,
                "Food Desk",
                Some(ManagedCategories::Only(BTreeSet::from([ids.food]))),
            ),
            user(
                Role::Admin,
                "Office Desk",
                Some(ManagedCategories::Only(BTreeSet::from([ids.office]))),
            ),
            user(Role::Admin, "Chief Sanitary Officer", Some(ManagedCategories::All)),
            user(Role::SystemAdmin, "Root", None),
            user(Role::Inspector, "Inspector Reyes", None),
            user(Role::Inspector, "Inspector Santos", None),
        ];
        let principals: Vec<Principal> = users.iter().map(|user| Principal::new(user.id)).collect();

        let mut tables = ReviewTables::default();
        for user in users {
            tables.users.insert(user.id, user);
        }

        let store = Arc::new(InMemoryReviewStore::new(tables));
        let clock = Arc::new(ManualClock::new(start()));
        let publisher = Arc::new(MemoryPublisher::default());
        let blobs = Arc::new(MemoryBlobs::default());
        let service = PermitReviewService::new(
            store.clone(),
            Arc::new(catalog),
            blobs.clone(),
            publisher.clone(),
        )
        .with_clock(clock.clone());

        Self {
            service: Arc::new(service),
            store,
            clock,
            publisher,
            blobs,
            ids,
            applicant: principals[0],
            other_applicant: principals[1],
            food_admin: principals[2],
            office_admin: principals[3],
            super_admin: principals[4],
            system_admin: principals[5],
            inspector: principals[6],
            other_inspector: principals[7],
        }
    }

    pub(super) fn tables(&self) -> ReviewTables {
        self.store
            .read(|tables| tables.clone())
            .expect("store readable")
    }

    pub(super) fn status(&self, application_id: &ApplicationId) -> ApplicationStatus {
        self.tables()
            .applications
            .get(application_id)
            .map(|application| application.status)
            .expect("application exists")
    }

    /// Draft application for the main applicant, moved to `Pending Payment`.
    pub(super) fn pending_payment(&self, category: JobCategoryId) -> ApplicationId {
        let application = self
            .service
            .create_application(&self.applicant, category, form())
            .expect("application created");
        self.service
            .complete_application_form(&self.applicant, &application.id)
            .expect("form completed");
        application.id
    }

    /// Application submitted with an over-the-counter payment awaiting verification.
    pub(super) fn submitted(&self, category: JobCategoryId) -> (ApplicationId, PaymentId) {
        let application_id = self.pending_payment(category);
        let payment = self
            .service
            .create_payment(&self.applicant, &application_id, counter_payment())
            .expect("payment recorded");
        self.service
            .submit_application(&self.applicant, &application_id, &payment.id)
            .expect("application submitted");
        (application_id, payment.id)
    }

    pub(super) fn upload(
        &self,
        application_id: &ApplicationId,
        document_type_id: &DocumentTypeId,
        file: &str,
    ) -> UploadId {
        self.service
            .upload_document(
                &self.applicant,
                application_id,
                document_type_id,
                FileRef::new(file),
            )
            .expect("upload accepted")
            .id
    }

    /// Submitted application with both required documents uploaded.
    pub(super) fn with_documents(
        &self,
        category: JobCategoryId,
    ) -> (ApplicationId, PaymentId, UploadId, UploadId) {
        let (application_id, payment_id) = self.submitted(category);
        let id_upload = self.upload(&application_id, &self.ids.id_card, "uploads/id-front.jpg");
        let xray_upload = self.upload(&application_id, &self.ids.xray, "uploads/xray.pdf");
        (application_id, payment_id, id_upload, xray_upload)
    }

    pub(super) fn approve_document(&self, admin: &Principal, upload_id: &UploadId) {
        self.service
            .review_document(admin, upload_id, ReviewDecision::Approve, None)
            .expect("document approved");
    }

    pub(super) fn approve_payment(&self, admin: &Principal, payment_id: &PaymentId) {
        self.service
            .review_payment(admin, payment_id, ReviewDecision::Approve, None)
            .expect("payment verified");
    }

    pub(super) fn inbox_kinds(&self, principal: &Principal) -> Vec<NotificationKind> {
        self.service
            .get_notifications(principal)
            .expect("notifications readable")
            .into_iter()
            .map(|view| view.notification.kind)
            .collect()
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
