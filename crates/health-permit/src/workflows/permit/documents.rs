//! Document ledger operations and the document rejection trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::audit::{self, DocumentRejectionRecord, RejectionDetail, AUDIT_SCHEMA_VERSION};
use super::authorization::{self, Action, Principal, Resource};
use super::domain::{
    ApplicationId, ApplicationStatus, ClassificationHint, DocumentTypeId, DocumentUpload, FileRef,
    RejectionId, ReviewStatus, UploadId, User,
};
use super::errors::ReviewError;
use super::external::BlobError;
use super::notifications::ReviewEvent;
use super::repository::{RepositoryError, ReviewStore, ReviewTables};
use super::service::{ensure_mutable, load_application, Outbox, PermitReviewService};
use super::state_machine;

/// Reviewer verdict on a single upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject(RejectionDetail),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentReviewOutcome {
    pub upload: DocumentUpload,
    pub rejection: Option<DocumentRejectionRecord>,
    pub application_status: ApplicationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResubmissionOutcome {
    pub upload: DocumentUpload,
    pub replaced_rejection: DocumentRejectionRecord,
    pub application_status: ApplicationStatus,
}

fn load_upload<'t>(tables: &'t ReviewTables, id: &UploadId) -> Result<&'t DocumentUpload, ReviewError> {
    tables
        .uploads
        .get(id)
        .ok_or_else(|| ReviewError::not_found("document upload", id))
}

fn load_upload_mut<'t>(
    tables: &'t mut ReviewTables,
    id: &UploadId,
) -> Result<&'t mut DocumentUpload, ReviewError> {
    tables
        .uploads
        .get_mut(id)
        .ok_or_else(|| ReviewError::not_found("document upload", id))
}

fn ensure_file_ref(file_ref: &FileRef) -> Result<(), ReviewError> {
    if file_ref.is_blank() {
        Err(ReviewError::validation("file reference is required"))
    } else {
        Ok(())
    }
}

pub(crate) fn blob_failure(err: BlobError, file_ref: &FileRef) -> ReviewError {
    match err {
        BlobError::Missing(_) => ReviewError::not_found("file", file_ref),
        BlobError::Unavailable(reason) => {
            ReviewError::Storage(RepositoryError::Unavailable(reason))
        }
    }
}

impl<S> PermitReviewService<S>
where
    S: ReviewStore + 'static,
{
    /// Create the (application, type) ledger row or replace the file on an existing one.
    /// A rejected row is routed through resubmission so its audit record is closed.
    pub fn upload_document(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
        document_type_id: &DocumentTypeId,
        file_ref: FileRef,
    ) -> Result<DocumentUpload, ReviewError> {
        ensure_file_ref(&file_ref)?;
        if self.catalog.document_type(document_type_id).is_none() {
            return Err(ReviewError::not_found("document type", document_type_id));
        }
        let now = self.now();

        self.atomically(|tables, outbox| {
            let user = authorization::resolve(tables, principal)?;
            let application = load_application(tables, application_id)?;
            authorization::authorize(
                &user,
                Action::ManageOwnApplication,
                Resource::Application(application),
            )?;
            ensure_mutable(application)?;
            if self
                .catalog
                .requirement(&application.job_category_id, document_type_id)
                .is_none()
            {
                return Err(ReviewError::validation(format!(
                    "document type {document_type_id} is not on the checklist for this job category"
                )));
            }

            let existing = tables
                .upload_for(application_id, document_type_id)
                .map(|upload| (upload.id, upload.review_status));
            match existing {
                Some((_, ReviewStatus::Approved)) => Err(ReviewError::conflict(
                    "document is already approved; an admin override is required to replace it",
                )),
                Some((upload_id, ReviewStatus::Rejected)) => self
                    .resubmit_within(tables, outbox, &user, &upload_id, file_ref, now)
                    .map(|outcome| outcome.upload),
                Some((upload_id, ReviewStatus::Pending)) => {
                    let upload = load_upload_mut(tables, &upload_id)?;
                    upload.replace_file(file_ref, now);
                    Ok(upload.clone())
                }
                None => {
                    let upload = DocumentUpload {
                        id: UploadId::new(),
                        application_id: *application_id,
                        document_type_id: *document_type_id,
                        file_ref,
                        review_status: ReviewStatus::Pending,
                        reviewed_by: None,
                        reviewed_at: None,
                        admin_remarks: None,
                        uploaded_at: now,
                        classification: None,
                    };
                    tables.uploads.insert(upload.id, upload.clone());
                    info!(
                        application_id = %application_id,
                        upload_id = %upload.id,
                        "document uploaded"
                    );
                    // A fresh upload after deleting a rejected one counts as its resubmission.
                    if self
                        .close_open_rejection(tables, outbox, &user, &upload, now)?
                        .is_some()
                    {
                        self.settle(tables, outbox, application_id, now)?;
                    }
                    Ok(upload)
                }
            }
        })
    }

    /// Approve or reject an upload and re-evaluate the parent application.
    pub fn review_document(
        &self,
        principal: &Principal,
        upload_id: &UploadId,
        decision: ReviewDecision,
        remarks: Option<String>,
    ) -> Result<DocumentReviewOutcome, ReviewError> {
        if let ReviewDecision::Reject(detail) = &decision {
            if detail.reason.trim().is_empty() {
                return Err(ReviewError::validation("a rejection requires a reason"));
            }
        }
        let now = self.now();

        self.atomically(|tables, outbox| {
            let user = authorization::resolve(tables, principal)?;
            let upload = load_upload(tables, upload_id)?.clone();
            let application = load_application(tables, &upload.application_id)?;
            authorization::authorize(&user, Action::Review, Resource::Application(application))?;
            if !application.status.is_in_review() {
                return Err(ReviewError::conflict(format!(
                    "application is {}; documents are not open for review",
                    application.status
                )));
            }
            if upload.review_status != ReviewStatus::Pending {
                return Err(ReviewError::conflict(format!(
                    "upload is already {}",
                    upload.review_status.label()
                )));
            }
            let applicant_id = application.owner_id;
            self.begin_review(tables, outbox, &upload.application_id, now)?;

            let rejection = match decision {
                ReviewDecision::Approve => {
                    let row = load_upload_mut(tables, upload_id)?;
                    row.review_status = ReviewStatus::Approved;
                    row.reviewed_by = Some(user.id);
                    row.reviewed_at = Some(now);
                    row.admin_remarks = remarks;
                    None
                }
                ReviewDecision::Reject(detail) => {
                    let attempt_number = audit::next_document_attempt(
                        &tables.document_rejections,
                        &upload.application_id,
                        &upload.document_type_id,
                    );
                    let row = load_upload_mut(tables, upload_id)?;
                    row.review_status = ReviewStatus::Rejected;
                    row.reviewed_by = Some(user.id);
                    row.reviewed_at = Some(now);
                    row.admin_remarks = remarks.or_else(|| Some(detail.reason.clone()));

                    let record = DocumentRejectionRecord {
                        id: RejectionId::new(),
                        schema_version: AUDIT_SCHEMA_VERSION,
                        application_id: upload.application_id,
                        document_type_id: upload.document_type_id,
                        upload_id: upload.id,
                        rejected_file_ref: upload.file_ref.clone(),
                        category: detail.category,
                        reason: detail.reason,
                        issues: detail.issues,
                        rejected_by: user.id,
                        rejected_at: now,
                        was_replaced: false,
                        replaced_at: None,
                        attempt_number,
                        admin_read_by: Default::default(),
                    };
                    tables.document_rejections.push(record.clone());
                    info!(
                        application_id = %upload.application_id,
                        upload_id = %upload.id,
                        attempt_number,
                        actor = %user.id,
                        "document rejected"
                    );
                    self.emit(
                        tables,
                        outbox,
                        &ReviewEvent::DocumentRejected {
                            application_id: upload.application_id,
                            applicant_id,
                            document_name: self.document_name(&upload.document_type_id),
                            reason: record.reason.clone(),
                            attempt_number,
                        },
                        now,
                    );
                    Some(record)
                }
            };

            self.settle(tables, outbox, &upload.application_id, now)?;
            Ok(DocumentReviewOutcome {
                upload: load_upload(tables, upload_id)?.clone(),
                rejection,
                application_status: load_application(tables, &upload.application_id)?.status,
            })
        })
    }

    /// Replace a rejected upload's file and close its latest rejection record atomically.
    pub fn resubmit_document(
        &self,
        principal: &Principal,
        upload_id: &UploadId,
        file_ref: FileRef,
    ) -> Result<ResubmissionOutcome, ReviewError> {
        ensure_file_ref(&file_ref)?;
        let now = self.now();

        self.atomically(|tables, outbox| {
            let user = authorization::resolve(tables, principal)?;
            let upload = load_upload(tables, upload_id)?;
            let application = load_application(tables, &upload.application_id)?;
            authorization::authorize(
                &user,
                Action::ManageOwnApplication,
                Resource::Application(application),
            )?;
            self.resubmit_within(tables, outbox, &user, upload_id, file_ref, now)
        })
    }

    fn resubmit_within(
        &self,
        tables: &mut ReviewTables,
        outbox: &mut Outbox,
        user: &User,
        upload_id: &UploadId,
        file_ref: FileRef,
        now: DateTime<Utc>,
    ) -> Result<ResubmissionOutcome, ReviewError> {
        let upload = load_upload(tables, upload_id)?.clone();
        let application = load_application(tables, &upload.application_id)?;
        ensure_mutable(application)?;
        if upload.review_status != ReviewStatus::Rejected {
            return Err(ReviewError::conflict(format!(
                "upload is {}; only rejected documents can be resubmitted",
                upload.review_status.label()
            )));
        }
        if upload.file_ref == file_ref {
            return Err(ReviewError::validation(
                "resubmission must reference a new file",
            ));
        }

        let row = load_upload_mut(tables, upload_id)?;
        row.replace_file(file_ref, now);
        let upload = row.clone();

        let replaced_rejection = self
            .close_open_rejection(tables, outbox, user, &upload, now)?
            .ok_or_else(|| ReviewError::conflict("no open rejection exists for this document"))?;
        self.settle(tables, outbox, &upload.application_id, now)?;

        Ok(ResubmissionOutcome {
            application_status: load_application(tables, &upload.application_id)?.status,
            upload,
            replaced_rejection,
        })
    }

    /// Remove a pending or rejected upload. The ledger row goes first; the blob is deleted
    /// after commit. A rejected upload keeps its open rejection record until the next upload
    /// for the same document type closes it.
    pub fn delete_document(
        &self,
        principal: &Principal,
        upload_id: &UploadId,
    ) -> Result<(), ReviewError> {
        let now = self.now();
        let removed = self.atomically(|tables, outbox| {
            let user = authorization::resolve(tables, principal)?;
            let upload = load_upload(tables, upload_id)?;
            let application = load_application(tables, &upload.application_id)?;
            authorization::authorize(
                &user,
                Action::ManageOwnApplication,
                Resource::Application(application),
            )?;
            ensure_mutable(application)?;
            if upload.review_status == ReviewStatus::Approved {
                return Err(ReviewError::conflict(
                    "approved documents cannot be deleted without an admin override",
                ));
            }

            let removed = tables
                .uploads
                .remove(upload_id)
                .ok_or_else(|| ReviewError::not_found("document upload", upload_id))?;
            self.settle(tables, outbox, &removed.application_id, now)?;
            Ok(removed)
        })?;

        if let Err(err) = self.blobs.delete(&removed.file_ref) {
            warn!(
                upload_id = %removed.id,
                file_ref = %removed.file_ref,
                error = %err,
                "blob delete failed after ledger removal"
            );
        }
        Ok(())
    }

    /// Mark the latest open rejection for the upload's slot as replaced by `upload` and
    /// announce the resubmission. Acknowledgements of the rejected stage are dropped so the
    /// resubmission reaches every admin feed.
    fn close_open_rejection(
        &self,
        tables: &mut ReviewTables,
        outbox: &mut Outbox,
        user: &User,
        upload: &DocumentUpload,
        now: DateTime<Utc>,
    ) -> Result<Option<DocumentRejectionRecord>, ReviewError> {
        let application = load_application(tables, &upload.application_id)?;
        let job_category_id = application.job_category_id;
        let applicant_name = application.form.full_name();

        let Some(record) = audit::latest_unreplaced_document(
            &mut tables.document_rejections,
            &upload.application_id,
            &upload.document_type_id,
        ) else {
            return Ok(None);
        };
        record.was_replaced = true;
        record.replaced_at = Some(now);
        record.admin_read_by.clear();
        let replaced_rejection = record.clone();

        info!(
            application_id = %upload.application_id,
            upload_id = %upload.id,
            attempt_number = replaced_rejection.attempt_number,
            actor = %user.id,
            "document resubmitted"
        );
        self.emit(
            tables,
            outbox,
            &ReviewEvent::DocumentResubmitted {
                application_id: upload.application_id,
                job_category_id,
                applicant_name,
                document_name: self.document_name(&upload.document_type_id),
                attempt_number: replaced_rejection.attempt_number,
            },
            now,
        );
        Ok(Some(replaced_rejection))
    }

    /// Attach OCR output to an upload. Results for a file that has since been replaced are
    /// refused; review status is never touched.
    pub fn record_classification(
        &self,
        upload_id: &UploadId,
        file_ref: &FileRef,
        hint: ClassificationHint,
    ) -> Result<DocumentUpload, ReviewError> {
        if !(0.0..=1.0).contains(&hint.confidence) {
            return Err(ReviewError::validation("confidence must be between 0 and 1"));
        }
        self.atomically(|tables, _| {
            let upload = load_upload_mut(tables, upload_id)?;
            if &upload.file_ref != file_ref {
                return Err(ReviewError::conflict(
                    "classification result is for a file that has been replaced",
                ));
            }
            upload.classification = Some(hint);
            Ok(upload.clone())
        })
    }

    /// Short-lived URL for viewing an uploaded file.
    pub fn document_url(
        &self,
        principal: &Principal,
        upload_id: &UploadId,
    ) -> Result<String, ReviewError> {
        let file_ref = self.snapshot(|tables| {
            let user = authorization::resolve(tables, principal)?;
            let upload = load_upload(tables, upload_id)?;
            let application = load_application(tables, &upload.application_id)?;
            authorization::authorize(
                &user,
                Action::View,
                authorization::viewed(tables, application),
            )?;
            Ok(upload.file_ref.clone())
        })?;
        self.blobs
            .signed_url(&file_ref)
            .map_err(|err| blob_failure(err, &file_ref))
    }

    /// Rejection trail for an application, optionally narrowed to one document type.
    pub fn document_history(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
        document_type_id: Option<&DocumentTypeId>,
    ) -> Result<Vec<DocumentRejectionRecord>, ReviewError> {
        self.snapshot(|tables| {
            let user = authorization::resolve(tables, principal)?;
            let application = load_application(tables, application_id)?;
            authorization::authorize(
                &user,
                Action::View,
                authorization::viewed(tables, application),
            )?;

            let mut history: Vec<DocumentRejectionRecord> = tables
                .document_rejections
                .iter()
                .filter(|record| &record.application_id == application_id)
                .filter(|record| {
                    document_type_id.map_or(true, |wanted| &record.document_type_id == wanted)
                })
                .cloned()
                .collect();
            history.sort_by_key(|record| (record.document_type_id, record.attempt_number));
            Ok(history)
        })
    }

    /// CSV of every document rejection within the caller's managed categories.
    pub fn export_document_audit_csv(&self, principal: &Principal) -> Result<String, ReviewError> {
        let records = self.snapshot(|tables| {
            let user = authorization::resolve(tables, principal)?;
            authorization::authorize(&user, Action::Review, Resource::System)?;

            let mut records: Vec<DocumentRejectionRecord> = tables
                .document_rejections
                .iter()
                .filter(|record| {
                    tables.application(&record.application_id).is_some_and(|application| {
                        authorization::authorize(
                            &user,
                            Action::Review,
                            Resource::Application(application),
                        )
                        .is_ok()
                    })
                })
                .cloned()
                .collect();
            records.sort_by_key(|record| record.rejected_at);
            Ok(records)
        })?;
        audit::document_trail_csv(&records)
            .map_err(|err| ReviewError::Storage(RepositoryError::from(err)))
    }

    /// `Submitted -> Under Review` on the first reviewer touch.
    pub(crate) fn begin_review(
        &self,
        tables: &mut ReviewTables,
        outbox: &mut Outbox,
        application_id: &ApplicationId,
        now: DateTime<Utc>,
    ) -> Result<(), ReviewError> {
        let application = tables
            .applications
            .get_mut(application_id)
            .ok_or_else(|| ReviewError::not_found("application", application_id))?;
        if let Some(change) = state_machine::start_review(application, now)? {
            self.after_transition(tables, outbox, change, None)?;
        }
        Ok(())
    }

    pub(crate) fn document_name(&self, id: &DocumentTypeId) -> String {
        self.catalog
            .document_type(id)
            .map(|document_type| document_type.name.clone())
            .unwrap_or_else(|| "document".to_string())
    }
}
