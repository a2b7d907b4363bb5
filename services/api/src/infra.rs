use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{Duration, Utc};
use health_permit::workflows::permit::{
    BlobError, BlobStore, DocumentType, DocumentTypeId, FileRef, JobCategory, JobCategoryDocument,
    JobCategoryId, Notification, NotificationPublisher, PublishError, RequirementCatalog,
    ReviewTables, Role, User, UserId,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Push transport for deployments without a notification gateway: every delivery is logged.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LoggingPublisher;

impl NotificationPublisher for LoggingPublisher {
    fn publish(&self, notification: &Notification) -> Result<(), PublishError> {
        info!(
            notification_id = %notification.id,
            recipient_id = %notification.recipient_id,
            kind = ?notification.kind,
            title = %notification.title,
            "notification delivered"
        );
        Ok(())
    }
}

/// Blob adapter for files served from a static bucket URL.
#[derive(Debug, Clone)]
pub(crate) struct BucketBlobStore {
    base_url: String,
    link_ttl: Duration,
}

impl BucketBlobStore {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            link_ttl: Duration::minutes(15),
        }
    }
}

impl BlobStore for BucketBlobStore {
    fn delete(&self, file_ref: &FileRef) -> Result<(), BlobError> {
        if file_ref.is_blank() {
            return Err(BlobError::Missing(file_ref.to_string()));
        }
        info!(file_ref = %file_ref, "blob scheduled for deletion");
        Ok(())
    }

    fn signed_url(&self, file_ref: &FileRef) -> Result<String, BlobError> {
        if file_ref.is_blank() {
            return Err(BlobError::Missing(file_ref.to_string()));
        }
        let expires = (Utc::now() + self.link_ttl).timestamp();
        Ok(format!(
            "{}/{}?expires={expires}",
            self.base_url,
            file_ref.as_str().trim_start_matches('/')
        ))
    }
}

/// Reference data ids are fixed so persisted snapshots stay valid across restarts.
pub(crate) mod reference {
    use super::*;

    pub(crate) const FOOD_HANDLER: JobCategoryId =
        JobCategoryId(Uuid::from_u128(0x0c3a_51d2_6f4e_4b0a_9d1e_7a5c_0000_0001));
    pub(crate) const NON_FOOD: JobCategoryId =
        JobCategoryId(Uuid::from_u128(0x0c3a_51d2_6f4e_4b0a_9d1e_7a5c_0000_0002));
    pub(crate) const SKIN_CONTACT: JobCategoryId =
        JobCategoryId(Uuid::from_u128(0x0c3a_51d2_6f4e_4b0a_9d1e_7a5c_0000_0003));

    pub(crate) const VALID_ID: DocumentTypeId =
        DocumentTypeId(Uuid::from_u128(0x5e1b_7c90_2a3d_4f16_8b42_c3d1_0000_0101));
    pub(crate) const CHEST_XRAY: DocumentTypeId =
        DocumentTypeId(Uuid::from_u128(0x5e1b_7c90_2a3d_4f16_8b42_c3d1_0000_0102));
    pub(crate) const URINALYSIS: DocumentTypeId =
        DocumentTypeId(Uuid::from_u128(0x5e1b_7c90_2a3d_4f16_8b42_c3d1_0000_0103));
    pub(crate) const STOOL_EXAM: DocumentTypeId =
        DocumentTypeId(Uuid::from_u128(0x5e1b_7c90_2a3d_4f16_8b42_c3d1_0000_0104));
    pub(crate) const HEPATITIS_B: DocumentTypeId =
        DocumentTypeId(Uuid::from_u128(0x5e1b_7c90_2a3d_4f16_8b42_c3d1_0000_0105));
    pub(crate) const CEDULA: DocumentTypeId =
        DocumentTypeId(Uuid::from_u128(0x5e1b_7c90_2a3d_4f16_8b42_c3d1_0000_0106));
}

fn document_type(id: DocumentTypeId, name: &str, field_name: &str, required: bool) -> DocumentType {
    DocumentType {
        id,
        name: name.to_string(),
        field_name: field_name.to_string(),
        required_by_default: required,
    }
}

/// Job categories and their document checklists.
pub(crate) fn seed_catalog() -> RequirementCatalog {
    use reference::*;

    let categories = [
        (FOOD_HANDLER, "Food Handler", true),
        (NON_FOOD, "Non-Food", false),
        (SKIN_CONTACT, "Skin-to-Skin Contact", true),
    ];
    let checklist: [(JobCategoryId, &[(DocumentTypeId, bool)]); 3] = [
        (
            FOOD_HANDLER,
            &[
                (VALID_ID, true),
                (CHEST_XRAY, true),
                (URINALYSIS, true),
                (STOOL_EXAM, true),
                (CEDULA, false),
            ],
        ),
        (NON_FOOD, &[(VALID_ID, true), (CHEST_XRAY, true), (CEDULA, false)]),
        (
            SKIN_CONTACT,
            &[
                (VALID_ID, true),
                (CHEST_XRAY, true),
                (HEPATITIS_B, true),
                (CEDULA, false),
            ],
        ),
    ];

    RequirementCatalog::new(
        [
            document_type(VALID_ID, "Valid Government ID", "valid_id", true),
            document_type(CHEST_XRAY, "Chest X-Ray", "chest_xray", true),
            document_type(URINALYSIS, "Urinalysis", "urinalysis", true),
            document_type(STOOL_EXAM, "Stool Examination", "stool_exam", true),
            document_type(HEPATITIS_B, "Hepatitis B Screening", "hepatitis_b", true),
            document_type(CEDULA, "Community Tax Certificate", "cedula", false),
        ],
        categories.map(|(id, name, require_orientation)| JobCategory {
            id,
            name: name.to_string(),
            require_orientation,
        }),
        checklist.into_iter().flat_map(|(job_category_id, rows)| {
            rows.iter()
                .map(move |(document_type_id, is_required)| JobCategoryDocument {
                    job_category_id,
                    document_type_id: *document_type_id,
                    is_required: *is_required,
                })
        }),
    )
}

/// Make sure the configured bootstrap admin exists with the system admin role.
pub(crate) fn seed_bootstrap_admin(tables: &mut ReviewTables, admin_id: UserId) {
    let admin = tables.users.entry(admin_id).or_insert_with(|| User {
        id: admin_id,
        display_name: "Bootstrap Administrator".to_string(),
        role: Role::SystemAdmin,
        managed_categories: None,
    });
    if admin.role != Role::SystemAdmin {
        admin.role = Role::SystemAdmin;
        admin.managed_categories = None;
    }
}
