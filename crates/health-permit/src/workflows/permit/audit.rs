//! Rejection history for documents and payments.
//!
//! Records are written in the current shape only (`schema_version` = [`AUDIT_SCHEMA_VERSION`]).
//! Snapshots persisted before the attempt counter and itemized issues existed are normalized
//! on read by [`deserialize_document_trail`] and [`deserialize_payment_trail`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::domain::{
    ApplicationId, DocumentTypeId, FileRef, Payment, PaymentId, PaymentMethod, RejectionId,
    UploadId, UserId,
};

pub const AUDIT_SCHEMA_VERSION: u16 = 2;
const LEGACY_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    Illegible,
    Expired,
    WrongDocument,
    Incomplete,
    InformationMismatch,
    InvalidPayment,
    Other,
}

impl RejectionCategory {
    pub const fn label(self) -> &'static str {
        match self {
            RejectionCategory::Illegible => "illegible",
            RejectionCategory::Expired => "expired",
            RejectionCategory::WrongDocument => "wrong_document",
            RejectionCategory::Incomplete => "incomplete",
            RejectionCategory::InformationMismatch => "information_mismatch",
            RejectionCategory::InvalidPayment => "invalid_payment",
            RejectionCategory::Other => "other",
        }
    }
}

/// Reviewer supplied context for a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionDetail {
    pub category: RejectionCategory,
    pub reason: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl RejectionDetail {
    pub fn new(category: RejectionCategory, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
            issues: Vec::new(),
        }
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }
}

/// Audit entry created each time a document upload is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRejectionRecord {
    pub id: RejectionId,
    pub schema_version: u16,
    pub application_id: ApplicationId,
    pub document_type_id: DocumentTypeId,
    pub upload_id: UploadId,
    pub rejected_file_ref: FileRef,
    pub category: RejectionCategory,
    pub reason: String,
    pub issues: Vec<String>,
    pub rejected_by: UserId,
    pub rejected_at: DateTime<Utc>,
    pub was_replaced: bool,
    pub replaced_at: Option<DateTime<Utc>>,
    pub attempt_number: u32,
    pub admin_read_by: BTreeSet<UserId>,
}

/// Frozen copy of the payment fields a reviewer rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSnapshot {
    pub amount: u64,
    pub service_fee: u64,
    pub net_amount: u64,
    pub method: PaymentMethod,
    pub reference_number: Option<String>,
    pub receipt_ref: Option<FileRef>,
}

impl From<&Payment> for PaymentSnapshot {
    fn from(payment: &Payment) -> Self {
        Self {
            amount: payment.amount,
            service_fee: payment.service_fee,
            net_amount: payment.net_amount,
            method: payment.method,
            reference_number: payment.reference_number.clone(),
            receipt_ref: payment.receipt_ref.clone(),
        }
    }
}

/// Audit entry created each time a payment is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRejectionRecord {
    pub id: RejectionId,
    pub schema_version: u16,
    pub application_id: ApplicationId,
    pub payment_id: PaymentId,
    pub snapshot: PaymentSnapshot,
    pub category: RejectionCategory,
    pub reason: String,
    pub issues: Vec<String>,
    pub rejected_by: UserId,
    pub rejected_at: DateTime<Utc>,
    pub was_replaced: bool,
    pub replaced_at: Option<DateTime<Utc>>,
    pub replacement_payment_id: Option<PaymentId>,
    pub attempt_number: u32,
    pub admin_read_by: BTreeSet<UserId>,
}

/// Reference to either trail, used when acknowledging admin feed items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "trail", content = "id", rename_all = "snake_case")]
pub enum AuditRef {
    Document(RejectionId),
    Payment(RejectionId),
}

/// Next attempt number for an (application, document type) pair.
pub fn next_document_attempt(
    trail: &[DocumentRejectionRecord],
    application_id: &ApplicationId,
    document_type_id: &DocumentTypeId,
) -> u32 {
    let prior = trail
        .iter()
        .filter(|record| {
            &record.application_id == application_id
                && &record.document_type_id == document_type_id
        })
        .count();
    prior as u32 + 1
}

/// Next attempt number for an application's payment.
pub fn next_payment_attempt(
    trail: &[PaymentRejectionRecord],
    application_id: &ApplicationId,
) -> u32 {
    let prior = trail
        .iter()
        .filter(|record| &record.application_id == application_id)
        .count();
    prior as u32 + 1
}

/// Most recent rejection of the pair that has not been superseded yet.
pub fn latest_unreplaced_document<'a>(
    trail: &'a mut [DocumentRejectionRecord],
    application_id: &ApplicationId,
    document_type_id: &DocumentTypeId,
) -> Option<&'a mut DocumentRejectionRecord> {
    trail
        .iter_mut()
        .filter(|record| {
            &record.application_id == application_id
                && &record.document_type_id == document_type_id
                && !record.was_replaced
        })
        .max_by_key(|record| record.attempt_number)
}

pub fn latest_unreplaced_payment<'a>(
    trail: &'a mut [PaymentRejectionRecord],
    payment_id: &PaymentId,
) -> Option<&'a mut PaymentRejectionRecord> {
    trail
        .iter_mut()
        .filter(|record| &record.payment_id == payment_id && !record.was_replaced)
        .max_by_key(|record| record.attempt_number)
}

/// Row layout written before attempt tracking existed.
#[derive(Debug, Deserialize)]
struct LegacyDocumentRejection {
    id: RejectionId,
    application_id: ApplicationId,
    document_type_id: DocumentTypeId,
    upload_id: UploadId,
    file_ref: FileRef,
    reason: String,
    rejected_by: UserId,
    rejected_at: DateTime<Utc>,
    #[serde(default)]
    replaced: bool,
    #[serde(default)]
    replaced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    read_by: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
struct LegacyPaymentRejection {
    id: RejectionId,
    application_id: ApplicationId,
    payment_id: PaymentId,
    amount: u64,
    #[serde(default)]
    service_fee: u64,
    method: PaymentMethod,
    #[serde(default)]
    reference_number: Option<String>,
    reason: String,
    rejected_by: UserId,
    rejected_at: DateTime<Utc>,
    #[serde(default)]
    replaced: bool,
    #[serde(default)]
    replaced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    replacement_payment_id: Option<PaymentId>,
    #[serde(default)]
    read_by: Vec<UserId>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditDecodeError {
    #[error("unsupported audit schema version {0}")]
    UnsupportedVersion(u64),
    #[error("malformed audit record: {0}")]
    Malformed(#[from] serde_json::Error),
}

fn schema_version_of(value: &Value) -> u64 {
    value
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(u64::from(LEGACY_SCHEMA_VERSION))
}

/// Normalize a mixed list of stored document rejection entries into the current shape.
pub fn normalize_document_trail(
    values: Vec<Value>,
) -> Result<Vec<DocumentRejectionRecord>, AuditDecodeError> {
    let mut records = Vec::with_capacity(values.len());
    let mut legacy_ids = BTreeSet::new();

    for value in values {
        match schema_version_of(&value) {
            1 => {
                let legacy: LegacyDocumentRejection = serde_json::from_value(value)?;
                legacy_ids.insert(legacy.id);
                records.push(DocumentRejectionRecord {
                    id: legacy.id,
                    schema_version: AUDIT_SCHEMA_VERSION,
                    application_id: legacy.application_id,
                    document_type_id: legacy.document_type_id,
                    upload_id: legacy.upload_id,
                    rejected_file_ref: legacy.file_ref,
                    category: RejectionCategory::Other,
                    reason: legacy.reason,
                    issues: Vec::new(),
                    rejected_by: legacy.rejected_by,
                    rejected_at: legacy.rejected_at,
                    was_replaced: legacy.replaced,
                    replaced_at: legacy.replaced_at,
                    attempt_number: 0,
                    admin_read_by: legacy.read_by.into_iter().collect(),
                });
            }
            2 => records.push(serde_json::from_value(value)?),
            other => return Err(AuditDecodeError::UnsupportedVersion(other)),
        }
    }

    records.sort_by_key(|record| record.rejected_at);
    let mut last_attempt: BTreeMap<(ApplicationId, DocumentTypeId), u32> = BTreeMap::new();
    for record in &mut records {
        let key = (record.application_id, record.document_type_id);
        let previous = last_attempt.get(&key).copied().unwrap_or(0);
        if legacy_ids.contains(&record.id) {
            record.attempt_number = previous + 1;
        }
        last_attempt.insert(key, record.attempt_number.max(previous));
    }

    Ok(records)
}

/// Payment counterpart of [`normalize_document_trail`].
pub fn normalize_payment_trail(
    values: Vec<Value>,
) -> Result<Vec<PaymentRejectionRecord>, AuditDecodeError> {
    let mut records = Vec::with_capacity(values.len());
    let mut legacy_ids = BTreeSet::new();

    for value in values {
        match schema_version_of(&value) {
            1 => {
                let legacy: LegacyPaymentRejection = serde_json::from_value(value)?;
                legacy_ids.insert(legacy.id);
                records.push(PaymentRejectionRecord {
                    id: legacy.id,
                    schema_version: AUDIT_SCHEMA_VERSION,
                    application_id: legacy.application_id,
                    payment_id: legacy.payment_id,
                    snapshot: PaymentSnapshot {
                        amount: legacy.amount,
                        service_fee: legacy.service_fee,
                        net_amount: legacy.amount.saturating_add(legacy.service_fee),
                        method: legacy.method,
                        reference_number: legacy.reference_number,
                        receipt_ref: None,
                    },
                    category: RejectionCategory::InvalidPayment,
                    reason: legacy.reason,
                    issues: Vec::new(),
                    rejected_by: legacy.rejected_by,
                    rejected_at: legacy.rejected_at,
                    was_replaced: legacy.replaced,
                    replaced_at: legacy.replaced_at,
                    replacement_payment_id: legacy.replacement_payment_id,
                    attempt_number: 0,
                    admin_read_by: legacy.read_by.into_iter().collect(),
                });
            }
            2 => records.push(serde_json::from_value(value)?),
            other => return Err(AuditDecodeError::UnsupportedVersion(other)),
        }
    }

    records.sort_by_key(|record| record.rejected_at);
    let mut last_attempt: BTreeMap<ApplicationId, u32> = BTreeMap::new();
    for record in &mut records {
        let previous = last_attempt.get(&record.application_id).copied().unwrap_or(0);
        if legacy_ids.contains(&record.id) {
            record.attempt_number = previous + 1;
        }
        last_attempt.insert(record.application_id, record.attempt_number.max(previous));
    }

    Ok(records)
}

pub(crate) fn deserialize_document_trail<'de, D>(
    deserializer: D,
) -> Result<Vec<DocumentRejectionRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<Value>::deserialize(deserializer)?;
    normalize_document_trail(values).map_err(serde::de::Error::custom)
}

pub(crate) fn deserialize_payment_trail<'de, D>(
    deserializer: D,
) -> Result<Vec<PaymentRejectionRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<Value>::deserialize(deserializer)?;
    normalize_payment_trail(values).map_err(serde::de::Error::custom)
}

/// Compliance export of the document trail, one CSV row per rejection.
pub fn document_trail_csv(trail: &[DocumentRejectionRecord]) -> Result<String, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "rejection_id",
        "application_id",
        "document_type_id",
        "attempt_number",
        "category",
        "reason",
        "issues",
        "rejected_by",
        "rejected_at",
        "was_replaced",
        "replaced_at",
    ])?;

    for record in trail {
        writer.write_record([
            record.id.to_string(),
            record.application_id.to_string(),
            record.document_type_id.to_string(),
            record.attempt_number.to_string(),
            record.category.label().to_string(),
            record.reason.clone(),
            record.issues.join("; "),
            record.rejected_by.to_string(),
            record.rejected_at.to_rfc3339(),
            record.was_replaced.to_string(),
            record
                .replaced_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
