use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::audit::{AuditRef, RejectionDetail};
use super::authorization::Principal;
use super::documents::ReviewDecision;
use super::domain::{
    ApplicationForm, ApplicationId, DocumentTypeId, FileRef, JobCategoryId, ManagedCategories,
    NotificationId, OrientationSlotId, PaymentId, Role, UploadId, UserId,
};
use super::errors::{ErrorKind, ReviewError};
use super::orientation::SlotRequest;
use super::payments::{GatewayConfirmation, PaymentRequest};
use super::repository::ReviewStore;
use super::service::PermitReviewService;

/// Header carrying the caller's user id, set by the identity provider in front of the API.
pub const PRINCIPAL_HEADER: &str = "x-user-id";

type Service<S> = State<Arc<PermitReviewService<S>>>;

/// Router builder exposing the review lifecycle over HTTP.
pub fn permit_router<S>(service: Arc<PermitReviewService<S>>) -> Router
where
    S: ReviewStore + 'static,
{
    Router::new()
        .route("/api/v1/permits/users/register", post(register_handler::<S>))
        .route("/api/v1/permits/users/:user_id/role", put(assign_role_handler::<S>))
        .route(
            "/api/v1/permits/applications",
            post(create_application_handler::<S>).get(list_applications_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id",
            get(application_detail_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/form",
            put(update_form_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/complete",
            post(complete_form_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/submit",
            post(submit_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/approve",
            post(approve_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/reject",
            post(reject_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/documents",
            post(upload_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/documents/history",
            get(document_history_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/payments",
            post(create_payment_handler::<S>).get(payment_history_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/payments/resubmit",
            post(resubmit_payment_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/orientation",
            post(book_orientation_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/orientation/check-in",
            post(check_in_handler::<S>),
        )
        .route(
            "/api/v1/permits/applications/:application_id/orientation/check-out",
            post(check_out_handler::<S>),
        )
        .route(
            "/api/v1/permits/documents/:upload_id",
            delete(delete_document_handler::<S>),
        )
        .route(
            "/api/v1/permits/documents/:upload_id/review",
            post(review_document_handler::<S>),
        )
        .route(
            "/api/v1/permits/documents/:upload_id/resubmit",
            post(resubmit_document_handler::<S>),
        )
        .route(
            "/api/v1/permits/documents/:upload_id/url",
            get(document_url_handler::<S>),
        )
        .route(
            "/api/v1/permits/payments/:payment_id/review",
            post(review_payment_handler::<S>),
        )
        .route(
            "/api/v1/permits/payments/:payment_id/cancel",
            post(cancel_payment_handler::<S>),
        )
        .route(
            "/api/v1/permits/gateway/confirmations",
            post(gateway_confirmation_handler::<S>),
        )
        .route(
            "/api/v1/permits/gateway/failures",
            post(gateway_failure_handler::<S>),
        )
        .route("/api/v1/permits/review/queue", get(queue_handler::<S>))
        .route("/api/v1/permits/review/audit.csv", get(audit_export_handler::<S>))
        .route(
            "/api/v1/permits/orientation/slots",
            post(create_slot_handler::<S>).get(list_slots_handler::<S>),
        )
        .route(
            "/api/v1/permits/notifications",
            get(notifications_handler::<S>),
        )
        .route(
            "/api/v1/permits/notifications/read",
            delete(clear_notifications_handler::<S>),
        )
        .route(
            "/api/v1/permits/notifications/acknowledge",
            post(acknowledge_handler::<S>),
        )
        .route(
            "/api/v1/permits/notifications/:notification_id/read",
            post(mark_read_handler::<S>),
        )
        .route(
            "/api/v1/permits/cards/:card_number/verify",
            get(verify_card_handler::<S>),
        )
        .with_state(service)
}

/// HTTP status for each error kind. Unauthorized and Forbidden share 403 and are told apart
/// by the `kind` field of the body.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::Unauthorized | ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(error: &ReviewError) -> Response {
    let kind = error.kind();
    let payload = json!({
        "error": error.to_string(),
        "kind": kind.label(),
    });
    (status_for(kind), Json(payload)).into_response()
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T, ReviewError>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(error) => error_response(&error),
    }
}

fn principal(headers: &HeaderMap) -> Result<Principal, Response> {
    headers
        .get(PRINCIPAL_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
        .map(|id| Principal::new(UserId(id)))
        .ok_or_else(|| {
            let payload = json!({
                "error": format!("missing or malformed {PRINCIPAL_HEADER} header"),
                "kind": ErrorKind::Unauthenticated.label(),
            });
            (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
        })
}

macro_rules! caller {
    ($headers:expr) => {
        match principal(&$headers) {
            Ok(principal) => principal,
            Err(response) => return response,
        }
    };
}

#[derive(Debug, Deserialize)]
pub(crate) struct RegisterBody {
    display_name: String,
}

pub(crate) async fn register_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.register_applicant(&principal, &body.display_name),
    )
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoleBody {
    role: Role,
    #[serde(default)]
    managed_categories: Option<ManagedCategories>,
}

pub(crate) async fn assign_role_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(user_id): Path<UserId>,
    Json(body): Json<RoleBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.assign_role(&principal, &user_id, body.role, body.managed_categories),
    )
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateApplicationBody {
    job_category_id: JobCategoryId,
    form: ApplicationForm,
}

pub(crate) async fn create_application_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Json(body): Json<CreateApplicationBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::CREATED,
        service.create_application(&principal, body.job_category_id, body.form),
    )
}

pub(crate) async fn list_applications_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(StatusCode::OK, service.list_applications(&principal))
}

pub(crate) async fn application_detail_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.get_application_with_documents(&principal, &application_id),
    )
}

pub(crate) async fn update_form_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
    Json(form): Json<ApplicationForm>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.update_application_form(&principal, &application_id, form),
    )
}

pub(crate) async fn complete_form_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.complete_application_form(&principal, &application_id),
    )
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubmitBody {
    payment_id: PaymentId,
}

pub(crate) async fn submit_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
    Json(body): Json<SubmitBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    let result = service
        .submit_application(&principal, &application_id, &body.payment_id)
        .map(|status| json!({ "application_id": application_id, "status": status }));
    respond(StatusCode::OK, result)
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RemarksBody {
    #[serde(default)]
    remarks: Option<String>,
}

pub(crate) async fn approve_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
    Json(body): Json<RemarksBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.approve_application(&principal, &application_id, body.remarks),
    )
}

pub(crate) async fn reject_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
    Json(body): Json<RemarksBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    let remarks = body.remarks.unwrap_or_default();
    respond(
        StatusCode::OK,
        service.reject_application(&principal, &application_id, &remarks),
    )
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadBody {
    document_type_id: DocumentTypeId,
    file_ref: FileRef,
}

pub(crate) async fn upload_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
    Json(body): Json<UploadBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::CREATED,
        service.upload_document(
            &principal,
            &application_id,
            &body.document_type_id,
            body.file_ref,
        ),
    )
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    #[serde(default)]
    document_type_id: Option<DocumentTypeId>,
}

pub(crate) async fn document_history_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
    Query(query): Query<HistoryQuery>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.document_history(
            &principal,
            &application_id,
            query.document_type_id.as_ref(),
        ),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DecisionKind {
    Approve,
    Reject,
}

/// Review request body shared by documents and payments.
#[derive(Debug, Deserialize)]
pub(crate) struct ReviewBody {
    decision: DecisionKind,
    #[serde(default)]
    rejection: Option<RejectionDetail>,
    #[serde(default)]
    remarks: Option<String>,
}

impl ReviewBody {
    fn into_parts(self) -> Result<(ReviewDecision, Option<String>), ReviewError> {
        let decision = match (self.decision, self.rejection) {
            (DecisionKind::Approve, _) => ReviewDecision::Approve,
            (DecisionKind::Reject, Some(detail)) => ReviewDecision::Reject(detail),
            (DecisionKind::Reject, None) => {
                return Err(ReviewError::validation(
                    "a rejection requires rejection details",
                ))
            }
        };
        Ok((decision, self.remarks))
    }
}

pub(crate) async fn review_document_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(upload_id): Path<UploadId>,
    Json(body): Json<ReviewBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    let result = body.into_parts().and_then(|(decision, remarks)| {
        service.review_document(&principal, &upload_id, decision, remarks)
    });
    respond(StatusCode::OK, result)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResubmitBody {
    file_ref: FileRef,
}

pub(crate) async fn resubmit_document_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(upload_id): Path<UploadId>,
    Json(body): Json<ResubmitBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.resubmit_document(&principal, &upload_id, body.file_ref),
    )
}

pub(crate) async fn delete_document_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(upload_id): Path<UploadId>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    match service.delete_document(&principal, &upload_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(&error),
    }
}

pub(crate) async fn document_url_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(upload_id): Path<UploadId>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    let result = service
        .document_url(&principal, &upload_id)
        .map(|url| json!({ "upload_id": upload_id, "url": url }));
    respond(StatusCode::OK, result)
}

pub(crate) async fn create_payment_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
    Json(request): Json<PaymentRequest>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::CREATED,
        service.create_payment(&principal, &application_id, request),
    )
}

pub(crate) async fn payment_history_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.payment_history(&principal, &application_id),
    )
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResubmitPaymentBody {
    old_payment_id: PaymentId,
    new_payment_id: PaymentId,
}

pub(crate) async fn resubmit_payment_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
    Json(body): Json<ResubmitPaymentBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.resubmit_payment(
            &principal,
            &application_id,
            &body.old_payment_id,
            &body.new_payment_id,
        ),
    )
}

pub(crate) async fn review_payment_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(payment_id): Path<PaymentId>,
    Json(body): Json<ReviewBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    let result = body.into_parts().and_then(|(decision, remarks)| {
        service.review_payment(&principal, &payment_id, decision, remarks)
    });
    respond(StatusCode::OK, result)
}

pub(crate) async fn cancel_payment_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(payment_id): Path<PaymentId>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(StatusCode::OK, service.cancel_payment(&principal, &payment_id))
}

pub(crate) async fn gateway_confirmation_handler<S>(
    State(service): Service<S>,
    Json(confirmation): Json<GatewayConfirmation>,
) -> Response
where
    S: ReviewStore + 'static,
{
    respond(StatusCode::OK, service.confirm_gateway_payment(confirmation))
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayFailureBody {
    payment_id: PaymentId,
}

pub(crate) async fn gateway_failure_handler<S>(
    State(service): Service<S>,
    Json(body): Json<GatewayFailureBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    respond(
        StatusCode::OK,
        service.fail_gateway_payment(&body.payment_id),
    )
}

pub(crate) async fn queue_handler<S>(State(service): Service<S>, headers: HeaderMap) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(StatusCode::OK, service.pending_document_queue(&principal))
}

pub(crate) async fn audit_export_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    match service.export_document_audit_csv(&principal) {
        Ok(csv) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            csv,
        )
            .into_response(),
        Err(error) => error_response(&error),
    }
}

pub(crate) async fn create_slot_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Json(request): Json<SlotRequest>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::CREATED,
        service.create_orientation_slot(&principal, request),
    )
}

pub(crate) async fn list_slots_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(StatusCode::OK, service.orientation_slots(&principal))
}

#[derive(Debug, Deserialize)]
pub(crate) struct BookingBody {
    slot_id: OrientationSlotId,
}

pub(crate) async fn book_orientation_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
    Json(body): Json<BookingBody>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.book_orientation(&principal, &application_id, &body.slot_id),
    )
}

pub(crate) async fn check_in_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.orientation_check_in(&principal, &application_id),
    )
}

pub(crate) async fn check_out_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(application_id): Path<ApplicationId>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.orientation_check_out(&principal, &application_id),
    )
}

pub(crate) async fn notifications_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(StatusCode::OK, service.get_notifications(&principal))
}

pub(crate) async fn mark_read_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Path(notification_id): Path<NotificationId>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    respond(
        StatusCode::OK,
        service.mark_notification_read(&principal, &notification_id),
    )
}

pub(crate) async fn clear_notifications_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    let result = service
        .clear_read_notifications(&principal)
        .map(|cleared| json!({ "cleared": cleared }));
    respond(StatusCode::OK, result)
}

pub(crate) async fn acknowledge_handler<S>(
    State(service): Service<S>,
    headers: HeaderMap,
    Json(reference): Json<AuditRef>,
) -> Response
where
    S: ReviewStore + 'static,
{
    let principal = caller!(headers);
    match service.acknowledge_feed_item(&principal, reference) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(&error),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct VerifyQuery {
    code: String,
}

pub(crate) async fn verify_card_handler<S>(
    State(service): Service<S>,
    Path(card_number): Path<String>,
    Query(query): Query<VerifyQuery>,
) -> Response
where
    S: ReviewStore + 'static,
{
    respond(
        StatusCode::OK,
        service.verify_health_card(&card_number, &query.code),
    )
}
