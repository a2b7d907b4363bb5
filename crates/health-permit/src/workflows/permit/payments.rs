//! Payment ledger operations, manual payment review, and the gateway callback.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::audit::{self, PaymentRejectionRecord, PaymentSnapshot, AUDIT_SCHEMA_VERSION};
use super::authorization::{self, Action, Principal, Resource};
use super::documents::ReviewDecision;
use super::domain::{
    ApplicationId, ApplicationStatus, FileRef, Payment, PaymentId, PaymentMethod, PaymentStatus,
    RejectionId,
};
use super::errors::ReviewError;
use super::notifications::ReviewEvent;
use super::repository::{ReviewStore, ReviewTables};
use super::service::{ensure_mutable, load_application, load_application_mut, PermitReviewService};
use super::state_machine;

/// Applicant-supplied payment details. Amounts are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub method: PaymentMethod,
    pub amount: u64,
    pub service_fee: u64,
    pub net_amount: u64,
    #[serde(default)]
    pub reference_number: Option<String>,
    #[serde(default)]
    pub receipt_ref: Option<FileRef>,
    #[serde(default)]
    pub checkout_session_id: Option<String>,
}

impl PaymentRequest {
    pub fn validate(&self) -> Result<(), ReviewError> {
        if self.amount == 0 {
            return Err(ReviewError::validation("amount must be greater than zero"));
        }
        if self.amount.checked_add(self.service_fee) != Some(self.net_amount) {
            return Err(ReviewError::validation(format!(
                "net amount {} does not equal amount {} plus service fee {}",
                self.net_amount, self.amount, self.service_fee
            )));
        }
        let has_reference = self
            .reference_number
            .as_deref()
            .is_some_and(|reference| !reference.trim().is_empty());
        if self.method.requires_reference() && !has_reference {
            return Err(ReviewError::validation(
                "a reference number is required for manual payments",
            ));
        }
        if self.method == PaymentMethod::OnlineGateway && self.checkout_session_id.is_none() {
            return Err(ReviewError::validation(
                "gateway payments require a checkout session",
            ));
        }
        Ok(())
    }
}

/// Success report delivered by the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfirmation {
    pub payment_id: PaymentId,
    #[serde(default)]
    pub checkout_session_id: Option<String>,
    pub gateway_payment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayOutcome {
    pub payment: Payment,
    /// True when the callback was a replay and nothing changed.
    pub already_complete: bool,
    pub application_status: ApplicationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentReviewOutcome {
    pub payment: Payment,
    pub rejection: Option<PaymentRejectionRecord>,
    pub application_status: ApplicationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentResubmission {
    pub payment: Payment,
    pub replaced_rejection: Option<PaymentRejectionRecord>,
    pub application_status: ApplicationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentHistory {
    pub payments: Vec<Payment>,
    pub rejections: Vec<PaymentRejectionRecord>,
}

fn load_payment<'t>(tables: &'t ReviewTables, id: &PaymentId) -> Result<&'t Payment, ReviewError> {
    tables
        .payments
        .get(id)
        .ok_or_else(|| ReviewError::not_found("payment", id))
}

fn load_payment_mut<'t>(
    tables: &'t mut ReviewTables,
    id: &PaymentId,
) -> Result<&'t mut Payment, ReviewError> {
    tables
        .payments
        .get_mut(id)
        .ok_or_else(|| ReviewError::not_found("payment", id))
}

fn ensure_gateway_method(payment: &Payment) -> Result<(), ReviewError> {
    if payment.method != PaymentMethod::OnlineGateway {
        return Err(ReviewError::conflict(format!(
            "payment {} is not a gateway payment",
            payment.id
        )));
    }
    Ok(())
}

impl<S> PermitReviewService<S>
where
    S: ReviewStore + 'static,
{
    /// Record a new payment. Only one pending or complete payment may exist per application.
    pub fn create_payment(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
        request: PaymentRequest,
    ) -> Result<Payment, ReviewError> {
        request.validate()?;
        let now = self.now();

        self.atomically(|tables, _| {
            let user = authorization::resolve(tables, principal)?;
            let application = load_application(tables, application_id)?;
            authorization::authorize(
                &user,
                Action::ManageOwnApplication,
                Resource::Application(application),
            )?;
            ensure_mutable(application)?;
            if application.status == ApplicationStatus::Draft {
                return Err(ReviewError::conflict(
                    "complete the application form before paying",
                ));
            }
            if let Some(active) = tables.active_payment(application_id) {
                return Err(ReviewError::conflict(format!(
                    "payment {} is already {} for this application",
                    active.id,
                    active.status.label()
                )));
            }

            let payment = Payment {
                id: PaymentId::new(),
                application_id: *application_id,
                amount: request.amount,
                service_fee: request.service_fee,
                net_amount: request.net_amount,
                method: request.method,
                reference_number: request
                    .reference_number
                    .map(|reference| reference.trim().to_string()),
                status: PaymentStatus::Pending,
                receipt_ref: request.receipt_ref,
                checkout_session_id: request.checkout_session_id,
                gateway_payment_id: None,
                superseded_by: None,
                reviewed_by: None,
                admin_remarks: None,
                created_at: now,
                completed_at: None,
                updated_at: now,
            };
            tables.payments.insert(payment.id, payment.clone());
            info!(
                application_id = %application_id,
                payment_id = %payment.id,
                method = ?payment.method,
                "payment recorded"
            );
            Ok(payment)
        })
    }

    /// Verify or reject a manually submitted payment.
    pub fn review_payment(
        &self,
        principal: &Principal,
        payment_id: &PaymentId,
        decision: ReviewDecision,
        remarks: Option<String>,
    ) -> Result<PaymentReviewOutcome, ReviewError> {
        if let ReviewDecision::Reject(detail) = &decision {
            if detail.reason.trim().is_empty() {
                return Err(ReviewError::validation("a rejection requires a reason"));
            }
        }
        let now = self.now();

        self.atomically(|tables, outbox| {
            let user = authorization::resolve(tables, principal)?;
            let payment = load_payment(tables, payment_id)?.clone();
            let application = load_application(tables, &payment.application_id)?;
            authorization::authorize(&user, Action::Review, Resource::Application(application))?;
            if !application.status.is_in_review() {
                return Err(ReviewError::conflict(format!(
                    "application is {}; payments are not open for review",
                    application.status
                )));
            }
            if payment.status != PaymentStatus::Pending {
                return Err(ReviewError::conflict(format!(
                    "payment is already {}",
                    payment.status.label()
                )));
            }
            if payment.method == PaymentMethod::OnlineGateway
                && decision == ReviewDecision::Approve
            {
                return Err(ReviewError::conflict(
                    "gateway payments are completed by the gateway callback",
                ));
            }
            let applicant_id = application.owner_id;
            self.begin_review(tables, outbox, &payment.application_id, now)?;

            let rejection = match decision {
                ReviewDecision::Approve => {
                    let row = load_payment_mut(tables, payment_id)?;
                    row.status = PaymentStatus::Complete;
                    row.completed_at = Some(now);
                    row.reviewed_by = Some(user.id);
                    row.admin_remarks = remarks;
                    row.updated_at = now;
                    let net_amount = row.net_amount;
                    self.emit(
                        tables,
                        outbox,
                        &ReviewEvent::PaymentConfirmed {
                            application_id: payment.application_id,
                            applicant_id,
                            net_amount,
                        },
                        now,
                    );
                    None
                }
                ReviewDecision::Reject(detail) => {
                    let attempt_number = audit::next_payment_attempt(
                        &tables.payment_rejections,
                        &payment.application_id,
                    );
                    let row = load_payment_mut(tables, payment_id)?;
                    row.status = PaymentStatus::Failed;
                    row.reviewed_by = Some(user.id);
                    row.admin_remarks = remarks.or_else(|| Some(detail.reason.clone()));
                    row.updated_at = now;

                    let record = PaymentRejectionRecord {
                        id: RejectionId::new(),
                        schema_version: AUDIT_SCHEMA_VERSION,
                        application_id: payment.application_id,
                        payment_id: payment.id,
                        snapshot: PaymentSnapshot::from(&payment),
                        category: detail.category,
                        reason: detail.reason,
                        issues: detail.issues,
                        rejected_by: user.id,
                        rejected_at: now,
                        was_replaced: false,
                        replaced_at: None,
                        replacement_payment_id: None,
                        attempt_number,
                        admin_read_by: Default::default(),
                    };
                    tables.payment_rejections.push(record.clone());
                    info!(
                        application_id = %payment.application_id,
                        payment_id = %payment.id,
                        attempt_number,
                        actor = %user.id,
                        "payment rejected"
                    );
                    self.emit(
                        tables,
                        outbox,
                        &ReviewEvent::PaymentRejected {
                            application_id: payment.application_id,
                            applicant_id,
                            reason: record.reason.clone(),
                            attempt_number,
                        },
                        now,
                    );
                    Some(record)
                }
            };

            self.settle(tables, outbox, &payment.application_id, now)?;
            Ok(PaymentReviewOutcome {
                payment: load_payment(tables, payment_id)?.clone(),
                rejection,
                application_status: load_application(tables, &payment.application_id)?.status,
            })
        })
    }

    /// Link a new payment to the failed or cancelled one it supersedes.
    pub fn resubmit_payment(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
        old_payment_id: &PaymentId,
        new_payment_id: &PaymentId,
    ) -> Result<PaymentResubmission, ReviewError> {
        if old_payment_id == new_payment_id {
            return Err(ReviewError::conflict(
                "a payment cannot supersede itself",
            ));
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
            let job_category_id = application.job_category_id;
            let applicant_name = application.form.full_name();

            let old = load_payment(tables, old_payment_id)?;
            let new = load_payment(tables, new_payment_id)?;
            if &old.application_id != application_id || &new.application_id != application_id {
                return Err(ReviewError::conflict(
                    "both payments must belong to the application",
                ));
            }
            if !old.status.is_supersedable() {
                return Err(ReviewError::conflict(format!(
                    "payment {} is {}; only failed or cancelled payments can be superseded",
                    old.id,
                    old.status.label()
                )));
            }
            if let Some(successor) = old.superseded_by {
                return Err(ReviewError::conflict(format!(
                    "payment {} was already superseded by {successor}",
                    old.id
                )));
            }
            if !new.status.is_active() {
                return Err(ReviewError::conflict(format!(
                    "replacement payment is {}",
                    new.status.label()
                )));
            }

            let replaced_rejection =
                match audit::latest_unreplaced_payment(&mut tables.payment_rejections, old_payment_id)
                {
                    Some(record) => {
                        record.was_replaced = true;
                        record.replaced_at = Some(now);
                        record.replacement_payment_id = Some(*new_payment_id);
                        record.admin_read_by.clear();
                        Some(record.clone())
                    }
                    None => None,
                };
            let old = load_payment_mut(tables, old_payment_id)?;
            old.superseded_by = Some(*new_payment_id);
            old.updated_at = now;

            if let Some(record) = &replaced_rejection {
                info!(
                    application_id = %application_id,
                    payment_id = %new_payment_id,
                    attempt_number = record.attempt_number,
                    actor = %user.id,
                    "payment resubmitted"
                );
                self.emit(
                    tables,
                    outbox,
                    &ReviewEvent::PaymentResubmitted {
                        application_id: *application_id,
                        job_category_id,
                        applicant_name,
                        attempt_number: record.attempt_number,
                    },
                    now,
                );
            }
            self.settle(tables, outbox, application_id, now)?;

            Ok(PaymentResubmission {
                payment: load_payment(tables, new_payment_id)?.clone(),
                replaced_rejection,
                application_status: load_application(tables, application_id)?.status,
            })
        })
    }

    /// Idempotent gateway success handler. A replay of an already complete payment returns
    /// the current state without side effects.
    pub fn confirm_gateway_payment(
        &self,
        confirmation: GatewayConfirmation,
    ) -> Result<GatewayOutcome, ReviewError> {
        if confirmation.gateway_payment_id.trim().is_empty() {
            return Err(ReviewError::validation("gateway payment id is required"));
        }
        let now = self.now();

        self.atomically(|tables, outbox| {
            let payment = load_payment(tables, &confirmation.payment_id)?;
            ensure_gateway_method(payment)?;
            match (&payment.checkout_session_id, &confirmation.checkout_session_id) {
                (Some(expected), Some(reported)) if expected == reported => {}
                _ => {
                    warn!(payment_id = %payment.id, "gateway callback with a foreign checkout session");
                    return Err(ReviewError::validation(
                        "checkout session does not match the payment",
                    ));
                }
            }
            let application = load_application(tables, &payment.application_id)?;
            if payment.status == PaymentStatus::Complete {
                info!(payment_id = %payment.id, "gateway callback replayed");
                return Ok(GatewayOutcome {
                    payment: payment.clone(),
                    already_complete: true,
                    application_status: application.status,
                });
            }
            if payment.status != PaymentStatus::Pending {
                return Err(ReviewError::conflict(format!(
                    "payment is {} and cannot be completed",
                    payment.status.label()
                )));
            }
            if application.status.is_terminal() || application.status == ApplicationStatus::Draft {
                warn!(
                    application_id = %application.id,
                    payment_id = %payment.id,
                    status = application.status.label(),
                    "gateway confirmation for a closed application"
                );
                return Err(ReviewError::conflict(format!(
                    "application is {}",
                    application.status
                )));
            }
            let application_id = application.id;
            let applicant_id = application.owner_id;
            let awaiting_submission = application.status == ApplicationStatus::PendingPayment;

            let row = load_payment_mut(tables, &confirmation.payment_id)?;
            row.status = PaymentStatus::Complete;
            row.completed_at = Some(now);
            row.gateway_payment_id = Some(confirmation.gateway_payment_id.trim().to_string());
            row.updated_at = now;
            let net_amount = row.net_amount;
            info!(application_id = %application_id, payment_id = %row.id, "gateway payment confirmed");

            self.emit(
                tables,
                outbox,
                &ReviewEvent::PaymentConfirmed {
                    application_id,
                    applicant_id,
                    net_amount,
                },
                now,
            );

            if awaiting_submission {
                let application = load_application_mut(tables, &application_id)?;
                if let Some(change) =
                    state_machine::transition(application, ApplicationStatus::Submitted, now)?
                {
                    self.after_transition(tables, outbox, change, None)?;
                }
            } else {
                self.settle(tables, outbox, &application_id, now)?;
            }

            Ok(GatewayOutcome {
                payment: load_payment(tables, &confirmation.payment_id)?.clone(),
                already_complete: false,
                application_status: load_application(tables, &application_id)?.status,
            })
        })
    }

    /// Gateway failure report: the pending payment becomes `Failed` and must be superseded.
    pub fn fail_gateway_payment(&self, payment_id: &PaymentId) -> Result<Payment, ReviewError> {
        let now = self.now();
        self.atomically(|tables, outbox| {
            let payment = load_payment(tables, payment_id)?;
            ensure_gateway_method(payment)?;
            match payment.status {
                PaymentStatus::Failed => return Ok(payment.clone()),
                PaymentStatus::Pending => {}
                other => {
                    return Err(ReviewError::conflict(format!(
                        "payment is {} and cannot fail",
                        other.label()
                    )))
                }
            }
            let application_id = payment.application_id;

            let row = load_payment_mut(tables, payment_id)?;
            row.status = PaymentStatus::Failed;
            row.updated_at = now;
            let failed = row.clone();
            warn!(application_id = %application_id, payment_id = %payment_id, "gateway payment failed");

            if load_application(tables, &application_id)?.status.is_in_review() {
                self.settle(tables, outbox, &application_id, now)?;
            }
            Ok(failed)
        })
    }

    /// Applicant withdraws a pending payment before the application is submitted.
    pub fn cancel_payment(
        &self,
        principal: &Principal,
        payment_id: &PaymentId,
    ) -> Result<Payment, ReviewError> {
        let now = self.now();
        self.atomically(|tables, _| {
            let user = authorization::resolve(tables, principal)?;
            let payment = load_payment(tables, payment_id)?;
            let application = load_application(tables, &payment.application_id)?;
            authorization::authorize(
                &user,
                Action::ManageOwnApplication,
                Resource::Application(application),
            )?;
            if application.status != ApplicationStatus::PendingPayment {
                return Err(ReviewError::conflict(
                    "payments can only be cancelled before submission",
                ));
            }
            if payment.status != PaymentStatus::Pending {
                return Err(ReviewError::conflict(format!(
                    "payment is {}",
                    payment.status.label()
                )));
            }

            let row = load_payment_mut(tables, payment_id)?;
            row.status = PaymentStatus::Cancelled;
            row.updated_at = now;
            info!(payment_id = %payment_id, actor = %user.id, "payment cancelled");
            Ok(row.clone())
        })
    }

    /// Every payment attempt and rejection for an application, oldest first.
    pub fn payment_history(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
    ) -> Result<PaymentHistory, ReviewError> {
        self.snapshot(|tables| {
            let user = authorization::resolve(tables, principal)?;
            let application = load_application(tables, application_id)?;
            authorization::authorize(
                &user,
                Action::View,
                authorization::viewed(tables, application),
            )?;

            let mut payments: Vec<Payment> = tables.payments_for(application_id).cloned().collect();
            payments.sort_by_key(|payment| payment.created_at);
            let mut rejections: Vec<PaymentRejectionRecord> = tables
                .payment_rejections
                .iter()
                .filter(|record| &record.application_id == application_id)
                .cloned()
                .collect();
            rejections.sort_by_key(|record| record.attempt_number);
            Ok(PaymentHistory {
                payments,
                rejections,
            })
        })
    }
}
