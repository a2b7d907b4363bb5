//! Scheduled archival of applications whose payment deadline has passed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::domain::{Application, ApplicationId, ApplicationStatus, PaymentStatus};
use super::errors::ReviewError;
use super::repository::ReviewStore;
use super::service::{load_application_mut, PermitReviewService};
use super::state_machine;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub archived: Vec<ApplicationId>,
    /// Candidates that were left alone: changed concurrently or failed individually.
    pub skipped: usize,
}

impl SweepReport {
    pub fn archived_count(&self) -> usize {
        self.archived.len()
    }
}

fn is_expired(application: &Application, now: DateTime<Utc>) -> bool {
    application.status == ApplicationStatus::PendingPayment
        && application
            .payment_deadline
            .is_some_and(|deadline| now > deadline)
}

impl<S> PermitReviewService<S>
where
    S: ReviewStore + 'static,
{
    /// Archive every `Pending Payment` application past its deadline. Each archival is its
    /// own transaction that re-checks status and deadline, so running this repeatedly or
    /// alongside a payment completion is safe. Only storage failures abort the batch.
    pub fn sweep_expired_pending_payments(&self) -> Result<SweepReport, ReviewError> {
        let now = self.now();
        let candidates: Vec<ApplicationId> = self.store.read(|tables| {
            tables
                .applications
                .values()
                .filter(|application| is_expired(application, now))
                .map(|application| application.id)
                .collect()
        })?;

        let mut report = SweepReport::default();
        for application_id in candidates {
            match self.archive_if_expired(&application_id, now) {
                Ok(true) => report.archived.push(application_id),
                Ok(false) => report.skipped += 1,
                Err(err) if err.is_fatal_for_batch() => return Err(err),
                Err(err) => {
                    warn!(
                        application_id = %application_id,
                        error = %err,
                        "sweep skipped application"
                    );
                    report.skipped += 1;
                }
            }
        }

        info!(
            archived = report.archived_count(),
            skipped = report.skipped,
            "payment deadline sweep finished"
        );
        Ok(report)
    }

    fn archive_if_expired(
        &self,
        application_id: &ApplicationId,
        now: DateTime<Utc>,
    ) -> Result<bool, ReviewError> {
        self.atomically(|tables, outbox| {
            let Some(application) = tables.applications.get(application_id) else {
                return Ok(false);
            };
            if !is_expired(application, now) || tables.has_complete_payment(application_id) {
                return Ok(false);
            }

            for payment in tables
                .payments
                .values_mut()
                .filter(|payment| &payment.application_id == application_id)
                .filter(|payment| payment.status == PaymentStatus::Pending)
            {
                payment.status = PaymentStatus::Cancelled;
                payment.updated_at = now;
            }

            let application = load_application_mut(tables, application_id)?;
            if let Some(change) =
                state_machine::transition(application, ApplicationStatus::Archived, now)?
            {
                self.after_transition(tables, outbox, change, None)?;
            }
            Ok(true)
        })
    }
}
