use crate::infra::{reference, seed_bootstrap_admin, seed_catalog, LoggingPublisher};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use clap::{Args, ValueEnum};
use health_permit::error::AppError;
use health_permit::workflows::permit::{
    ApplicationForm, ApplicationId, ApplicationStatus, BlobError, BlobStore, Clock, FileRef,
    InMemoryReviewStore, JobCategoryId, ManagedCategories, ManualClock, PaymentMethod,
    PaymentRequest, PermitReviewService, Principal, RejectionCategory, RejectionDetail,
    RepositoryError, ReviewDecision, ReviewStore, Role, Sex, SlotRequest, UserId,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum DemoCategory {
    FoodHandler,
    #[default]
    NonFood,
    SkinContact,
}

impl DemoCategory {
    fn id(self) -> JobCategoryId {
        match self {
            DemoCategory::FoodHandler => reference::FOOD_HANDLER,
            DemoCategory::NonFood => reference::NON_FOOD,
            DemoCategory::SkinContact => reference::SKIN_CONTACT,
        }
    }
}

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Job category the demo applicant applies under
    #[arg(long, value_enum, default_value_t = DemoCategory::NonFood)]
    pub(crate) category: DemoCategory,
    /// Print the walkthrough as JSON instead of text
    #[arg(long)]
    pub(crate) json: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct DemoStep {
    pub(crate) action: String,
    pub(crate) status: ApplicationStatus,
    pub(crate) at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DemoReport {
    pub(crate) application_id: ApplicationId,
    pub(crate) category: String,
    pub(crate) steps: Vec<DemoStep>,
    pub(crate) xray_attempts: u32,
    pub(crate) card_number: Option<String>,
    pub(crate) card_verified: bool,
    pub(crate) inbox: Vec<String>,
}

/// Blob adapter for the walkthrough: nothing is stored, links point nowhere.
struct DemoBlobs;

impl BlobStore for DemoBlobs {
    fn delete(&self, _file_ref: &FileRef) -> Result<(), BlobError> {
        Ok(())
    }

    fn signed_url(&self, file_ref: &FileRef) -> Result<String, BlobError> {
        Ok(format!("demo://{file_ref}"))
    }
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let report = walkthrough(args.category)?;
    if args.json {
        let rendered = serde_json::to_string_pretty(&report).map_err(std::io::Error::other)?;
        println!("{rendered}");
        return Ok(());
    }

    println!("Health card walkthrough ({})", report.category);
    println!("Application {}", report.application_id);
    for step in &report.steps {
        println!(
            "  {} | {:<38} -> {}",
            step.at.format("%Y-%m-%d %H:%M"),
            step.action,
            step.status
        );
    }
    println!("Chest X-ray rejection cycles: {}", report.xray_attempts);
    match &report.card_number {
        Some(card_number) => println!(
            "Health card {card_number} ({})",
            if report.card_verified {
                "verified"
            } else {
                "verification failed"
            }
        ),
        None => println!("No health card issued"),
    }
    println!("Applicant inbox:");
    for title in &report.inbox {
        println!("  - {title}");
    }
    Ok(())
}

fn demo_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn demo_form() -> ApplicationForm {
    ApplicationForm {
        first_name: "Andrea".to_string(),
        middle_name: Some("Lim".to_string()),
        last_name: "Villanueva".to_string(),
        birth_date: NaiveDate::from_ymd_opt(1994, 6, 18).unwrap_or_default(),
        sex: Sex::Female,
        address: "27 Mabini St, Poblacion".to_string(),
        contact_number: "+639171234567".to_string(),
        nationality: Some("Filipino".to_string()),
        establishment: Some("Villanueva Carinderia".to_string()),
    }
}

pub(crate) fn walkthrough(category: DemoCategory) -> Result<DemoReport, AppError> {
    let category_id = category.id();
    let catalog = Arc::new(seed_catalog());
    let clock = Arc::new(ManualClock::new(demo_start()));

    let root = UserId::new();
    let store = Arc::new(InMemoryReviewStore::default());
    store.transaction(|tables| {
        seed_bootstrap_admin(tables, root);
        Ok::<_, RepositoryError>(())
    })?;

    let service = PermitReviewService::new(
        store,
        catalog.clone(),
        Arc::new(DemoBlobs),
        Arc::new(LoggingPublisher),
    )
    .with_clock(clock.clone());

    let root = Principal::new(root);
    let applicant = Principal::new(UserId::new());
    let desk = Principal::new(UserId::new());
    let inspector = Principal::new(UserId::new());
    service.register_applicant(&applicant, "Andrea Villanueva")?;
    service.register_applicant(&desk, "Permit Desk")?;
    service.register_applicant(&inspector, "Inspector Ramos")?;
    service.assign_role(
        &root,
        &desk.user_id,
        Role::Admin,
        Some(ManagedCategories::Only(BTreeSet::from([category_id]))),
    )?;
    service.assign_role(&root, &inspector.user_id, Role::Inspector, None)?;

    let mut steps = Vec::new();
    let mut record = |action: &str, status: ApplicationStatus| {
        steps.push(DemoStep {
            action: action.to_string(),
            status,
            at: clock.now(),
        });
    };

    let application = service.create_application(&applicant, category_id, demo_form())?;
    record("application created", application.status);
    let application = service.complete_application_form(&applicant, &application.id)?;
    record("form completed", application.status);

    let payment = service.create_payment(
        &applicant,
        &application.id,
        PaymentRequest {
            method: PaymentMethod::OverTheCounter,
            amount: 30_000,
            service_fee: 2_000,
            net_amount: 32_000,
            reference_number: Some("OR-2025-0314".to_string()),
            receipt_ref: Some(FileRef::new("receipts/or-2025-0314.jpg")),
            checkout_session_id: None,
        },
    )?;
    let status = service.submit_application(&applicant, &application.id, &payment.id)?;
    record("submitted with counter payment", status);

    clock.advance(Duration::hours(2));
    let outcome = service.review_payment(&desk, &payment.id, ReviewDecision::Approve, None)?;
    record("payment verified", outcome.application_status);

    let mut xray_upload = None;
    for requirement in catalog
        .requirements_for(&category_id)
        .into_iter()
        .filter(|requirement| requirement.is_required)
    {
        let document_type = requirement.document_type;
        let upload = service.upload_document(
            &applicant,
            &application.id,
            &document_type.id,
            FileRef::new(format!("uploads/{}.jpg", document_type.field_name)),
        )?;
        if document_type.id == reference::CHEST_XRAY {
            xray_upload = Some(upload.id);
            continue;
        }
        let outcome = service.review_document(&desk, &upload.id, ReviewDecision::Approve, None)?;
        record(&format!("{} approved", document_type.name), outcome.application_status);
    }

    let xray_attempts = match xray_upload {
        Some(upload_id) => {
            let rejected = service.review_document(
                &desk,
                &upload_id,
                ReviewDecision::Reject(RejectionDetail::new(RejectionCategory::Illegible, "blurry")),
                Some("Film is unreadable; please retake".to_string()),
            )?;
            record("Chest X-Ray rejected (blurry)", rejected.application_status);

            clock.advance(Duration::days(1));
            let resubmitted = service.resubmit_document(
                &applicant,
                &upload_id,
                FileRef::new("uploads/chest_xray-retake.jpg"),
            )?;
            record("Chest X-Ray resubmitted", resubmitted.application_status);

            let approved = service.review_document(&desk, &upload_id, ReviewDecision::Approve, None)?;
            record("Chest X-Ray approved", approved.application_status);

            service
                .document_history(&desk, &application.id, Some(&reference::CHEST_XRAY))?
                .iter()
                .map(|entry| entry.attempt_number)
                .max()
                .unwrap_or(0)
        }
        None => 0,
    };

    let status = service
        .get_application_with_documents(&applicant, &application.id)?
        .application
        .status;
    if status == ApplicationStatus::ForOrientation {
        let slot = service.create_orientation_slot(
            &desk,
            SlotRequest {
                starts_at: clock.now() + Duration::days(2),
                venue: "City Health Office, Room 2".to_string(),
                inspector_id: Some(inspector.user_id),
                capacity: 25,
            },
        )?;
        let booked = service.book_orientation(&applicant, &application.id, &slot.id)?;
        record("orientation booked", booked.status);

        clock.set(slot.starts_at);
        let checked_in = service.orientation_check_in(&inspector, &application.id)?;
        record("orientation check-in", checked_in.status);
        clock.advance(Duration::hours(3));
        let checked_out = service.orientation_check_out(&inspector, &application.id)?;
        record("orientation check-out", checked_out.status);
    }

    let detail = service.get_application_with_documents(&applicant, &application.id)?;
    let card_verified = match &detail.health_card {
        Some(card) => service
            .verify_health_card(&card.card_number, &card.verification_code)
            .is_ok(),
        None => false,
    };
    let inbox = service
        .get_notifications(&applicant)?
        .into_iter()
        .map(|view| view.notification.title)
        .collect();

    Ok(DemoReport {
        application_id: application.id,
        category: detail
            .job_category
            .map(|category| category.name)
            .unwrap_or_default(),
        steps,
        xray_attempts,
        card_number: detail.health_card.map(|card| card.card_number),
        card_verified,
        inbox,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_food_walkthrough_ends_approved_with_a_card() {
        let report = walkthrough(DemoCategory::NonFood).expect("walkthrough runs");
        let statuses: Vec<_> = report.steps.iter().map(|step| step.status).collect();
        assert!(statuses.contains(&ApplicationStatus::DocumentsNeedRevision));
        assert_eq!(statuses.last(), Some(&ApplicationStatus::Approved));
        assert_eq!(report.xray_attempts, 1);
        assert!(report.card_verified);
    }

    #[test]
    fn food_handlers_go_through_orientation() {
        let report = walkthrough(DemoCategory::FoodHandler).expect("walkthrough runs");
        let actions: Vec<_> = report.steps.iter().map(|step| step.action.as_str()).collect();
        assert!(actions.contains(&"orientation check-out"));
        assert!(report
            .steps
            .iter()
            .any(|step| step.status == ApplicationStatus::ForOrientation));
        assert_eq!(
            report.steps.last().map(|step| step.status),
            Some(ApplicationStatus::Approved)
        );
        assert!(report.card_number.is_some());
    }
}
