//! End-to-end review lifecycle through the public service facade, including the races the
//! single-transaction design has to survive.

mod common {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    use health_permit::workflows::permit::{
        ApplicationForm, BlobError, BlobStore, DiscardPublisher, DocumentType, DocumentTypeId,
        FileRef, InMemoryReviewStore, JobCategory, JobCategoryDocument, JobCategoryId,
        ManagedCategories, ManualClock, PermitReviewService, Principal, RequirementCatalog, Role,
        ReviewTables, Sex, User, UserId,
    };

    pub(super) struct SignedUrls;

    impl BlobStore for SignedUrls {
        fn delete(&self, _file_ref: &FileRef) -> Result<(), BlobError> {
            Ok(())
        }

        fn signed_url(&self, file_ref: &FileRef) -> Result<String, BlobError> {
            Ok(format!("https://storage.test/{file_ref}"))
        }
    }

    pub(super) struct World {
        pub(super) service: Arc<PermitReviewService<InMemoryReviewStore>>,
        pub(super) clock: Arc<ManualClock>,
        pub(super) start: DateTime<Utc>,
        pub(super) food: JobCategoryId,
        pub(super) office: JobCategoryId,
        pub(super) id_card: DocumentTypeId,
        pub(super) xray: DocumentTypeId,
        pub(super) applicant: Principal,
        pub(super) admin: Principal,
        pub(super) inspector: Principal,
    }

    fn user(role: Role, name: &str, scope: Option<ManagedCategories>) -> User {
        User {
            id: UserId::new(),
            display_name: name.to_string(),
            role,
            managed_categories: scope,
        }
    }

    pub(super) fn world() -> World {
        let food = JobCategoryId::new();
        let office = JobCategoryId::new();
        let id_card = DocumentTypeId::new();
        let xray = DocumentTypeId::new();
        let catalog = RequirementCatalog::new(
            [
                DocumentType {
                    id: id_card,
                    name: "Valid ID".to_string(),
                    field_name: "valid_id".to_string(),
                    required_by_default: true,
                },
                DocumentType {
                    id: xray,
                    name: "Chest X-Ray".to_string(),
                    field_name: "chest_xray".to_string(),
                    required_by_default: true,
                },
            ],
            [
                JobCategory {
                    id: food,
                    name: "Food Handler".to_string(),
                    require_orientation: true,
                },
                JobCategory {
                    id: office,
                    name: "Non-Food".to_string(),
                    require_orientation: false,
                },
            ],
            [food, office].into_iter().flat_map(|category| {
                [id_card, xray].into_iter().map(move |document_type_id| JobCategoryDocument {
                    job_category_id: category,
                    document_type_id,
                    is_required: true,
                })
            }),
        );

        let applicant = user(Role::Applicant, "Lea Santos", None);
        let admin = user(
            Role::Admin,
            "Permit Desk",
            Some(ManagedCategories::Only(BTreeSet::from([food, office]))),
        );
        let inspector = user(Role::Inspector, "Inspector Cruz", None);
        let principals = [applicant.id, admin.id, inspector.id].map(Principal::new);

        let mut tables = ReviewTables::default();
        for user in [applicant, admin, inspector] {
            tables.users.insert(user.id, user);
        }

        let start = Utc
            .with_ymd_and_hms(2025, 2, 3, 9, 0, 0)
            .single()
            .expect("valid start");
        let clock = Arc::new(ManualClock::new(start));
        let service = PermitReviewService::new(
            Arc::new(InMemoryReviewStore::new(tables)),
            Arc::new(catalog),
            Arc::new(SignedUrls),
            Arc::new(DiscardPublisher),
        )
        .with_clock(clock.clone());

        World {
            service: Arc::new(service),
            clock,
            start,
            food,
            office,
            id_card,
            xray,
            applicant: principals[0],
            admin: principals[1],
            inspector: principals[2],
        }
    }

    pub(super) fn form() -> ApplicationForm {
        ApplicationForm {
            first_name: "Lea".to_string(),
            middle_name: None,
            last_name: "Santos".to_string(),
            birth_date: NaiveDate::from_ymd_opt(1990, 11, 2).expect("valid"),
            sex: Sex::Female,
            address: "14 Luna St".to_string(),
            contact_number: "+639181112233".to_string(),
            nationality: None,
            establishment: Some("Santos Bakery".to_string()),
        }
    }
}

use std::sync::Arc;
use std::thread;

use chrono::Duration;

use common::{form, world, World};
use health_permit::workflows::permit::{
    ApplicationId, ApplicationStatus, ErrorKind, FileRef, GatewayConfirmation, JobCategoryId,
    PaymentId, PaymentMethod, PaymentRequest, PaymentStatus, RejectionCategory, RejectionDetail,
    ReviewDecision, ReviewStatus, SlotRequest,
};

fn gateway_request(session: &str) -> PaymentRequest {
    PaymentRequest {
        method: PaymentMethod::OnlineGateway,
        amount: 50_000,
        service_fee: 2_500,
        net_amount: 52_500,
        reference_number: None,
        receipt_ref: None,
        checkout_session_id: Some(session.to_string()),
    }
}

fn open_with_gateway(world: &World, category: JobCategoryId, session: &str) -> (ApplicationId, PaymentId) {
    let application = world
        .service
        .create_application(&world.applicant, category, form())
        .expect("application created");
    world
        .service
        .complete_application_form(&world.applicant, &application.id)
        .expect("form completed");
    let payment = world
        .service
        .create_payment(&world.applicant, &application.id, gateway_request(session))
        .expect("checkout started");
    (application.id, payment.id)
}

fn confirm(world: &World, payment_id: PaymentId, session: &str) -> Result<ApplicationStatus, ErrorKind> {
    world
        .service
        .confirm_gateway_payment(GatewayConfirmation {
            payment_id,
            checkout_session_id: Some(session.to_string()),
            gateway_payment_id: format!("gw_{session}"),
        })
        .map(|outcome| outcome.application_status)
        .map_err(|err| err.kind())
}

/// Paid application whose X-ray goes through one reject and resubmit round before approval.
fn review_cycle(world: &World, category: JobCategoryId) -> ApplicationId {
    let (application_id, payment_id) = open_with_gateway(world, category, "cs_cycle");
    assert_eq!(confirm(world, payment_id, "cs_cycle"), Ok(ApplicationStatus::Submitted));

    let id_upload = world
        .service
        .upload_document(&world.applicant, &application_id, &world.id_card, FileRef::new("docs/id.jpg"))
        .expect("id uploaded");
    world
        .service
        .review_document(&world.admin, &id_upload.id, ReviewDecision::Approve, None)
        .expect("id approved");

    let xray_upload = world
        .service
        .upload_document(&world.applicant, &application_id, &world.xray, FileRef::new("docs/xray.pdf"))
        .expect("xray uploaded");
    let rejected = world
        .service
        .review_document(
            &world.admin,
            &xray_upload.id,
            ReviewDecision::Reject(RejectionDetail::new(RejectionCategory::Illegible, "blurry")),
            None,
        )
        .expect("xray rejected");
    assert_eq!(rejected.application_status, ApplicationStatus::DocumentsNeedRevision);
    let record = rejected.rejection.expect("audit record");
    assert_eq!(record.attempt_number, 1);
    assert!(!record.was_replaced);

    let resubmitted = world
        .service
        .resubmit_document(&world.applicant, &xray_upload.id, FileRef::new("docs/xray-retake.pdf"))
        .expect("xray resubmitted");
    assert!(resubmitted.replaced_rejection.was_replaced);
    assert_eq!(resubmitted.upload.review_status, ReviewStatus::Pending);

    world
        .service
        .review_document(&world.admin, &xray_upload.id, ReviewDecision::Approve, None)
        .expect("retake approved");
    application_id
}

#[test]
fn rejected_document_cycle_ends_in_orientation_for_food_handlers() {
    let world = world();
    let application_id = review_cycle(&world, world.food);

    let detail = world
        .service
        .get_application_with_documents(&world.applicant, &application_id)
        .expect("detail");
    assert_eq!(detail.application.status, ApplicationStatus::ForOrientation);
    assert_eq!(detail.payment.map(|payment| payment.status), Some(PaymentStatus::Complete));
    let xray = detail
        .checklist
        .iter()
        .find(|item| item.document_type.id == world.xray)
        .expect("xray on checklist");
    assert_eq!(xray.rejection_count, 1);

    let slot = world
        .service
        .create_orientation_slot(
            &world.admin,
            SlotRequest {
                starts_at: world.start + Duration::days(1),
                venue: "Municipal Hall".to_string(),
                inspector_id: None,
                capacity: 20,
            },
        )
        .expect("slot");
    world
        .service
        .book_orientation(&world.applicant, &application_id, &slot.id)
        .expect("booked");
    world.clock.advance(Duration::days(1));
    world
        .service
        .orientation_check_in(&world.inspector, &application_id)
        .expect("checked in");
    let approved = world
        .service
        .orientation_check_out(&world.inspector, &application_id)
        .expect("checked out");
    assert_eq!(approved.status, ApplicationStatus::Approved);
}

#[test]
fn rejected_document_cycle_approves_directly_without_orientation() {
    let world = world();
    let application_id = review_cycle(&world, world.office);

    let detail = world
        .service
        .get_application_with_documents(&world.applicant, &application_id)
        .expect("detail");
    assert_eq!(detail.application.status, ApplicationStatus::Approved);
    let card = detail.health_card.expect("card issued");
    let verified = world
        .service
        .verify_health_card(&card.card_number, &card.verification_code)
        .expect("verifiable");
    assert_eq!(verified.holder_name, "Lea Santos");
}

#[test]
fn sweep_and_gateway_race_never_archive_a_paid_application() {
    let world = Arc::new(world());
    let opened: Vec<(ApplicationId, PaymentId, String)> = (0..24)
        .map(|index| {
            let session = format!("cs_race_{index}");
            let (application_id, payment_id) = open_with_gateway(&world, world.office, &session);
            (application_id, payment_id, session)
        })
        .collect();
    world.clock.advance(Duration::days(7) + Duration::minutes(1));

    thread::scope(|scope| {
        let sweeper = {
            let world = Arc::clone(&world);
            scope.spawn(move || world.service.sweep_expired_pending_payments())
        };
        for (_, payment_id, session) in &opened {
            let world = Arc::clone(&world);
            scope.spawn(move || confirm(&world, *payment_id, session));
        }
        sweeper.join().expect("sweeper thread").expect("sweep succeeded");
    });

    for (application_id, payment_id, _) in &opened {
        let detail = world
            .service
            .get_application_with_documents(&world.applicant, application_id)
            .expect("detail");
        let payment_complete = world
            .service
            .payment_history(&world.applicant, application_id)
            .expect("history")
            .payments
            .iter()
            .any(|payment| &payment.id == payment_id && payment.status == PaymentStatus::Complete);
        match detail.application.status {
            ApplicationStatus::Archived => assert!(!payment_complete),
            ApplicationStatus::Submitted => assert!(payment_complete),
            other => panic!("unexpected status {other}"),
        }
    }
}

#[test]
fn concurrent_resubmissions_have_exactly_one_winner() {
    let world = Arc::new(world());
    let (application_id, payment_id) = open_with_gateway(&world, world.office, "cs_resubmit");
    confirm(&world, payment_id, "cs_resubmit").expect("paid");
    let upload = world
        .service
        .upload_document(&world.applicant, &application_id, &world.xray, FileRef::new("docs/xray.pdf"))
        .expect("uploaded");
    world
        .service
        .review_document(
            &world.admin,
            &upload.id,
            ReviewDecision::Reject(RejectionDetail::new(RejectionCategory::Expired, "older than 6 months")),
            None,
        )
        .expect("rejected");

    let results: Vec<Result<(), ErrorKind>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|attempt| {
                let world = Arc::clone(&world);
                let upload_id = upload.id;
                scope.spawn(move || {
                    world
                        .service
                        .resubmit_document(
                            &world.applicant,
                            &upload_id,
                            FileRef::new(format!("docs/xray-{attempt}.pdf")),
                        )
                        .map(|_| ())
                        .map_err(|err| err.kind())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("resubmission thread"))
            .collect()
    });

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|result| result.err())
        .all(|kind| kind == ErrorKind::Conflict));

    let history = world
        .service
        .document_history(&world.applicant, &application_id, Some(&world.xray))
        .expect("history");
    assert_eq!(history.len(), 1);
    assert!(history[0].was_replaced);
}
