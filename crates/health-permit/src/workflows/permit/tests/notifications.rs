use super::common::*;
use crate::workflows::permit::audit::AuditRef;
use crate::workflows::permit::documents::ReviewDecision;
use crate::workflows::permit::domain::{FileRef, NotificationKind};
use crate::workflows::permit::ErrorKind;

#[test]
fn applicant_inbox_holds_rejection_and_admins_see_the_feed() {
    let fixture = Fixture::new();
    let (_, _, _, xray_upload) = fixture.with_documents(fixture.ids.food);
    fixture
        .service
        .review_document(&fixture.food_admin, &xray_upload, reject("blurry"), None)
        .expect("rejected");

    let inbox = fixture
        .service
        .get_notifications(&fixture.applicant)
        .expect("inbox");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].notification.kind, NotificationKind::DocumentRejected);
    assert!(inbox[0].notification.message.contains("Chest X-Ray"));
    assert!(inbox[0].source.is_none());

    assert!(fixture.inbox_kinds(&fixture.food_admin).is_empty());
    assert_eq!(
        fixture.inbox_kinds(&fixture.super_admin),
        vec![NotificationKind::DocumentRejected]
    );
    assert!(fixture.inbox_kinds(&fixture.office_admin).is_empty());
    assert!(fixture
        .tables()
        .notifications
        .values()
        .all(|notification| notification.recipient_id == fixture.applicant.user_id));
}

#[test]
fn resubmission_reaches_scoped_admins_only() {
    let fixture = Fixture::new();
    let (_, _, _, xray_upload) = fixture.with_documents(fixture.ids.food);
    fixture
        .service
        .review_document(&fixture.food_admin, &xray_upload, reject("blurry"), None)
        .expect("rejected");
    fixture
        .service
        .resubmit_document(&fixture.applicant, &xray_upload, FileRef::new("uploads/xray-2.pdf"))
        .expect("resubmitted");

    assert_eq!(
        fixture.inbox_kinds(&fixture.food_admin),
        vec![NotificationKind::DocumentResubmitted]
    );
    assert_eq!(
        fixture.inbox_kinds(&fixture.super_admin),
        vec![NotificationKind::DocumentResubmitted]
    );
    assert!(fixture.inbox_kinds(&fixture.office_admin).is_empty());

    let recipients: Vec<_> = fixture
        .publisher
        .published()
        .into_iter()
        .filter(|notification| notification.kind == NotificationKind::DocumentResubmitted)
        .map(|notification| notification.recipient_id)
        .collect();
    assert!(recipients.contains(&fixture.food_admin.user_id));
    assert!(recipients.contains(&fixture.super_admin.user_id));
    assert!(!recipients.contains(&fixture.office_admin.user_id));
}

#[test]
fn categories_nobody_lists_fan_out_to_every_reviewer() {
    let fixture = Fixture::new();
    let (application_id, _) = fixture.submitted(fixture.ids.unlisted);
    let upload = fixture.upload(&application_id, &fixture.ids.id_card, "uploads/id.jpg");
    fixture
        .service
        .review_document(&fixture.super_admin, &upload, reject("expired"), None)
        .expect("rejected");

    assert_eq!(
        fixture.inbox_kinds(&fixture.office_admin),
        vec![NotificationKind::DocumentRejected]
    );
    assert_eq!(
        fixture.inbox_kinds(&fixture.food_admin),
        vec![NotificationKind::DocumentRejected]
    );
    assert!(fixture.inbox_kinds(&fixture.super_admin).is_empty());
}

#[test]
fn acknowledging_a_feed_item_is_per_admin() {
    let fixture = Fixture::new();
    let (_, _, _, xray_upload) = fixture.with_documents(fixture.ids.food);
    let outcome = fixture
        .service
        .review_document(&fixture.food_admin, &xray_upload, reject("blurry"), None)
        .expect("rejected");
    let record_id = outcome.rejection.expect("record").id;
    fixture
        .service
        .resubmit_document(&fixture.applicant, &xray_upload, FileRef::new("uploads/xray-2.pdf"))
        .expect("resubmitted");

    let feed = fixture
        .service
        .get_notifications(&fixture.super_admin)
        .expect("feed");
    assert_eq!(feed[0].source, Some(AuditRef::Document(record_id)));

    fixture
        .service
        .acknowledge_feed_item(&fixture.super_admin, AuditRef::Document(record_id))
        .expect("acknowledged");
    assert!(fixture.inbox_kinds(&fixture.super_admin).is_empty());
    assert_eq!(fixture.inbox_kinds(&fixture.food_admin).len(), 1);

    let error = fixture
        .service
        .acknowledge_feed_item(&fixture.office_admin, AuditRef::Document(record_id))
        .expect_err("outside scope");
    assert_eq!(error.kind(), ErrorKind::Forbidden);

    let error = fixture
        .service
        .acknowledge_feed_item(&fixture.applicant, AuditRef::Document(record_id))
        .expect_err("applicants have no feed");
    assert_eq!(error.kind(), ErrorKind::Unauthorized);
}

#[test]
fn acknowledged_rejection_resurfaces_once_resubmitted() {
    let fixture = Fixture::new();
    let (_, _, _, xray_upload) = fixture.with_documents(fixture.ids.food);
    let outcome = fixture
        .service
        .review_document(&fixture.food_admin, &xray_upload, reject("blurry"), None)
        .expect("rejected");
    let record_id = outcome.rejection.expect("record").id;

    fixture
        .service
        .acknowledge_feed_item(&fixture.super_admin, AuditRef::Document(record_id))
        .expect("acknowledged");
    assert!(fixture.inbox_kinds(&fixture.super_admin).is_empty());

    fixture
        .service
        .resubmit_document(&fixture.applicant, &xray_upload, FileRef::new("uploads/xray-2.pdf"))
        .expect("resubmitted");
    assert_eq!(
        fixture.inbox_kinds(&fixture.super_admin),
        vec![NotificationKind::DocumentResubmitted]
    );
}

#[test]
fn acknowledged_payment_rejection_resurfaces_once_resubmitted() {
    let fixture = Fixture::new();
    let (application_id, payment_id) = fixture.submitted(fixture.ids.food);
    let outcome = fixture
        .service
        .review_payment(&fixture.food_admin, &payment_id, reject("receipt unreadable"), None)
        .expect("rejected");
    let record_id = outcome.rejection.expect("record").id;

    fixture
        .service
        .acknowledge_feed_item(&fixture.super_admin, AuditRef::Payment(record_id))
        .expect("acknowledged");
    assert!(fixture.inbox_kinds(&fixture.super_admin).is_empty());

    let retry = fixture
        .service
        .create_payment(&fixture.applicant, &application_id, counter_payment())
        .expect("new payment");
    fixture
        .service
        .resubmit_payment(&fixture.applicant, &application_id, &payment_id, &retry.id)
        .expect("resubmitted");
    assert_eq!(
        fixture.inbox_kinds(&fixture.super_admin),
        vec![NotificationKind::PaymentResubmitted]
    );
}

#[test]
fn read_notifications_can_be_cleared() {
    let fixture = Fixture::new();
    let (_, _, _, xray_upload) = fixture.with_documents(fixture.ids.food);
    fixture
        .service
        .review_document(&fixture.food_admin, &xray_upload, reject("blurry"), None)
        .expect("rejected");
    let notification_id = fixture
        .service
        .get_notifications(&fixture.applicant)
        .expect("inbox")[0]
        .notification
        .id;

    let error = fixture
        .service
        .mark_notification_read(&fixture.other_applicant, &notification_id)
        .expect_err("not the recipient");
    assert_eq!(error.kind(), ErrorKind::NotFound);

    assert_eq!(
        fixture
            .service
            .clear_read_notifications(&fixture.applicant)
            .expect("nothing read yet"),
        0
    );
    let read = fixture
        .service
        .mark_notification_read(&fixture.applicant, &notification_id)
        .expect("marked");
    assert!(read.is_read);
    assert_eq!(
        fixture
            .service
            .clear_read_notifications(&fixture.applicant)
            .expect("cleared"),
        1
    );
    assert!(fixture.inbox_kinds(&fixture.applicant).is_empty());
}

#[test]
fn delivery_failure_does_not_undo_the_review() {
    let fixture = Fixture::new();
    let (_, _, _, xray_upload) = fixture.with_documents(fixture.ids.food);
    fixture.publisher.fail();

    fixture
        .service
        .review_document(&fixture.food_admin, &xray_upload, reject("blurry"), None)
        .expect("review committed despite push outage");

    let tables = fixture.tables();
    assert_eq!(tables.document_rejections.len(), 1);
    assert_eq!(tables.notifications.len(), 1);
    assert!(fixture.publisher.published().is_empty());
}

#[test]
fn failed_operations_publish_nothing() {
    let fixture = Fixture::new();
    let (_, _, id_upload, _) = fixture.with_documents(fixture.ids.food);
    fixture.approve_document(&fixture.food_admin, &id_upload);
    let published = fixture.publisher.published().len();
    let stored = fixture.tables().notifications.len();

    let error = fixture
        .service
        .review_document(&fixture.food_admin, &id_upload, ReviewDecision::Approve, None)
        .expect_err("already approved");
    assert_eq!(error.kind(), ErrorKind::Conflict);
    assert_eq!(fixture.publisher.published().len(), published);
    assert_eq!(fixture.tables().notifications.len(), stored);
}
