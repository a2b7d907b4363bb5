//! In-person orientation scheduling and attendance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::authorization::{self, Action, Principal, Resource};
use super::domain::{
    Application, ApplicationId, ApplicationStatus, OrientationAttendance, OrientationSlot,
    OrientationSlotId, Role, UserId,
};
use super::errors::ReviewError;
use super::repository::{ReviewStore, ReviewTables};
use super::service::{load_application, load_application_mut, PermitReviewService};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRequest {
    pub starts_at: DateTime<Utc>,
    pub venue: String,
    #[serde(default)]
    pub inspector_id: Option<UserId>,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAvailability {
    pub slot: OrientationSlot,
    pub booked: u32,
    pub remaining: u32,
}

fn booked_count(tables: &ReviewTables, slot_id: &OrientationSlotId) -> u32 {
    tables
        .applications
        .values()
        .filter(|application| {
            application
                .orientation
                .as_ref()
                .is_some_and(|attendance| &attendance.slot_id == slot_id)
        })
        .count() as u32
}

fn load_slot<'t>(
    tables: &'t ReviewTables,
    id: &OrientationSlotId,
) -> Result<&'t OrientationSlot, ReviewError> {
    tables
        .orientation_slots
        .get(id)
        .ok_or_else(|| ReviewError::not_found("orientation slot", id))
}

/// Application plus its booked slot, with the inspector gate applied.
fn attended<'t>(
    tables: &'t ReviewTables,
    principal: &Principal,
    application_id: &ApplicationId,
) -> Result<(UserId, &'t Application, &'t OrientationAttendance), ReviewError> {
    let user = authorization::resolve(tables, principal)?;
    let application = load_application(tables, application_id)?;
    let attendance = application
        .orientation
        .as_ref()
        .ok_or_else(|| ReviewError::conflict("no orientation slot has been booked"))?;
    let slot = load_slot(tables, &attendance.slot_id)?;
    authorization::authorize(
        &user,
        Action::ConductOrientation,
        Resource::Orientation { application, slot },
    )?;
    if application.status != ApplicationStatus::ForOrientation {
        return Err(ReviewError::conflict(format!(
            "application is {}, not {}",
            application.status,
            ApplicationStatus::ForOrientation
        )));
    }
    Ok((user.id, application, attendance))
}

impl<S> PermitReviewService<S>
where
    S: ReviewStore + 'static,
{
    pub fn create_orientation_slot(
        &self,
        principal: &Principal,
        request: SlotRequest,
    ) -> Result<OrientationSlot, ReviewError> {
        let now = self.now();
        if request.venue.trim().is_empty() {
            return Err(ReviewError::validation("venue is required"));
        }
        if request.capacity == 0 {
            return Err(ReviewError::validation("capacity must be at least one"));
        }
        if request.starts_at <= now {
            return Err(ReviewError::validation("orientation must start in the future"));
        }

        self.atomically(|tables, _| {
            let user = authorization::resolve(tables, principal)?;
            authorization::authorize(&user, Action::ScheduleOrientation, Resource::System)?;
            if let Some(inspector_id) = &request.inspector_id {
                let is_inspector = tables
                    .users
                    .get(inspector_id)
                    .is_some_and(|inspector| inspector.role == Role::Inspector);
                if !is_inspector {
                    return Err(ReviewError::validation(format!(
                        "user {inspector_id} is not an inspector"
                    )));
                }
            }

            let slot = OrientationSlot {
                id: OrientationSlotId::new(),
                starts_at: request.starts_at,
                venue: request.venue.trim().to_string(),
                inspector_id: request.inspector_id,
                capacity: request.capacity,
            };
            tables.orientation_slots.insert(slot.id, slot.clone());
            info!(slot_id = %slot.id, actor = %user.id, "orientation slot created");
            Ok(slot)
        })
    }

    /// Upcoming slots with remaining capacity.
    pub fn orientation_slots(
        &self,
        principal: &Principal,
    ) -> Result<Vec<SlotAvailability>, ReviewError> {
        let now = self.now();
        self.snapshot(|tables| {
            authorization::resolve(tables, principal)?;
            let mut slots: Vec<SlotAvailability> = tables
                .orientation_slots
                .values()
                .filter(|slot| slot.starts_at > now)
                .map(|slot| {
                    let booked = booked_count(tables, &slot.id);
                    SlotAvailability {
                        slot: slot.clone(),
                        booked,
                        remaining: slot.capacity.saturating_sub(booked),
                    }
                })
                .collect();
            slots.sort_by_key(|availability| availability.slot.starts_at);
            Ok(slots)
        })
    }

    /// Reserve a seat for an application awaiting orientation. Rebooking before check-in
    /// moves the reservation.
    pub fn book_orientation(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
        slot_id: &OrientationSlotId,
    ) -> Result<Application, ReviewError> {
        let now = self.now();
        self.atomically(|tables, _| {
            let user = authorization::resolve(tables, principal)?;
            let application = load_application(tables, application_id)?;
            authorization::authorize(
                &user,
                Action::ManageOwnApplication,
                Resource::Application(application),
            )?;
            if application.status != ApplicationStatus::ForOrientation {
                return Err(ReviewError::conflict(format!(
                    "application is {}; orientation is not due",
                    application.status
                )));
            }
            if let Some(attendance) = &application.orientation {
                if attendance.checked_in_at.is_some() {
                    return Err(ReviewError::conflict(
                        "orientation already started for this application",
                    ));
                }
                if &attendance.slot_id == slot_id {
                    return Ok(application.clone());
                }
            }

            let slot = load_slot(tables, slot_id)?;
            if slot.starts_at <= now {
                return Err(ReviewError::conflict("orientation slot has already started"));
            }
            if booked_count(tables, slot_id) >= slot.capacity {
                return Err(ReviewError::conflict("orientation slot is full"));
            }

            let application = load_application_mut(tables, application_id)?;
            application.orientation = Some(OrientationAttendance {
                slot_id: *slot_id,
                booked_at: now,
                checked_in_at: None,
                checked_in_by: None,
                completed_at: None,
                completed_by: None,
            });
            application.updated_at = now;
            info!(application_id = %application_id, slot_id = %slot_id, "orientation booked");
            Ok(application.clone())
        })
    }

    pub fn orientation_check_in(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
    ) -> Result<Application, ReviewError> {
        let now = self.now();
        self.atomically(|tables, _| {
            let (inspector_id, _, attendance) = attended(tables, principal, application_id)?;
            if attendance.checked_in_at.is_some() {
                return Err(ReviewError::conflict("applicant is already checked in"));
            }

            let application = load_application_mut(tables, application_id)?;
            if let Some(attendance) = application.orientation.as_mut() {
                attendance.checked_in_at = Some(now);
                attendance.checked_in_by = Some(inspector_id);
            }
            application.updated_at = now;
            info!(application_id = %application_id, actor = %inspector_id, "orientation check-in");
            Ok(application.clone())
        })
    }

    /// Completes the orientation and re-evaluates the application, which may approve it.
    pub fn orientation_check_out(
        &self,
        principal: &Principal,
        application_id: &ApplicationId,
    ) -> Result<Application, ReviewError> {
        let now = self.now();
        self.atomically(|tables, outbox| {
            let (inspector_id, _, attendance) = attended(tables, principal, application_id)?;
            if attendance.checked_in_at.is_none() {
                return Err(ReviewError::conflict("applicant has not checked in"));
            }
            if attendance.completed_at.is_some() {
                return Err(ReviewError::conflict("orientation is already completed"));
            }

            let application = load_application_mut(tables, application_id)?;
            if let Some(attendance) = application.orientation.as_mut() {
                attendance.completed_at = Some(now);
                attendance.completed_by = Some(inspector_id);
            }
            application.updated_at = now;
            info!(application_id = %application_id, actor = %inspector_id, "orientation completed");

            self.settle(tables, outbox, application_id, now)?;
            Ok(load_application(tables, application_id)?.clone())
        })
    }
}
