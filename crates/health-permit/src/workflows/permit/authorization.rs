//! Single capability check consulted by every operation before it touches the ledgers.

use serde::{Deserialize, Serialize};

use super::domain::{Application, ApplicationStatus, OrientationSlot, Role, User, UserId};
use super::repository::ReviewTables;

/// Identity supplied by the upstream identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
}

impl Principal {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

/// Reasons the gate refuses a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessDenied {
    #[error("no user record matches the calling principal")]
    Unauthenticated,
    #[error("role {} may not {action}", .role.label())]
    Unauthorized { role: Role, action: &'static str },
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },
}

/// Operation classes from the guard table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Create or edit an owned application, upload or resubmit its documents and payments.
    ManageOwnApplication,
    /// Review documents/payments or change the application status.
    Review,
    /// Read an application and its checklist.
    View,
    /// Orientation check-in and check-out.
    ConductOrientation,
    /// Create orientation slots.
    ScheduleOrientation,
    /// Assign roles and managed categories.
    ManageRoles,
}

impl Action {
    pub const fn label(self) -> &'static str {
        match self {
            Action::ManageOwnApplication => "manage_own_application",
            Action::Review => "review",
            Action::View => "view",
            Action::ConductOrientation => "conduct_orientation",
            Action::ScheduleOrientation => "schedule_orientation",
            Action::ManageRoles => "manage_roles",
        }
    }
}

/// What the action targets.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    Application(&'a Application),
    Orientation {
        application: &'a Application,
        slot: &'a OrientationSlot,
    },
    System,
}

/// Resolve a principal to its user record.
pub fn resolve(tables: &ReviewTables, principal: &Principal) -> Result<User, AccessDenied> {
    tables
        .users
        .get(&principal.user_id)
        .cloned()
        .ok_or(AccessDenied::Unauthenticated)
}

/// Capability check: (principal, resource, action) -> allow/deny.
pub fn authorize(user: &User, action: Action, resource: Resource<'_>) -> Result<(), AccessDenied> {
    let unauthorized = || AccessDenied::Unauthorized {
        role: user.role,
        action: action.label(),
    };

    match action {
        Action::ManageOwnApplication => {
            if user.role != Role::Applicant {
                return Err(unauthorized());
            }
            match resource {
                Resource::Application(application) => ensure_owner(user, application),
                Resource::Orientation { application, .. } => ensure_owner(user, application),
                Resource::System => Ok(()),
            }
        }
        Action::Review => {
            if !user.role.is_reviewer() {
                return Err(unauthorized());
            }
            match resource {
                Resource::Application(application)
                | Resource::Orientation { application, .. } => ensure_scope(user, application),
                Resource::System => Ok(()),
            }
        }
        Action::View => match (user.role, resource) {
            (_, Resource::System) => Ok(()),
            (Role::Inspector, Resource::Orientation { application, slot })
                if application.status == ApplicationStatus::ForOrientation =>
            {
                ensure_assigned(user, slot)
            }
            (Role::Inspector, _) => Err(AccessDenied::Forbidden {
                reason: "inspectors only see applications booked for orientation".to_string(),
            }),
            (
                Role::Applicant,
                Resource::Application(application) | Resource::Orientation { application, .. },
            ) => ensure_owner(user, application),
            (
                Role::Admin | Role::SystemAdmin,
                Resource::Application(application) | Resource::Orientation { application, .. },
            ) => ensure_scope(user, application),
        },
        Action::ConductOrientation => {
            if user.role != Role::Inspector {
                return Err(unauthorized());
            }
            match resource {
                Resource::Orientation { slot, .. } => ensure_assigned(user, slot),
                _ => Err(AccessDenied::Forbidden {
                    reason: "orientation actions require a booked slot".to_string(),
                }),
            }
        }
        Action::ScheduleOrientation => {
            if user.role.is_reviewer() {
                Ok(())
            } else {
                Err(unauthorized())
            }
        }
        Action::ManageRoles => {
            if user.role == Role::SystemAdmin {
                Ok(())
            } else {
                Err(unauthorized())
            }
        }
    }
}

/// How an application is presented to the gate: through its booked slot when it has one.
pub fn viewed<'a>(tables: &'a ReviewTables, application: &'a Application) -> Resource<'a> {
    application
        .orientation
        .as_ref()
        .and_then(|attendance| tables.orientation_slots.get(&attendance.slot_id))
        .map_or(Resource::Application(application), |slot| Resource::Orientation {
            application,
            slot,
        })
}

fn ensure_assigned(user: &User, slot: &OrientationSlot) -> Result<(), AccessDenied> {
    match slot.inspector_id {
        Some(assigned) if assigned != user.id => Err(AccessDenied::Forbidden {
            reason: "orientation slot is assigned to another inspector".to_string(),
        }),
        _ => Ok(()),
    }
}

fn ensure_owner(user: &User, application: &Application) -> Result<(), AccessDenied> {
    if application.owner_id == user.id {
        Ok(())
    } else {
        Err(AccessDenied::Forbidden {
            reason: "application belongs to another applicant".to_string(),
        })
    }
}

fn ensure_scope(user: &User, application: &Application) -> Result<(), AccessDenied> {
    if user.scope().covers(&application.job_category_id) {
        Ok(())
    } else {
        Err(AccessDenied::Forbidden {
            reason: "application is outside your managed job categories".to_string(),
        })
    }
}
