use ulid::Ulid;

use crate::clock::{LocalParts, local_parts};
use crate::model::*;

use super::availability::covers;
use super::{ConflictKind, Engine, EngineError};

pub(crate) const MAX_NOTES_LEN: usize = 2048;

pub(crate) fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    if let Some(n) = notes
        && n.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::Validation(format!(
            "notes longer than {MAX_NOTES_LEN} bytes"
        )));
    }
    Ok(())
}

pub(crate) fn ensure_future(start: Ms, now: Ms) -> Result<(), EngineError> {
    if start <= now {
        return Err(EngineError::Validation("start time must be in the future".into()));
    }
    Ok(())
}

impl Engine {
    /// Local breakdown of a requested start; rejects unrepresentable instants.
    pub(super) fn local(&self, t: Ms) -> Result<LocalParts, EngineError> {
        local_parts(t, &self.tz)
            .ok_or_else(|| EngineError::Validation(format!("instant {t} out of range")))
    }

    pub(super) async fn ensure_approved_user(&self, user_id: Ulid) -> Result<User, EngineError> {
        match self.users.get_user(user_id).await? {
            Some(user) if user.is_approved() => Ok(user),
            Some(_) => Err(EngineError::PreconditionFailed(format!(
                "user {user_id} is not approved"
            ))),
            None => Err(EngineError::PreconditionFailed(format!(
                "user {user_id} does not exist"
            ))),
        }
    }

    pub(super) async fn ensure_active_resource(&self, resource_id: Ulid) -> Result<Resource, EngineError> {
        match self.resources.get_resource(resource_id).await? {
            Some(resource) if resource.is_active() => Ok(resource),
            Some(_) => Err(EngineError::PreconditionFailed(format!(
                "resource {resource_id} is inactive"
            ))),
            None => Err(EngineError::PreconditionFailed(format!(
                "resource {resource_id} does not exist"
            ))),
        }
    }

    /// At most one session in progress and one future booking per user.
    pub(super) async fn ensure_user_free(
        &self,
        user_id: Ulid,
        now: Ms,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let open: Vec<Booking> = self
            .bookings
            .open_bookings_for_user(user_id)
            .await?
            .into_iter()
            .filter(|b| Some(b.id) != exclude)
            .collect();
        if let Some(current) = open.iter().find(|b| b.span.contains_instant(now)) {
            return Err(EngineError::Conflict(ConflictKind::SessionInProgress(current.id)));
        }
        if let Some(future) = open.iter().find(|b| b.start() > now) {
            return Err(EngineError::Conflict(ConflictKind::FutureBookingExists(future.id)));
        }
        Ok(())
    }

    pub(super) async fn ensure_slot_free(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let taken = self
            .bookings
            .open_bookings_overlapping(resource_id, span, exclude)
            .await?;
        match taken.first() {
            Some(other) => Err(EngineError::Conflict(ConflictKind::SlotTaken(other.id))),
            None => Ok(()),
        }
    }

    pub(super) async fn ensure_available(&self, resource_id: Ulid, start: Ms) -> Result<(), EngineError> {
        if self.is_resource_available_at(resource_id, start).await? {
            Ok(())
        } else {
            Err(EngineError::PreconditionFailed(format!(
                "resource {resource_id} has no availability at {}",
                self.describe(start)
            )))
        }
    }

    /// True iff an active rule of the resource covers the instant on the
    /// local calendar (weekday, validity window, `start <= t < end`).
    pub async fn is_resource_available_at(&self, resource_id: Ulid, instant: Ms) -> Result<bool, EngineError> {
        let at = self.local(instant)?;
        let rules = self.rules.rules_for_resource_day(resource_id, at.weekday).await?;
        Ok(covers(&rules, &at))
    }

    fn describe(&self, t: Ms) -> String {
        match local_parts(t, &self.tz) {
            Some(p) => format!("{} {}", p.date, p.time),
            None => t.to_string(),
        }
    }
}
