use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{ensure_future, validate_notes};
use super::locks::LockKey;
use super::{Engine, EngineError, SideEffect, observe};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub user_id: Ulid,
    pub resource_id: Ulid,
    pub start_time: Ms,
    pub notes: Option<String>,
}

/// Fields to change; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingUpdate {
    pub start_time: Option<Ms>,
    pub resource_id: Option<Ulid>,
    pub notes: Option<String>,
}

impl Engine {
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        let result = self.create_booking_inner(req).await;
        observe("create", &result);
        result
    }

    async fn create_booking_inner(&self, req: NewBooking) -> Result<Booking, EngineError> {
        validate_notes(req.notes.as_deref())?;
        let user = self.ensure_approved_user(req.user_id).await?;
        self.ensure_active_resource(req.resource_id).await?;
        self.local(req.start_time)?;
        let span = Span::slot(req.start_time);
        ensure_future(span.start, self.now())?;

        let _guards = self
            .locks
            .acquire(vec![LockKey::User(user.id), LockKey::Resource(req.resource_id)])
            .await;
        let now = self.now();
        self.ensure_user_free(user.id, now, None).await?;
        self.ensure_slot_free(req.resource_id, span, None).await?;
        self.ensure_available(req.resource_id, span.start).await?;

        let booking = Booking {
            id: Ulid::new(),
            user_id: user.id,
            resource_id: req.resource_id,
            span,
            status: BookingStatus::Scheduled,
            notes: req.notes,
            created_at: now,
            updated_at: now,
        };
        self.bookings
            .insert_booking(&booking)
            .await
            .map_err(EngineError::from_occupy)?;

        info!(booking_id = %booking.id, resource_id = %booking.resource_id, user_id = %booking.user_id, start = booking.start(), "booking created");
        self.audit(
            Some(user.id),
            "create",
            "booking",
            booking.id,
            format!("booked resource {} at {}", booking.resource_id, booking.start()),
        );
        self.outbox.push(SideEffect::Confirmation {
            booking: booking.clone(),
        });
        Ok(booking)
    }

    /// Edit a booking. Availability and conflicts are re-checked only when
    /// the start time or resource actually changes.
    pub async fn update_booking(&self, id: Ulid, update: BookingUpdate) -> Result<Booking, EngineError> {
        let result = self.update_booking_inner(id, update, "update").await;
        observe("update", &result);
        result
    }

    /// Move a booking to a new start (and optionally a new resource) in one write.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        new_start: Ms,
        new_resource_id: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        let update = BookingUpdate {
            start_time: Some(new_start),
            resource_id: new_resource_id,
            notes: None,
        };
        let result = self.update_booking_inner(id, update, "reschedule").await;
        observe("reschedule", &result);
        result
    }

    async fn update_booking_inner(
        &self,
        id: Ulid,
        update: BookingUpdate,
        action: &'static str,
    ) -> Result<Booking, EngineError> {
        validate_notes(update.notes.as_deref())?;
        let mut seen = self.load_booking(id).await?;

        // User ids never change, so the user lock pins this booking. Without
        // an explicit resource the target is wherever the booking sits once
        // locked; if it moved while we waited, lock its new resource instead.
        let (current, target_resource, _guards) = loop {
            let target = update.resource_id.unwrap_or(seen.resource_id);
            let guards = self
                .locks
                .acquire(vec![LockKey::User(seen.user_id), LockKey::Resource(target)])
                .await;
            let reloaded = self.load_booking(id).await?;
            if update.resource_id.is_some() || reloaded.resource_id == target {
                break (reloaded, target, guards);
            }
            drop(guards);
            seen = reloaded;
        };
        let target_start = update.start_time.unwrap_or(current.start());
        let moves = target_start != current.start() || target_resource != current.resource_id;

        if action == "reschedule" && current.status.is_terminal() {
            return Err(EngineError::State(format!(
                "cannot reschedule a {} booking",
                current.status
            )));
        }

        let now = self.now();
        let mut next = current.clone();
        if moves {
            if current.status.is_terminal() {
                return Err(EngineError::State(format!(
                    "cannot move a {} booking",
                    current.status
                )));
            }
            self.local(target_start)?;
            self.ensure_active_resource(target_resource).await?;
            ensure_future(target_start, now)?;
            let span = Span::slot(target_start);
            self.ensure_user_free(current.user_id, now, Some(id)).await?;
            self.ensure_slot_free(target_resource, span, Some(id)).await?;
            self.ensure_available(target_resource, target_start).await?;
            next.resource_id = target_resource;
            next.set_start(target_start);
        }
        if let Some(notes) = update.notes {
            next.notes = Some(notes);
        }
        if next == current {
            return Ok(current);
        }
        next.updated_at = now;

        self.bookings
            .update_booking(&next)
            .await
            .map_err(EngineError::from_occupy)?;

        info!(booking_id = %id, resource_id = %next.resource_id, user_id = %next.user_id, start = next.start(), action, "booking updated");
        let description = if moves {
            format!(
                "moved from resource {} at {} to resource {} at {}",
                current.resource_id,
                current.start(),
                next.resource_id,
                next.start()
            )
        } else {
            "updated notes".to_string()
        };
        self.audit(None, action, "booking", id, description);
        if moves {
            self.outbox.push(SideEffect::Confirmation {
                booking: next.clone(),
            });
        }
        Ok(next)
    }

    pub async fn confirm_presence(&self, id: Ulid) -> Result<Booking, EngineError> {
        let result = self.transition(id, Transition::ConfirmPresence, None).await;
        observe("confirm_presence", &result);
        result
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let result = self.transition(id, Transition::Complete, None).await;
        observe("complete", &result);
        result
    }

    /// Allowed only while more than three hours remain before the start.
    pub async fn cancel_booking(&self, id: Ulid, reason: Option<String>) -> Result<Booking, EngineError> {
        let result = self.transition(id, Transition::Cancel, reason).await;
        observe("cancel", &result);
        result
    }

    /// Allowed only once the booking has ended.
    pub async fn mark_no_show(&self, id: Ulid) -> Result<Booking, EngineError> {
        let result = self.transition(id, Transition::MarkNoShow, None).await;
        observe("mark_no_show", &result);
        result
    }

    async fn transition(
        &self,
        id: Ulid,
        transition: Transition,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        let current = self.load_booking(id).await?;
        let _guards = self.locks.acquire(vec![LockKey::User(current.user_id)]).await;
        let mut booking = self.load_booking(id).await?;

        let next = booking.status.transition(transition).ok_or_else(|| {
            EngineError::State(format!(
                "cannot {} a {} booking",
                transition.as_str(),
                booking.status
            ))
        })?;

        let now = self.now();
        match transition {
            Transition::Cancel if now + CANCELLATION_NOTICE_MS >= booking.start() => {
                return Err(EngineError::State(
                    "cancellation requires at least 3 hours notice".into(),
                ));
            }
            Transition::MarkNoShow if now < booking.end() => {
                return Err(EngineError::State("booking has not ended yet".into()));
            }
            _ => {}
        }

        let previous = booking.status;
        booking.status = next;
        booking.updated_at = now;
        self.bookings.update_booking(&booking).await?;

        info!(booking_id = %id, from = %previous, to = %next, "booking transition");
        let description = match &reason {
            Some(r) => format!("{previous} -> {next}: {r}"),
            None => format!("{previous} -> {next}"),
        };
        self.audit(None, transition.as_str(), "booking", id, description);
        if transition == Transition::Cancel {
            self.outbox.push(SideEffect::Cancellation {
                booking: booking.clone(),
                reason,
            });
        }
        Ok(booking)
    }
}
