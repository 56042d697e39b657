mod availability;
mod conflict;
mod error;
mod locks;
mod mutations;
pub mod outbox;
mod queries;
mod rules;

pub use availability::{
    covers, find_rule_overlap, generate_slots, is_valid_for_date, time_ranges_overlap, validate_rule, weekday_of,
};
pub use error::{ConflictKind, EngineError};
pub use mutations::{BookingUpdate, NewBooking};
pub use outbox::{Outbox, OutboxStats, OutboxWorker, SideEffect};
pub use rules::{NewRule, RuleUpdate};

use std::sync::Arc;

use chrono::FixedOffset;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::ports::*;

use locks::LockTable;

/// The booking allocator: single authority for availability rules and the
/// booking lifecycle. Holds no booking state of its own; every decision
/// re-reads the stores under the relevant per-user/per-resource locks.
pub struct Engine {
    bookings: Arc<dyn BookingStore>,
    rules: Arc<dyn AvailabilityStore>,
    users: Arc<dyn UserDirectory>,
    resources: Arc<dyn ResourceDirectory>,
    clock: Arc<dyn Clock>,
    /// Local calendar for weekdays, validity dates and slot times.
    tz: FixedOffset,
    locks: LockTable,
    outbox: Outbox,
}

impl Engine {
    /// Build the engine and the worker that delivers its side effects.
    /// The caller decides where the worker runs (`run` or `drain_pending`),
    /// but it must run: the queue between them is unbounded and holds every
    /// undelivered effect.
    pub fn new(ports: &Ports, clock: Arc<dyn Clock>, tz: FixedOffset) -> (Self, OutboxWorker) {
        let (outbox, worker) = outbox::channel(
            ports.users.clone(),
            ports.audit.clone(),
            ports.notifier.clone(),
        );
        let engine = Self {
            bookings: ports.bookings.clone(),
            rules: ports.rules.clone(),
            users: ports.users.clone(),
            resources: ports.resources.clone(),
            clock,
            tz,
            locks: LockTable::default(),
            outbox,
        };
        (engine, worker)
    }

    pub fn tz(&self) -> FixedOffset {
        self.tz
    }

    pub(super) fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub(super) async fn load_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.bookings
            .get_booking(id)
            .await?
            .ok_or(EngineError::booking_not_found(id))
    }

    pub(super) async fn load_rule(&self, id: Ulid) -> Result<AvailabilityRule, EngineError> {
        self.rules
            .get_rule(id)
            .await?
            .ok_or(EngineError::rule_not_found(id))
    }

    pub(super) fn audit(
        &self,
        actor_id: Option<Ulid>,
        action: &str,
        resource_type: &str,
        resource_id: Ulid,
        description: String,
    ) {
        self.outbox.push(SideEffect::Audit(AuditEntry {
            actor_id,
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id,
            description,
            at: self.now(),
        }));
    }
}

/// Count one booking operation by outcome.
pub(super) fn observe<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(crate::observability::BOOKINGS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
}
