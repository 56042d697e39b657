//! Collaborator interfaces the engine is written against.
//!
//! Stores and directories must be read-your-writes consistent: every
//! decision the engine makes re-reads current state through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Storage-level backstop: another open booking already holds the span.
    #[error("span already taken by booking {0}")]
    Conflict(Ulid),
    #[error("record not found: {0}")]
    NotFound(Ulid),
    #[error("WAL error: {0}")]
    Wal(String),
}

/// Failure of a best-effort collaborator (notifier, audit sink).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    /// Must reject a booking overlapping another open booking on the same resource.
    async fn insert_booking(&self, booking: &Booking) -> Result<(), StoreError>;

    /// Replace the stored record in one write. Same overlap backstop as insert
    /// when the booking is open.
    async fn update_booking(&self, booking: &Booking) -> Result<(), StoreError>;

    /// Open bookings on `resource_id` whose span overlaps `span`.
    async fn open_bookings_overlapping(
        &self,
        resource_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Every open booking held by the user.
    async fn open_bookings_for_user(&self, user_id: Ulid) -> Result<Vec<Booking>, StoreError>;

    async fn count_open_bookings_for_user(&self, user_id: Ulid) -> Result<usize, StoreError> {
        Ok(self.open_bookings_for_user(user_id).await?.len())
    }

    /// Bookings with `status` whose start falls in `window`, ordered by start.
    async fn bookings_starting_in(
        &self,
        window: Span,
        status: BookingStatus,
    ) -> Result<Vec<Booking>, StoreError>;
}

#[async_trait]
pub trait AvailabilityStore: Send + Sync {
    async fn get_rule(&self, id: Ulid) -> Result<Option<AvailabilityRule>, StoreError>;

    async fn insert_rule(&self, rule: &AvailabilityRule) -> Result<(), StoreError>;

    async fn update_rule(&self, rule: &AvailabilityRule) -> Result<(), StoreError>;

    async fn delete_rule(&self, id: Ulid) -> Result<(), StoreError>;

    /// All rules (active or not) of a resource, ordered by day then start time.
    async fn rules_for_resource(&self, resource_id: Ulid) -> Result<Vec<AvailabilityRule>, StoreError>;

    async fn rules_for_resource_day(
        &self,
        resource_id: Ulid,
        day_of_week: u8,
    ) -> Result<Vec<AvailabilityRule>, StoreError> {
        let mut rules = self.rules_for_resource(resource_id).await?;
        rules.retain(|r| r.day_of_week == day_of_week);
        Ok(rules)
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, id: Ulid) -> Result<Option<User>, StoreError>;
}

#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn get_resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError>;
}

/// Fire-and-forget audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<(), DeliveryError>;
}

/// Best-effort user notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_booking_confirmation(&self, user: &User, booking: &Booking) -> Result<(), DeliveryError>;

    async fn send_booking_cancellation(
        &self,
        user: &User,
        booking: &Booking,
        reason: Option<&str>,
    ) -> Result<(), DeliveryError>;

    async fn send_booking_reminder(&self, user: &User, booking: &Booking) -> Result<(), DeliveryError>;
}

/// Every collaborator the engine and the reminder scheduler need.
#[derive(Clone)]
pub struct Ports {
    pub bookings: Arc<dyn BookingStore>,
    pub rules: Arc<dyn AvailabilityStore>,
    pub users: Arc<dyn UserDirectory>,
    pub resources: Arc<dyn ResourceDirectory>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn Notifier>,
}

impl Ports {
    /// Wire one store that serves every persistence port.
    pub fn from_store<S>(store: Arc<S>, audit: Arc<dyn AuditSink>, notifier: Arc<dyn Notifier>) -> Self
    where
        S: BookingStore + AvailabilityStore + UserDirectory + ResourceDirectory + 'static,
    {
        Self {
            bookings: store.clone(),
            rules: store.clone(),
            users: store.clone(),
            resources: store,
            audit,
            notifier,
        }
    }
}
