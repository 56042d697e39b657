//! Tracing-backed collaborators used by the daemon.

use async_trait::async_trait;
use tracing::info;

use crate::model::{AuditEntry, Booking, User};
use crate::ports::{AuditSink, DeliveryError, Notifier};

/// Writes each audit entry as one JSON log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, entry: &AuditEntry) -> Result<(), DeliveryError> {
        let line = serde_json::to_string(entry).map_err(|e| DeliveryError(e.to_string()))?;
        info!(target: "chairbook::audit", "{line}");
        Ok(())
    }
}

/// Logs notifications instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_booking_confirmation(&self, user: &User, booking: &Booking) -> Result<(), DeliveryError> {
        info!(user_id = %user.id, booking_id = %booking.id, start = booking.start(), "notify: booking confirmed");
        Ok(())
    }

    async fn send_booking_cancellation(
        &self,
        user: &User,
        booking: &Booking,
        reason: Option<&str>,
    ) -> Result<(), DeliveryError> {
        info!(user_id = %user.id, booking_id = %booking.id, reason = reason.unwrap_or("-"), "notify: booking cancelled");
        Ok(())
    }

    async fn send_booking_reminder(&self, user: &User, booking: &Booking) -> Result<(), DeliveryError> {
        info!(user_id = %user.id, booking_id = %booking.id, start = booking.start(), "notify: booking tomorrow");
        Ok(())
    }
}
