//! In-memory collaborator doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;
use crate::ports::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Confirmation(Ulid),
    Cancellation(Ulid, Option<String>),
    Reminder(Ulid),
}

/// Records every notification; fails for users registered with `fail_for`.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
    failing: Mutex<HashSet<Ulid>>,
}

impl RecordingNotifier {
    pub fn fail_for(&self, user_id: Ulid) {
        self.failing.lock().unwrap().insert(user_id);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn reminders(&self) -> Vec<Ulid> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Reminder(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn deliver(&self, user: &User, what: Sent) -> Result<(), DeliveryError> {
        if self.failing.lock().unwrap().contains(&user.id) {
            return Err(DeliveryError(format!("mailbox of {} unavailable", user.id)));
        }
        self.sent.lock().unwrap().push(what);
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_booking_confirmation(&self, user: &User, booking: &Booking) -> Result<(), DeliveryError> {
        self.deliver(user, Sent::Confirmation(booking.id))
    }

    async fn send_booking_cancellation(
        &self,
        user: &User,
        booking: &Booking,
        reason: Option<&str>,
    ) -> Result<(), DeliveryError> {
        self.deliver(user, Sent::Cancellation(booking.id, reason.map(str::to_string)))
    }

    async fn send_booking_reminder(&self, user: &User, booking: &Booking) -> Result<(), DeliveryError> {
        self.deliver(user, Sent::Reminder(booking.id))
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    entries: Mutex<Vec<AuditEntry>>,
    broken: Mutex<bool>,
}

impl RecordingAudit {
    pub fn break_sink(&self) {
        *self.broken.lock().unwrap() = true;
    }

    pub fn actions(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.action.clone())
            .collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, entry: &AuditEntry) -> Result<(), DeliveryError> {
        if *self.broken.lock().unwrap() {
            return Err(DeliveryError("audit store offline".into()));
        }
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}
