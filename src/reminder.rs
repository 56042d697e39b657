use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{FixedOffset, NaiveDate};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::clock::{Clock, local_day_span, local_parts};
use crate::model::*;
use crate::ports::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderConfig {
    /// Local hour (0-23) at which the daily pass runs.
    pub hour: u32,
    /// Wake-up period of the loop; coarser than the hour check is fine.
    pub tick: Duration,
    /// Max notifications in flight during one pass.
    pub concurrency: usize,
    pub tz: FixedOffset,
}

/// Outcome of one reminder pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderReport {
    pub target_date: NaiveDate,
    pub found: usize,
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("clock reading {0} is outside the calendar range")]
    ClockOutOfRange(Ms),
}

/// Why a single reminder was not delivered.
#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown user {0}")]
    UnknownUser(Ulid),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Once a day, reminds every user holding a presence-confirmed booking
/// that starts tomorrow (local calendar).
pub struct ReminderScheduler {
    bookings: Arc<dyn BookingStore>,
    users: Arc<dyn UserDirectory>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: ReminderConfig,
    /// Shared by the periodic loop and `run_now`; at most one pass at a time.
    in_flight: Mutex<()>,
    last_fired: StdMutex<Option<NaiveDate>>,
    last_report: StdMutex<Option<ReminderReport>>,
    cancel: CancellationToken,
}

impl ReminderScheduler {
    pub fn new(ports: &Ports, clock: Arc<dyn Clock>, config: ReminderConfig) -> Arc<Self> {
        Arc::new(Self {
            bookings: ports.bookings.clone(),
            users: ports.users.clone(),
            notifier: ports.notifier.clone(),
            clock,
            config,
            in_flight: Mutex::new(()),
            last_fired: StdMutex::new(None),
            last_report: StdMutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the periodic loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_loop().await })
    }

    /// Ask the loop to exit after its current wait. A pass already running
    /// is allowed to finish.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run a pass for tomorrow right away, waiting for any pass in flight.
    /// Inside the configured hour this counts as the day's scheduled pass;
    /// earlier in the day the scheduled pass still runs.
    pub async fn run_now(&self) -> Result<ReminderReport, SchedulerError> {
        let now = self.clock.now_ms();
        let parts = local_parts(now, &self.config.tz).ok_or(SchedulerError::ClockOutOfRange(now))?;
        let target = parts.date.succ_opt().ok_or(SchedulerError::ClockOutOfRange(now))?;

        let _guard = self.in_flight.lock().await;
        let report = self.pass(target).await?;
        if parts.hour == self.config.hour {
            self.mark_fired(parts.date);
        }
        Ok(report)
    }

    /// Run a pass for an explicit local date.
    pub async fn remind_for(&self, target_date: NaiveDate) -> Result<ReminderReport, SchedulerError> {
        let _guard = self.in_flight.lock().await;
        Ok(self.pass(target_date).await?)
    }

    pub fn last_report(&self) -> Option<ReminderReport> {
        self.last_report.lock().ok().and_then(|r| *r)
    }

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(self.config.tick);
        info!(hour = self.config.hour, tick_secs = self.config.tick.as_secs(), "reminder scheduler started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick().await;
        }
        info!("reminder scheduler stopped");
    }

    /// One wake-up: fire only during the configured hour, once per day, and
    /// never while another pass is running.
    pub(crate) async fn tick(&self) -> Option<ReminderReport> {
        let parts = local_parts(self.clock.now_ms(), &self.config.tz)?;
        if parts.hour != self.config.hour {
            return None;
        }
        if self.last_fired.lock().ok().and_then(|d| *d) == Some(parts.date) {
            debug!(date = %parts.date, "reminders already sent today");
            return None;
        }
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("reminder pass in flight, skipping tick");
            return None;
        };

        let target = parts.date.succ_opt()?;
        match self.pass(target).await {
            Ok(report) => {
                self.mark_fired(parts.date);
                Some(report)
            }
            Err(e) => {
                // Not marked as fired: the next tick within the hour retries.
                error!("reminder pass failed: {e}");
                None
            }
        }
    }

    fn mark_fired(&self, date: NaiveDate) {
        if let Ok(mut last) = self.last_fired.lock() {
            *last = Some(date);
        }
    }

    async fn pass(&self, target_date: NaiveDate) -> Result<ReminderReport, StoreError> {
        let started = Instant::now();
        let window = local_day_span(target_date, &self.config.tz);
        let due = self
            .bookings
            .bookings_starting_in(window, BookingStatus::PresenceConfirmed)
            .await?;
        let found = due.len();

        let sent = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let (sent_ref, failed_ref) = (&sent, &failed);
        futures::stream::iter(due)
            .for_each_concurrent(self.config.concurrency.max(1), |booking| async move {
                match self.remind_one(&booking).await {
                    Ok(()) => {
                        sent_ref.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL).increment(1);
                    }
                    Err(e) => {
                        warn!(booking_id = %booking.id, user_id = %booking.user_id, "reminder failed: {e}");
                        failed_ref.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(crate::observability::REMINDERS_FAILED_TOTAL).increment(1);
                    }
                }
            })
            .await;

        let report = ReminderReport {
            target_date,
            found,
            sent: sent.into_inner(),
            failed: failed.into_inner(),
        };
        metrics::histogram!(crate::observability::REMINDER_PASS_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        info!(date = %target_date, found, sent = report.sent, failed = report.failed, "reminder pass done");
        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report);
        }
        Ok(report)
    }

    async fn remind_one(&self, booking: &Booking) -> Result<(), DispatchError> {
        let user = self
            .users
            .get_user(booking.user_id)
            .await?
            .ok_or(DispatchError::UnknownUser(booking.user_id))?;
        self.notifier.send_booking_reminder(&user, booking).await?;
        Ok(())
    }
}
