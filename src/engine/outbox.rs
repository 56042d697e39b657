use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{AuditEntry, Booking};
use crate::ports::{AuditSink, DeliveryError, Notifier, UserDirectory};

/// A best-effort effect queued after a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    Audit(AuditEntry),
    Confirmation { booking: Booking },
    Cancellation { booking: Booking, reason: Option<String> },
}

impl SideEffect {
    fn kind(&self) -> &'static str {
        match self {
            SideEffect::Audit(_) => "audit",
            SideEffect::Confirmation { .. } => "confirmation",
            SideEffect::Cancellation { .. } => "cancellation",
        }
    }
}

/// Sending half, owned by the engine. Never blocks and never fails the caller.
/// The queue is unbounded, so an `OutboxWorker` has to be draining it.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<SideEffect>,
}

impl Outbox {
    pub fn push(&self, effect: SideEffect) {
        if let Err(mpsc::error::SendError(effect)) = self.tx.send(effect) {
            warn!(kind = effect.kind(), "outbox closed, dropping side effect");
            metrics::counter!(crate::observability::SIDE_EFFECT_FAILURES_TOTAL, "kind" => effect.kind())
                .increment(1);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutboxStats {
    pub delivered: usize,
    pub failed: usize,
}

/// Receiving half: delivers queued effects to the audit sink and notifier.
pub struct OutboxWorker {
    rx: mpsc::UnboundedReceiver<SideEffect>,
    users: Arc<dyn UserDirectory>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
}

pub fn channel(
    users: Arc<dyn UserDirectory>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
) -> (Outbox, OutboxWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Outbox { tx },
        OutboxWorker {
            rx,
            users,
            audit,
            notifier,
        },
    )
}

impl OutboxWorker {
    /// Deliver effects until every sender is gone or `cancel` fires.
    /// On cancellation, whatever is already queued is still delivered.
    pub async fn run(mut self, cancel: CancellationToken) -> OutboxStats {
        let mut stats = OutboxStats::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let drained = self.drain_pending().await;
                    stats.delivered += drained.delivered;
                    stats.failed += drained.failed;
                    break;
                }
                effect = self.rx.recv() => match effect {
                    Some(effect) => self.tally(effect, &mut stats).await,
                    None => break,
                },
            }
        }
        debug!(delivered = stats.delivered, failed = stats.failed, "outbox worker stopped");
        stats
    }

    /// Deliver everything queued right now, then return.
    pub async fn drain_pending(&mut self) -> OutboxStats {
        let mut stats = OutboxStats::default();
        while let Ok(effect) = self.rx.try_recv() {
            self.tally(effect, &mut stats).await;
        }
        stats
    }

    async fn tally(&self, effect: SideEffect, stats: &mut OutboxStats) {
        let kind = effect.kind();
        match self.deliver(effect).await {
            Ok(()) => stats.delivered += 1,
            Err(e) => {
                warn!(kind, "side effect failed: {e}");
                metrics::counter!(crate::observability::SIDE_EFFECT_FAILURES_TOTAL, "kind" => kind)
                    .increment(1);
                stats.failed += 1;
            }
        }
    }

    async fn deliver(&self, effect: SideEffect) -> Result<(), DeliveryError> {
        match effect {
            SideEffect::Audit(entry) => self.audit.record(&entry).await,
            SideEffect::Confirmation { booking } => {
                let user = self.lookup_user(&booking).await?;
                self.notifier.send_booking_confirmation(&user, &booking).await
            }
            SideEffect::Cancellation { booking, reason } => {
                let user = self.lookup_user(&booking).await?;
                self.notifier
                    .send_booking_cancellation(&user, &booking, reason.as_deref())
                    .await
            }
        }
    }

    async fn lookup_user(&self, booking: &Booking) -> Result<crate::model::User, DeliveryError> {
        self.users
            .get_user(booking.user_id)
            .await
            .map_err(|e| DeliveryError(e.to_string()))?
            .ok_or_else(|| DeliveryError(format!("unknown user {}", booking.user_id)))
    }
}
