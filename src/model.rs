use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Every slot and every booking is exactly this long.
pub const SLOT_MINUTES: u16 = 30;
pub const SLOT_MS: Ms = SLOT_MINUTES as Ms * MINUTE_MS;

/// Minimum notice required to cancel a booking.
pub const CANCELLATION_NOTICE_MS: Ms = 3 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// The single-slot span beginning at `start`.
    pub fn slot(start: Ms) -> Self {
        Self::new(start, start + SLOT_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Wall-clock time ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid wall-clock time {input:?}: expected HH:MM")]
pub struct FormatError {
    pub input: String,
}

/// Local time of day with minute precision, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WallTime(u16);

impl WallTime {
    pub const MIDNIGHT: WallTime = WallTime(0);

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes < 24 * 60).then_some(Self(minutes))
    }

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self(hour * 60 + minute))
        } else {
            None
        }
    }

    /// Parse a strict `HH:MM` string (two digits each, 00:00 through 23:59).
    pub fn parse(input: &str) -> Result<Self, FormatError> {
        let err = || FormatError {
            input: input.to_string(),
        };
        let (h, m) = input.split_once(':').ok_or_else(err)?;
        let two_digits = |s: &str| s.len() == 2 && s.bytes().all(|b| b.is_ascii_digit());
        if !two_digits(h) || !two_digits(m) {
            return Err(err());
        }
        let hour: u16 = h.parse().map_err(|_| err())?;
        let minute: u16 = m.parse().map_err(|_| err())?;
        Self::from_hm(hour, minute).ok_or_else(err)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    /// Offset from local midnight.
    pub fn as_ms(self) -> Ms {
        Ms::from(self.0) * MINUTE_MS
    }

    /// Add minutes, returning `None` past the end of the day.
    pub fn checked_add_minutes(self, minutes: u16) -> Option<Self> {
        self.0.checked_add(minutes).and_then(Self::from_minutes)
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for WallTime {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Users and resources (owned elsewhere, read here) ─────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub approval: ApprovalStatus,
}

impl User {
    pub fn is_approved(&self) -> bool {
        self.approval == ApprovalStatus::Approved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Active,
    Inactive,
}

/// A bookable chair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: Option<String>,
    pub status: ResourceStatus,
}

impl Resource {
    pub fn is_active(&self) -> bool {
        self.status == ResourceStatus::Active
    }
}

// ── Availability rules ───────────────────────────────────────────

/// A recurring weekly window during which a resource may be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub resource_id: Ulid,
    /// 0 = Sunday through 6 = Saturday.
    pub day_of_week: u8,
    pub start_time: WallTime,
    pub end_time: WallTime,
    /// Inclusive; `None` is unbounded.
    pub valid_from: Option<NaiveDate>,
    /// Inclusive; `None` is unbounded.
    pub valid_to: Option<NaiveDate>,
    pub active: bool,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Scheduled,
    PresenceConfirmed,
    Completed,
    Cancelled,
    NoShow,
}

/// The status-changing operations of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    ConfirmPresence,
    Complete,
    Cancel,
    MarkNoShow,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    /// Non-terminal bookings hold their slot.
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }

    /// Target status of `transition`, or `None` if it is not allowed from `self`.
    pub fn transition(self, transition: Transition) -> Option<BookingStatus> {
        use BookingStatus::*;
        match (self, transition) {
            (Scheduled, Transition::ConfirmPresence) => Some(PresenceConfirmed),
            (PresenceConfirmed, Transition::ConfirmPresence) => None,
            (Scheduled | PresenceConfirmed, Transition::Complete) => Some(Completed),
            (Scheduled | PresenceConfirmed, Transition::Cancel) => Some(Cancelled),
            (Scheduled | PresenceConfirmed, Transition::MarkNoShow) => Some(NoShow),
            (Completed | Cancelled | NoShow, _) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::PresenceConfirmed => "presence_confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Transition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfirmPresence => "confirm_presence",
            Self::Complete => "complete",
            Self::Cancel => "cancel",
            Self::MarkNoShow => "mark_no_show",
        }
    }
}

/// A reservation of one slot on one resource by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub resource_id: Ulid,
    /// Always exactly one slot long.
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn start(&self) -> Ms {
        self.span.start
    }

    pub fn end(&self) -> Ms {
        self.span.end
    }

    /// Move the booking; the end is recomputed from the new start.
    pub fn set_start(&mut self, start: Ms) {
        self.span = Span::slot(start);
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

// ── Audit ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor_id: Option<Ulid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Ulid,
    pub description: String,
    pub at: Ms,
}

/// The durable record format, one per WAL entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserUpserted(User),
    ResourceUpserted(Resource),
    RuleSaved(AvailabilityRule),
    RuleDeleted { id: Ulid, resource_id: Ulid },
    BookingSaved(Booking),
}
