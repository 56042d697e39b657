use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Timelike, Utc};

use crate::model::{DAY_MS, Ms, Span, WallTime};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

// ── Local calendar ───────────────────────────────────────────────

/// An instant broken down on the local wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalParts {
    pub date: NaiveDate,
    /// 0 = Sunday.
    pub weekday: u8,
    pub time: WallTime,
    pub hour: u32,
}

pub fn local_datetime(t: Ms, tz: &FixedOffset) -> Option<DateTime<FixedOffset>> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.with_timezone(tz))
}

/// `None` only for instants outside chrono's representable range.
pub fn local_parts(t: Ms, tz: &FixedOffset) -> Option<LocalParts> {
    let dt = local_datetime(t, tz)?;
    let hour = dt.hour();
    let time = u16::try_from(hour * 60 + dt.minute())
        .ok()
        .and_then(WallTime::from_minutes)?;
    let weekday = u8::try_from(dt.weekday().num_days_from_sunday()).ok()?;
    Some(LocalParts {
        date: dt.date_naive(),
        weekday,
        time,
        hour,
    })
}

pub fn local_midnight(date: NaiveDate, tz: &FixedOffset) -> Ms {
    let utc_wall = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    utc_wall - Ms::from(tz.local_minus_utc()) * 1000
}

/// The instant at `time` on local `date`.
pub fn local_instant(date: NaiveDate, time: WallTime, tz: &FixedOffset) -> Ms {
    local_midnight(date, tz) + time.as_ms()
}

/// `[startOfDay, endOfDay)` of a local calendar date.
pub fn local_day_span(date: NaiveDate, tz: &FixedOffset) -> Span {
    let start = local_midnight(date, tz);
    Span::new(start, start + DAY_MS)
}
