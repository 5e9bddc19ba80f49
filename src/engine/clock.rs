use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use std::sync::Mutex;
use std::time::Duration;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

/// Wall-clock time and sleeping, injectable so tests can simulate elapsed time.
///
/// `now` returns naive local time, which is what the forecast service uses.
pub trait Clock: Send + Sync {
    fn now(&self) -> PrimitiveDateTime;
    fn sleep(&self, duration: Duration);
}

/// Local wall clock. The zone offset is looked up on every reading, so
/// daylight-saving changes take effect while the bridge runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        naive_to_primitive(Local::now().naive_local()).unwrap_or_else(|| {
            let now = OffsetDateTime::now_utc();
            PrimitiveDateTime::new(now.date(), now.time())
        })
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Convert a chrono local reading. A leap-second nanosecond value is clamped
/// into the last second.
pub fn naive_to_primitive(local: NaiveDateTime) -> Option<PrimitiveDateTime> {
    let month = Month::try_from(u8::try_from(local.month()).ok()?).ok()?;
    let date = Date::from_calendar_date(local.year(), month, u8::try_from(local.day()).ok()?).ok()?;
    let time = Time::from_hms_nano(
        u8::try_from(local.hour()).ok()?,
        u8::try_from(local.minute()).ok()?,
        u8::try_from(local.second()).ok()?,
        local.nanosecond().min(999_999_999),
    )
    .ok()?;
    Some(PrimitiveDateTime::new(date, time))
}

/// Simulated clock: time only moves when advanced or slept.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<PrimitiveDateTime>,
    slept: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(start: PrimitiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
            slept: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now = *now + duration;
        }
    }

    /// Total time spent in `sleep`.
    pub fn slept(&self) -> Duration {
        self.slept.lock().map(|slept| *slept).unwrap_or_default()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> PrimitiveDateTime {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            *slept += duration;
        }
        self.advance(duration);
    }
}
