use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, FixedOffset, Local, Utc};

/// Wall-clock source for agents. Time-of-day reasoning uses the offset
/// carried by the returned timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;

    fn now_utc(&self) -> DateTime<Utc> {
        self.now().with_timezone(&Utc)
    }
}

/// System time in the local zone, or in a fixed offset when configured.
#[derive(Debug, Clone, Default)]
pub struct SystemClock {
    offset: Option<FixedOffset>,
}

impl SystemClock {
    pub fn with_offset_minutes(minutes: Option<i32>) -> Self {
        Self {
            offset: minutes.and_then(|m| FixedOffset::east_opt(m * 60)),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        match self.offset {
            Some(offset) => Utc::now().with_timezone(&offset),
            None => {
                let local = Local::now();
                local.with_timezone(local.offset())
            }
        }
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<FixedOffset>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<FixedOffset>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = DateTime::parse_from_rfc3339("2026-03-02T09:00:00+01:00").unwrap();
        let clock = ManualClock::new(start);
        let shared = clock.clone();
        clock.advance(Duration::minutes(90));
        assert_eq!(shared.now().to_rfc3339(), "2026-03-02T10:30:00+01:00");
        assert_eq!(shared.now_utc().to_rfc3339(), "2026-03-02T09:30:00+00:00");
    }

    #[test]
    fn fixed_offset_system_clock() {
        let clock = SystemClock::with_offset_minutes(Some(-300));
        assert_eq!(clock.now().offset().local_minus_utc(), -300 * 60);
    }
}
