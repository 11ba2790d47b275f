use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock pinned to a start instant and advanced by the tokio clock.
///
/// Under `#[tokio::test(start_paused = true)]` the tokio clock only moves when
/// the runtime is idle or `tokio::time::advance` is called, so wall time and
/// timers stay in lockstep.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: DateTime<Utc>,
    anchor: Instant,
}

impl MockClock {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start,
            anchor: Instant::now(),
        }
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().duration_since(self.anchor);
        self.start + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

/// Convert a std duration to chrono, saturating on overflow.
pub fn chrono_duration(d: std::time::Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(d).unwrap_or(chrono::TimeDelta::MAX)
}

/// `at - d`, clamped to the earliest representable instant.
pub fn earlier(at: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    at.checked_sub_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `at + d`, clamped to the latest representable instant.
pub fn later(at: DateTime<Utc>, d: std::time::Duration) -> DateTime<Utc> {
    at.checked_add_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_mock_clock_follows_tokio_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = MockClock::starting_at(start);
        assert_eq!(clock.now(), start);

        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn test_huge_offsets_clamp_instead_of_overflowing() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(earlier(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(later(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            earlier(now, Duration::from_secs(60)),
            now - chrono::Duration::seconds(60)
        );
        assert_eq!(
            earlier(now, Duration::from_secs(3_000_000 * 365 * 86_400)),
            DateTime::<Utc>::MIN_UTC
        );
    }
}
