//! Walks time in fixed-size windows that never reach past `now - lag`.

use crate::clock::{earlier, later, SharedClock};
use crate::http::retry::sleep_or_stop;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Half-open `[start, end)` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StepperSettings {
    /// Window size
    pub frequency: Duration,
    pub lag: Duration,
    /// Start this far in the past instead of at `now - max(lag, frequency)`
    pub start_time: Duration,
    /// Oldest data the source can still serve
    pub horizon: Option<Duration>,
}

impl StepperSettings {
    pub fn new(frequency: Duration, lag: Duration) -> Self {
        Self {
            frequency,
            lag,
            start_time: Duration::ZERO,
            horizon: None,
        }
    }

    pub fn start_time_hours(mut self, hours: u64) -> Self {
        self.start_time = Duration::from_secs(hours * 3600);
        self
    }

    pub fn horizon(mut self, horizon: Duration) -> Self {
        self.horizon = Some(horizon);
        self
    }
}

#[derive(Debug)]
pub struct TimeStepper {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    frequency: Duration,
    lag: Duration,
    max_sleep: Duration,
    clock: SharedClock,
    stop: CancellationToken,
}

impl TimeStepper {
    pub fn new(settings: StepperSettings, clock: SharedClock, stop: CancellationToken) -> Self {
        let now = clock.now();
        let frequency = settings.frequency;

        let (mut start, mut end) = if settings.start_time.is_zero() {
            let end = earlier(now, settings.lag.max(frequency));
            (earlier(end, frequency), end)
        } else {
            let start = earlier(now, settings.start_time);
            (start, later(start, frequency))
        };

        if let Some(horizon) = settings.horizon {
            let oldest = earlier(now, horizon);
            if start < oldest {
                tracing::info!(
                    requested = %start,
                    clamped = %oldest,
                    "Start time is beyond the source horizon, clamping"
                );
                start = oldest;
                end = later(start, frequency);
            }
        }

        Self::from_parts(start, end, settings, clock, stop)
    }

    /// Continue from the end of the last processed window.
    pub fn resume_from(
        last_end: DateTime<Utc>,
        settings: StepperSettings,
        clock: SharedClock,
        stop: CancellationToken,
    ) -> Self {
        let end = later(last_end, settings.frequency);
        Self::from_parts(last_end, end, settings, clock, stop)
    }

    fn from_parts(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        settings: StepperSettings,
        clock: SharedClock,
        stop: CancellationToken,
    ) -> Self {
        Self {
            start,
            end,
            frequency: settings.frequency,
            lag: settings.lag,
            max_sleep: settings.frequency.saturating_add(Duration::from_secs(1)),
            clock,
            stop,
        }
    }

    /// The window the next call will yield.
    pub fn peek(&self) -> Window {
        Window {
            start: self.start,
            end: self.end,
        }
    }

    /// Yield the next window if it is already fully in the past.
    pub fn try_next(&mut self) -> Option<Window> {
        if self.end > earlier(self.clock.now(), self.lag) {
            return None;
        }
        Some(self.advance())
    }

    /// Wait until the next window is complete and yield it. `None` on stop.
    pub async fn next_range(&mut self) -> Option<Window> {
        loop {
            if self.stop.is_cancelled() {
                return None;
            }
            let available = earlier(self.clock.now(), self.lag);
            if self.end <= available {
                return Some(self.advance());
            }

            let wait = (self.end - available)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.max_sleep);
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Waiting for window to close");
            if !sleep_or_stop(wait, &self.stop).await {
                return None;
            }
        }
    }

    /// Endless sequence of windows; ends only when the stop token fires.
    pub fn ranges(self) -> impl Stream<Item = Window> {
        stream::unfold(self, |mut stepper| async move {
            let window = stepper.next_range().await?;
            Some((window, stepper))
        })
    }

    fn advance(&mut self) -> Window {
        let window = self.peek();
        self.start = self.end;
        self.end = later(self.end, self.frequency);
        window
    }
}
